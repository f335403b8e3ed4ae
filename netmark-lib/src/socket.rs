use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Admin command socket: privileged framework clients, line protocol.
pub mod admin {
    pub const DEFAULT_PATH: &str = "/var/run/netmark/admin.sock";
    pub const ENV_VAR: &str = "NETMARK_ADMIN_SOCKET";
}

/// Fwmark service socket: unprivileged clients passing socket fds.
pub mod fwmark {
    pub const DEFAULT_PATH: &str = "/var/run/netmark/fwmark.sock";
    pub const ENV_VAR: &str = "NETMARK_FWMARK_SOCKET";
}

/// DNS proxy socket: per-network name resolution.
pub mod dnsproxy {
    pub const DEFAULT_PATH: &str = "/var/run/netmark/dnsproxy.sock";
    pub const ENV_VAR: &str = "NETMARK_DNSPROXY_SOCKET";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("error accessing socket at `{socket_path}`: {error}")]
    SocketPathIO { socket_path: PathBuf, error: io::Error },
    #[error("error connecting socket at `{socket_path:?}`: {error:?}")]
    ConnectSocketIO { socket_path: PathBuf, error: io::Error },
    #[error("error writing to socket: {0}")]
    WriteSocketIO(io::Error),
    #[error("error reading from socket: {0}")]
    ReadSocketIO(io::Error),
    #[error("malformed reply line `{0}`")]
    MalformedReply(String),
}

/// Sends one admin command line and collects reply lines up to and
/// including the terminal one (anything outside the 100 continuation
/// class). Unsolicited 600-series lines that race in are skipped.
pub fn process_cmd(socket_path: &Path, cookie: &str, command: &str) -> Result<Vec<String>, Error> {
    check_path(socket_path)?;

    let mut stream = UnixStream::connect(socket_path).map_err(|x| Error::ConnectSocketIO {
        socket_path: socket_path.to_path_buf(),
        error: x,
    })?;

    stream
        .write_all(format!("{cookie} {command}\n").as_bytes())
        .and_then(|_| stream.flush())
        .map_err(Error::WriteSocketIO)?;

    let mut replies = Vec::new();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(Error::ReadSocketIO)?;
        if read == 0 {
            return Err(Error::ReadSocketIO(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before terminal reply",
            )));
        }
        let line = line.trim_end().to_string();
        let code: u16 = line
            .split_whitespace()
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| Error::MalformedReply(line.clone()))?;

        match code {
            600..=699 => continue,
            _ => {
                let terminal = !(100..200).contains(&code);
                replies.push(line);
                if terminal {
                    return Ok(replies);
                }
            }
        }
    }
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(x) => Err(Error::SocketPathIO {
            socket_path: socket_path.to_path_buf(),
            error: x,
        }),
    }
}
