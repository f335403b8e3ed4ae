//! Fwmark socket plumbing: one command record per connection, with the
//! client's socket fd arriving as SCM_RIGHTS ancillary data.
//!
//! The blocking pieces (recvmsg, the reply write) run under
//! `spawn_blocking`; the mark transition itself takes the controller read
//! lock. The received fd is an `OwnedFd`, so it is closed on every exit
//! path; the client keeps its own copy.

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg, sockopt};

use std::io::{IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::RwLock;
use tokio::task;

use netmark_lib::fwmark::server;

use crate::ProdNetworkController;

pub async fn serve(listener: UnixListener, network: Arc<RwLock<ProdNetworkController>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let network = network.clone();
                tokio::spawn(async move {
                    handle_client(stream, network).await;
                });
            }
            Err(e) => {
                tracing::error!(error = ?e, "error accepting fwmark connection");
            }
        }
    }
}

async fn handle_client(stream: tokio::net::UnixStream, network: Arc<RwLock<ProdNetworkController>>) {
    let uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            tracing::debug!(error = ?e, "cannot read peer credentials");
            return;
        }
    };

    let std_stream = match stream.into_std().and_then(|s| s.set_nonblocking(false).map(|_| s)) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(error = ?e, "cannot prepare fwmark client socket");
            return;
        }
    };

    let (std_stream, received) = match task::spawn_blocking(move || {
        let received = receive_command(&std_stream);
        (std_stream, received)
    })
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!(error = ?e, "fwmark receive worker panicked");
            return;
        }
    };

    let result = match received {
        Ok((bytes, socket_fd)) => process(&bytes, socket_fd, uid, &network).await,
        Err(errno) => Err(errno),
    };

    // Always reply, even on error: the client blocks on this. The
    // connection then closes so a client that never reads cannot fill its
    // buffer and block us.
    let reply = server::encode_reply(&result);
    let _ = task::spawn_blocking(move || {
        let mut stream = &std_stream;
        if let Err(e) = stream.write_all(&reply) {
            tracing::debug!(error = ?e, "error writing fwmark reply");
        }
    })
    .await;
}

async fn process(
    bytes: &[u8],
    socket_fd: Option<OwnedFd>,
    uid: u32,
    network: &Arc<RwLock<ProdNetworkController>>,
) -> Result<(), Errno> {
    // The fd is owned here, so every early return below closes it.
    let socket_fd = socket_fd.ok_or(Errno::EBADF)?;
    let command = server::parse_command(bytes)?;

    let mark_bits = nix::sys::socket::getsockopt(&socket_fd, sockopt::Mark)?;

    let new_mark = {
        let controller = network.read().await;
        server::apply(command, uid, mark_bits, &controller)?
    };

    nix::sys::socket::setsockopt(&socket_fd, sockopt::Mark, &new_mark)?;
    tracing::debug!(uid, command = command.id, mark = format_args!("0x{new_mark:x}"), "socket marked");
    Ok(())
}

/// Reads one command record and the fd from ancillary data.
fn receive_command(stream: &StdUnixStream) -> Result<(Vec<u8>, Option<OwnedFd>), Errno> {
    // One extra byte so an oversized record is detected as EBADMSG by the
    // parser instead of silently truncating.
    let mut buf = [0u8; server::COMMAND_SIZE + 1];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);

    let (bytes_read, socket_fd) = {
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )?;
        if msg.bytes == 0 {
            return Err(Errno::ECONNRESET);
        }

        let mut socket_fd = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    // Take ownership immediately so nothing leaks even if
                    // the client sent more fds than expected.
                    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                    if socket_fd.is_none() {
                        socket_fd = Some(fd);
                    }
                }
            }
        }
        (msg.bytes, socket_fd)
    };

    Ok((buf[..bytes_read].to_vec(), socket_fd))
}
