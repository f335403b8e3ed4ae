use clap::Parser;

use std::path::PathBuf;

use netmark_lib::socket;

/// Network mark-and-route daemon - single writer of kernel networking state
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Admin command socket path
    #[arg(
        long,
        env = socket::admin::ENV_VAR,
        default_value = socket::admin::DEFAULT_PATH
    )]
    pub admin_socket: PathBuf,

    /// Fwmark service socket path
    #[arg(
        long,
        env = socket::fwmark::ENV_VAR,
        default_value = socket::fwmark::DEFAULT_PATH
    )]
    pub fwmark_socket: PathBuf,

    /// DNS proxy socket path
    #[arg(
        long,
        env = socket::dnsproxy::ENV_VAR,
        default_value = socket::dnsproxy::DEFAULT_PATH
    )]
    pub dnsproxy_socket: PathBuf,

    /// Log to this file instead of stdout
    #[arg(long, env = "NETMARK_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Skip installing the policy rule ladder at startup (testing only)
    #[arg(long, hide = true)]
    pub skip_rule_ladder: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cli_with_no_arguments() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["netmark"])?;
        assert_eq!(args.admin_socket, PathBuf::from(socket::admin::DEFAULT_PATH));
        assert!(args.log_file.is_none());
        Ok(())
    }

    #[test]
    fn socket_paths_are_overridable() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["netmark", "--admin-socket", "/tmp/admin.sock"])?;
        assert_eq!(args.admin_socket, PathBuf::from("/tmp/admin.sock"));
        Ok(())
    }
}
