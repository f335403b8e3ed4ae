use clap::Parser;

use std::path::PathBuf;

use netmark_lib::socket;

/// Admin client for the netmark daemon
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Admin socket path of the running daemon
    #[arg(
        short,
        long,
        env = socket::admin::ENV_VAR,
        default_value = socket::admin::DEFAULT_PATH
    )]
    pub socket_path: PathBuf,

    /// Cookie echoed back in every reply line
    #[arg(long, default_value = "0")]
    pub cookie: String,

    /// The command line to send, e.g. `network create 100`
    #[arg(required = true, num_args = 1..)]
    pub command: Vec<String>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_the_command_words() -> anyhow::Result<()> {
        let args = Cli::try_parse_from(["netmark-ctl", "network", "create", "100"])?;
        assert_eq!(args.command, vec!["network", "create", "100"]);
        assert_eq!(args.cookie, "0");
        Ok(())
    }

    #[test]
    fn requires_a_command() {
        assert!(Cli::try_parse_from(["netmark-ctl"]).is_err());
    }
}
