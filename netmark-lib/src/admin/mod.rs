//! The admin line protocol and its dispatcher.
//!
//! Privileged framework clients speak a textual protocol over the admin
//! socket: one command per line, `<cookie> <command> <args…>` with
//! shell-like quoting. Replies are `<code> <cookie> <message>`; unsolicited
//! broadcasts are `<code> <message>`. Exactly one command is processed at a
//! time, which is the single-writer discipline every controller relies on.

use thiserror::Error as ThisError;

pub mod command;
pub mod dispatcher;

pub use command::AdminCommand;
pub use dispatcher::{Dispatcher, Reply, ReplyLine};

/// Numeric response classes.
///
/// 100-series: action initiated, expect more output. 200-series: success.
/// 400-series: command accepted but the action failed. 500-series: command
/// rejected. 600-series: unsolicited broadcasts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    ActionInitiated = 100,
    ListResult = 110,
    CommandOkay = 200,
    OperationFailed = 400,
    CommandSyntaxError = 500,
    CommandParameterError = 501,
    InterfaceChange = 600,
    BandwidthControl = 601,
}

impl ResponseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("trailing backslash")]
    TrailingEscape,
}

/// Splits a command line into arguments: whitespace-separated, double
/// quotes group, backslash escapes the next character.
pub fn tokenize(line: &str) -> Result<Vec<String>, Error> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(Error::TrailingEscape),
                }
                in_token = true;
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(Error::UnterminatedQuote);
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() -> anyhow::Result<()> {
        assert_eq!(
            tokenize("network create 100 NONE")?,
            vec!["network", "create", "100", "NONE"]
        );
        assert_eq!(tokenize("  spaced   out  ")?, vec!["spaced", "out"]);
        assert!(tokenize("")?.is_empty());
        Ok(())
    }

    #[test]
    fn quotes_group_and_escapes_pass_through() -> anyhow::Result<()> {
        assert_eq!(tokenize(r#"iface add "my if" rest"#)?, vec!["iface", "add", "my if", "rest"]);
        assert_eq!(tokenize(r#"a\ b c"#)?, vec!["a b", "c"]);
        assert_eq!(tokenize(r#"say \"hi\""#)?, vec!["say", "\"hi\""]);
        // An empty quoted token survives.
        assert_eq!(tokenize(r#"x "" y"#)?, vec!["x", "", "y"]);
        Ok(())
    }

    #[test]
    fn rejects_malformed_quoting() {
        assert!(matches!(tokenize(r#"bad "quote"#), Err(Error::UnterminatedQuote)));
        assert!(matches!(tokenize(r"bad\"), Err(Error::TrailingEscape)));
    }
}
