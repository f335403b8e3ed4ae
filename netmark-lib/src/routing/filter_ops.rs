//! Abstraction over packet-filter edits for testability.
//!
//! Defines [`FilterOps`] covering the two ways the daemon touches
//! netfilter: single `iptables`/`ip6tables` edits and whole-table scripts
//! submitted through the atomic restore mechanism (`iptables-restore`),
//! which replaces a chain in one kernel transaction or not at all.
//!
//! Production code uses [`RealFilterOps`] which shells out via
//! `tokio::process`. Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::Error;

const IPTABLES_PATH: &str = "/sbin/iptables";
const IP6TABLES_PATH: &str = "/sbin/ip6tables";
const IPTABLES_RESTORE_PATH: &str = "/sbin/iptables-restore";
const IP6TABLES_RESTORE_PATH: &str = "/sbin/ip6tables-restore";

/// Which kernel tables an edit applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IptablesTarget {
    V4,
    V6,
    Both,
}

impl IptablesTarget {
    pub(crate) fn families(self) -> &'static [IptablesTarget] {
        match self {
            IptablesTarget::V4 => &[IptablesTarget::V4],
            IptablesTarget::V6 => &[IptablesTarget::V6],
            IptablesTarget::Both => &[IptablesTarget::V4, IptablesTarget::V6],
        }
    }
}

/// Abstraction over packet-filter operations.
#[async_trait]
pub trait FilterOps: Send + Sync + Clone {
    /// Run one filter edit; a non-zero exit is an error.
    async fn exec(&self, target: IptablesTarget, args: &[&str]) -> Result<(), Error>;

    /// Run one filter edit, ignoring failures (used to tear down state that
    /// may not exist).
    async fn exec_silently(&self, target: IptablesTarget, args: &[&str]) -> Result<(), Error>;

    /// Submit a restore script to the given table in one transaction.
    /// Existing chains named in the script are replaced wholesale; chains
    /// not named are untouched.
    async fn restore(&self, target: IptablesTarget, script: &str) -> Result<(), Error>;
}

/// Production [`FilterOps`] that executes the iptables tools.
#[derive(Clone)]
pub struct RealFilterOps;

impl RealFilterOps {
    async fn run_one(binary: &str, args: &[&str]) -> Result<(), Error> {
        let output = Command::new(binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Filter(format!("failed to spawn {binary}: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Filter(format!(
                "{binary} {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )))
        }
    }

    async fn restore_one(binary: &str, script: &str) -> Result<(), Error> {
        let mut child = Command::new(binary)
            .arg("--noflush")
            .arg("-w")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Filter(format!("failed to spawn {binary}: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Filter(format!("{binary}: no stdin handle")))?;
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| Error::Filter(format!("{binary}: error writing script: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Filter(format!("{binary}: wait failed: {e}")))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Filter(format!(
                "{binary} rejected script ({}): {}",
                output.status,
                stderr.trim()
            )))
        }
    }

    fn binary(family: IptablesTarget, restore: bool) -> &'static str {
        match (family, restore) {
            (IptablesTarget::V4, false) => IPTABLES_PATH,
            (IptablesTarget::V6, false) => IP6TABLES_PATH,
            (IptablesTarget::V4, true) => IPTABLES_RESTORE_PATH,
            (IptablesTarget::V6, true) => IP6TABLES_RESTORE_PATH,
            (IptablesTarget::Both, _) => unreachable!("Both is expanded before dispatch"),
        }
    }
}

#[async_trait]
impl FilterOps for RealFilterOps {
    async fn exec(&self, target: IptablesTarget, args: &[&str]) -> Result<(), Error> {
        for family in target.families() {
            Self::run_one(Self::binary(*family, false), args).await?;
        }
        Ok(())
    }

    async fn exec_silently(&self, target: IptablesTarget, args: &[&str]) -> Result<(), Error> {
        for family in target.families() {
            if let Err(e) = Self::run_one(Self::binary(*family, false), args).await {
                tracing::debug!(error = %e, "ignoring filter edit failure");
            }
        }
        Ok(())
    }

    async fn restore(&self, target: IptablesTarget, script: &str) -> Result<(), Error> {
        for family in target.families() {
            Self::restore_one(Self::binary(*family, true), script).await?;
        }
        Ok(())
    }
}
