//! UID-based firewall chains in the kernel filter table.
//!
//! Two operating modes: blacklist (default allow, explicit per-UID DROP)
//! and whitelist (default reject, explicit per-UID RETURN). The dozable and
//! standby child chains carry their own fixed mode and can be attached or
//! detached without touching their contents. Whole-chain UID replacement
//! goes through the filter table's atomic restore so observers only ever
//! see the old chain or the new chain, never a partial one.

use thiserror::Error as ThisError;

use crate::routing;
use crate::routing::{FilterOps, IptablesTarget};

pub const LOCAL_INPUT: &str = "fw_INPUT";
pub const LOCAL_OUTPUT: &str = "fw_OUTPUT";
pub const LOCAL_FORWARD: &str = "fw_FORWARD";

pub const LOCAL_DOZABLE: &str = "fw_dozable";
pub const LOCAL_STANDBY: &str = "fw_standby";

/// First UID of the application range; everything below is a system UID.
pub const AID_APP: u32 = 10000;

/// ICMPv6 types any form of IPv6 connectivity needs. The child chains hang
/// off both input and output, so this covers packets we must send (RS, NS)
/// and packets we must receive (RA, NA).
const ICMPV6_TYPES: &[&str] = &[
    "packet-too-big",
    "router-solicitation",
    "router-advertisement",
    "neighbour-solicitation",
    "neighbour-advertisement",
    "redirect",
];

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Filter(#[from] routing::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallMode {
    Whitelist,
    Blacklist,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildChain {
    None,
    Dozable,
    Standby,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirewallRule {
    Allow,
    Deny,
}

pub struct FirewallController<F> {
    filter: F,
    mode: FirewallMode,
}

impl<F: FilterOps> FirewallController<F> {
    pub fn new(filter: F) -> Self {
        // With no rules installed the kernel allows everything, which is
        // what blacklist mode means.
        FirewallController {
            filter,
            mode: FirewallMode::Blacklist,
        }
    }

    pub fn mode(&self) -> FirewallMode {
        self.mode
    }

    /// The mode governing a chain: the child chains are fixed, the main
    /// chains follow the controller.
    pub fn mode_for_chain(&self, chain: ChildChain) -> FirewallMode {
        match chain {
            ChildChain::Dozable => FirewallMode::Whitelist,
            ChildChain::Standby => FirewallMode::Blacklist,
            ChildChain::None => self.mode,
        }
    }

    /// Creates the child chains fresh. They are not attached here; the
    /// framework toggles them explicitly.
    pub async fn setup_hooks(&self) -> Result<(), Error> {
        self.create_child_chain(LOCAL_DOZABLE, FirewallMode::Whitelist).await?;
        self.create_child_chain(LOCAL_STANDBY, FirewallMode::Blacklist).await?;
        Ok(())
    }

    /// Switches the firewall mode, flushing all rules and re-seeding the
    /// default-drop rules for whitelist mode.
    pub async fn enable(&mut self, mode: FirewallMode) -> Result<(), Error> {
        self.flush_main_chains().await?;

        if mode == FirewallMode::Whitelist {
            self.filter
                .exec(IptablesTarget::Both, &["-A", LOCAL_INPUT, "-j", "DROP"])
                .await?;
            self.filter
                .exec(IptablesTarget::Both, &["-A", LOCAL_OUTPUT, "-j", "REJECT"])
                .await?;
            self.filter
                .exec(IptablesTarget::Both, &["-A", LOCAL_FORWARD, "-j", "REJECT"])
                .await?;
        }

        self.mode = mode;
        tracing::info!(?mode, "firewall enabled");
        Ok(())
    }

    pub async fn disable(&mut self) -> Result<(), Error> {
        self.flush_main_chains().await?;
        self.mode = FirewallMode::Blacklist;
        tracing::info!("firewall disabled");
        Ok(())
    }

    /// Attaches or detaches a child chain without altering its contents.
    pub async fn enable_child_chain(&self, chain: ChildChain, enable: bool) -> Result<(), Error> {
        let name = match chain {
            ChildChain::Dozable => LOCAL_DOZABLE,
            ChildChain::Standby => LOCAL_STANDBY,
            ChildChain::None => return Ok(()),
        };

        let op = if enable { "-A" } else { "-D" };
        self.filter
            .exec(IptablesTarget::Both, &[op, LOCAL_INPUT, "-j", name])
            .await?;
        self.filter
            .exec(IptablesTarget::Both, &[op, LOCAL_OUTPUT, "-j", name])
            .await?;
        Ok(())
    }

    pub async fn set_uid_rule(&self, chain: ChildChain, uid: u32, rule: FirewallRule) -> Result<(), Error> {
        let mode = self.mode_for_chain(chain);
        let (target, op) = match mode {
            FirewallMode::Whitelist => ("RETURN", if rule == FirewallRule::Allow { "-I" } else { "-D" }),
            FirewallMode::Blacklist => ("DROP", if rule == FirewallRule::Deny { "-I" } else { "-D" }),
        };
        let uid_str = uid.to_string();

        match chain {
            ChildChain::Dozable => {
                self.uid_edit(op, LOCAL_DOZABLE, &uid_str, target).await?;
            }
            ChildChain::Standby => {
                self.uid_edit(op, LOCAL_STANDBY, &uid_str, target).await?;
            }
            ChildChain::None => {
                self.uid_edit(op, LOCAL_INPUT, &uid_str, target).await?;
                self.uid_edit(op, LOCAL_OUTPUT, &uid_str, target).await?;
            }
        }
        Ok(())
    }

    /// Replaces a UID chain in one kernel transaction. Either the whole
    /// chain is swapped or nothing changes. Safe with an empty UID list,
    /// which clears the chain but keeps the scaffolding.
    pub async fn replace_uid_chain(&self, name: &str, mode: FirewallMode, uids: &[u32]) -> Result<(), Error> {
        let v4 = make_uid_chain_script(name, mode, uids, IptablesTarget::V4);
        let v6 = make_uid_chain_script(name, mode, uids, IptablesTarget::V6);
        self.filter.restore(IptablesTarget::V4, &v4).await?;
        self.filter.restore(IptablesTarget::V6, &v6).await?;
        tracing::debug!(chain = name, ?mode, uid_count = uids.len(), "replaced uid chain");
        Ok(())
    }

    async fn create_child_chain(&self, name: &str, mode: FirewallMode) -> Result<(), Error> {
        // Order matters, later steps fail otherwise: detach from possible
        // parents, flush, delete, then create fresh.
        for parent in [LOCAL_INPUT, LOCAL_OUTPUT] {
            self.filter
                .exec_silently(IptablesTarget::Both, &["-t", "filter", "-D", parent, "-j", name])
                .await?;
        }
        self.filter
            .exec_silently(IptablesTarget::Both, &["-t", "filter", "-F", name])
            .await?;
        self.filter
            .exec_silently(IptablesTarget::Both, &["-t", "filter", "-X", name])
            .await?;
        self.filter
            .exec(IptablesTarget::Both, &["-t", "filter", "-N", name])
            .await?;

        if mode == FirewallMode::Whitelist {
            for icmp_type in ICMPV6_TYPES {
                self.filter
                    .exec(
                        IptablesTarget::V6,
                        &["-A", name, "-p", "icmpv6", "--icmpv6-type", icmp_type, "-j", "RETURN"],
                    )
                    .await?;
            }

            let system_uids = format!("0-{}", AID_APP - 1);
            self.filter
                .exec(
                    IptablesTarget::Both,
                    &["-A", name, "-m", "owner", "--uid-owner", &system_uids, "-j", "RETURN"],
                )
                .await?;

            self.filter
                .exec(IptablesTarget::Both, &["-A", name, "-j", "DROP"])
                .await?;
        }
        Ok(())
    }

    async fn flush_main_chains(&self) -> Result<(), Error> {
        for chain in [LOCAL_INPUT, LOCAL_OUTPUT, LOCAL_FORWARD] {
            self.filter.exec(IptablesTarget::Both, &["-F", chain]).await?;
        }
        Ok(())
    }

    async fn uid_edit(&self, op: &str, chain: &str, uid: &str, target: &str) -> Result<(), Error> {
        self.filter
            .exec(
                IptablesTarget::Both,
                &[op, chain, "-m", "owner", "--uid-owner", uid, "-j", target],
            )
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn filter(&self) -> &F {
        &self.filter
    }
}

/// One restore script replacing `name` wholesale: chain declaration,
/// preamble, per-UID rules, terminal rule.
fn make_uid_chain_script(name: &str, mode: FirewallMode, uids: &[u32], family: IptablesTarget) -> String {
    let mut script = String::from("*filter\n");
    script.push_str(&format!(":{name} -\n"));

    if mode == FirewallMode::Whitelist {
        if family == IptablesTarget::V6 {
            for icmp_type in ICMPV6_TYPES {
                script.push_str(&format!(
                    "-A {name} -p icmpv6 --icmpv6-type {icmp_type} -j RETURN\n"
                ));
            }
        }
        script.push_str(&format!(
            "-A {name} -m owner --uid-owner 0-{} -j RETURN\n",
            AID_APP - 1
        ));
    }

    let target = match mode {
        FirewallMode::Whitelist => "RETURN",
        FirewallMode::Blacklist => "DROP",
    };
    for uid in uids {
        script.push_str(&format!("-A {name} -m owner --uid-owner {uid} -j {target}\n"));
    }

    match mode {
        FirewallMode::Whitelist => script.push_str(&format!("-A {name} -j DROP\n")),
        FirewallMode::Blacklist => script.push_str(&format!("-A {name} -j RETURN\n")),
    }

    script.push_str("COMMIT\n");
    script
}

// ============================================================================
// Tests
// ============================================================================
