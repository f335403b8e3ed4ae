//! Stateful mocks for the kernel-facing trait abstractions.
//!
//! These track actual state (rules, routes, chain contents) rather than
//! call sequences, so tests assert on the system's state after a lifecycle
//! operation. A `journal`/`edits` log records operation order where the
//! order itself is the contract (install-new-before-delete-old).

#![cfg(test)]

use async_trait::async_trait;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::Error;
use super::filter_ops::{FilterOps, IptablesTarget};
use super::netlink_ops::{NetlinkOps, RouteSpec, RuleSpec};

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub rules: Vec<RuleSpec>,
    pub routes: Vec<RouteSpec>,
    pub links: HashMap<String, u32>,
    /// Ordered record of mutating calls.
    pub journal: Vec<String>,
    /// Map of operation name -> error message. If set, the operation fails.
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self::with_state(NetlinkState::default())
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;
        s.journal.push(format!(
            "rule_add prio={} table={:?} fwmark=0x{:x}/0x{:x}",
            rule.priority, rule.table, rule.fwmark, rule.mask
        ));
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;
        s.journal.push(format!(
            "rule_del prio={} table={:?} fwmark=0x{:x}/0x{:x}",
            rule.priority, rule.table, rule.fwmark, rule.mask
        ));
        let before = s.rules.len();
        // The kernel removes the first rule matching all given selectors.
        if let Some(pos) = s.rules.iter().position(|r| r == rule) {
            s.rules.remove(pos);
        }
        if s.rules.len() == before {
            return Err(Error::General(format!("rule not found: {rule:?}")));
        }
        Ok(())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;
        s.journal.push(format!(
            "route_add table={} dst={}",
            route.table, route.destination
        ));
        let exists = s
            .routes
            .iter()
            .any(|r| r.table == route.table && r.destination == route.destination);
        if exists {
            return Err(Error::RouteExists);
        }
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_del")?;
        s.journal.push(format!(
            "route_del table={} dst={}",
            route.table, route.destination
        ));
        let before = s.routes.len();
        s.routes
            .retain(|r| !(r.table == route.table && r.destination == route.destination));
        if s.routes.len() == before {
            return Err(Error::RouteNotFound);
        }
        Ok(())
    }

    async fn route_flush_table(&self, table: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_flush_table")?;
        s.journal.push(format!("route_flush_table table={table}"));
        s.routes.retain(|r| r.table != table);
        Ok(())
    }

    async fn link_index(&self, name: &str) -> Result<Option<u32>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_index")?;
        Ok(s.links.get(name).copied())
    }
}

// ============================================================================
// MockFilterOps
// ============================================================================

#[derive(Debug, Default)]
pub struct FilterState {
    /// Chain contents per family, keyed by chain name.
    pub chains_v4: HashMap<String, Vec<String>>,
    pub chains_v6: HashMap<String, Vec<String>>,
    /// Every exec'd edit as one line, prefixed with the family.
    pub edits: Vec<String>,
    /// Count of restore transactions applied.
    pub restore_count: u32,
    pub fail_on: HashMap<String, String>,
}

impl FilterState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::Filter(msg.clone()))
        } else {
            Ok(())
        }
    }

    fn chains_mut(&mut self, family: IptablesTarget) -> &mut HashMap<String, Vec<String>> {
        match family {
            IptablesTarget::V4 => &mut self.chains_v4,
            IptablesTarget::V6 => &mut self.chains_v6,
            IptablesTarget::Both => unreachable!("expanded before dispatch"),
        }
    }

    /// Minimal interpretation of a single iptables edit, enough to track
    /// chain contents: -N/-X/-F/-A/-I/-D with an optional leading -t table.
    fn apply_edit(&mut self, family: IptablesTarget, args: &[&str]) -> Result<(), Error> {
        let mut rest = args;
        if rest.first() == Some(&"-t") {
            rest = &rest[2..];
        }
        let (op, chain) = match (rest.first(), rest.get(1)) {
            (Some(op), Some(chain)) => (*op, chain.to_string()),
            _ => return Ok(()),
        };
        let rule = rest[2..].join(" ");
        let chains = self.chains_mut(family);
        match op {
            "-N" => {
                if chains.contains_key(&chain) {
                    return Err(Error::Filter(format!("chain already exists: {chain}")));
                }
                chains.insert(chain, vec![]);
            }
            "-X" => {
                chains.remove(&chain);
            }
            "-F" => {
                chains.entry(chain).or_default().clear();
            }
            // Built-in chains (INPUT, fw_INPUT seeded by init) need no -N
            // here, so appends create chains on demand.
            "-A" => {
                chains.entry(chain).or_default().push(rule);
            }
            "-I" => {
                chains.entry(chain).or_default().insert(0, rule);
            }
            "-D" => {
                let entries = chains
                    .get_mut(&chain)
                    .ok_or_else(|| Error::Filter(format!("no chain {chain}")))?;
                match entries.iter().position(|r| r == &rule) {
                    Some(pos) => {
                        entries.remove(pos);
                    }
                    None => return Err(Error::Filter(format!("no such rule in {chain}: {rule}"))),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Applies a restore script: `:NAME -` resets a chain, `-A NAME rule`
    /// appends. The whole script applies or (on a malformed line) nothing.
    fn apply_restore(&mut self, family: IptablesTarget, script: &str) -> Result<(), Error> {
        let mut staged = self.chains_mut(family).clone();
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line == "COMMIT" || line.starts_with('*') {
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                let name = decl.split_whitespace().next().unwrap_or_default();
                staged.insert(name.to_string(), vec![]);
            } else if let Some(append) = line.strip_prefix("-A ") {
                let mut parts = append.splitn(2, ' ');
                let chain = parts.next().unwrap_or_default().to_string();
                let rule = parts.next().unwrap_or_default().to_string();
                staged
                    .get_mut(&chain)
                    .ok_or_else(|| Error::Filter(format!("restore references unknown chain {chain}")))?
                    .push(rule);
            } else {
                return Err(Error::Filter(format!("unparseable restore line: {line}")));
            }
        }
        *self.chains_mut(family) = staged;
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockFilterOps {
    pub state: Arc<Mutex<FilterState>>,
}

impl MockFilterOps {
    pub fn new() -> Self {
        Self::with_state(FilterState::default())
    }

    pub fn with_state(state: FilterState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn chain_v4(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().chains_v4.get(name).cloned()
    }

    pub fn chain_v6(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().chains_v6.get(name).cloned()
    }
}

#[async_trait]
impl FilterOps for MockFilterOps {
    async fn exec(&self, target: IptablesTarget, args: &[&str]) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("exec")?;
        for family in target.families() {
            s.edits.push(format!("{family:?} {}", args.join(" ")));
            s.apply_edit(*family, args)?;
        }
        Ok(())
    }

    async fn exec_silently(&self, target: IptablesTarget, args: &[&str]) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        for family in target.families() {
            s.edits.push(format!("{family:?} {}", args.join(" ")));
            let _ = s.apply_edit(*family, args);
        }
        Ok(())
    }

    async fn restore(&self, target: IptablesTarget, script: &str) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("restore")?;
        for family in target.families() {
            s.apply_restore(*family, script)?;
        }
        s.restore_count += 1;
        Ok(())
    }
}
