//! Policy routing: the rule ladder and the per-interface route tables.
//!
//! Every network's traffic is steered by a fixed ladder of policy rules,
//! looked up in ascending priority order. Per-network rules are keyed on
//! the socket mark (see [`crate::fwmark`]) and point at a routing table
//! derived from the interface's kernel ifindex. The ladder below the
//! per-network band catches legacy and unmarked traffic:
//!
//! | priority | purpose                    |
//! |----------|----------------------------|
//! | 11000    | privileged legacy routes   |
//! | 13000    | explicitly selected network|
//! | 14000    | outgoing-interface forcing |
//! | 16000    | legacy user routes         |
//! | 17000    | per-network normal         |
//! | 19000    | default network            |
//! | 20000    | main table fall-through    |
//! | 21000    | unreachable catch-all      |

use thiserror::Error as ThisError;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ipnetwork::IpNetwork;

use crate::fwmark::Fwmark;
use crate::net_id::NetId;
use crate::permission::Permission;

pub mod filter_ops;
pub mod netlink_ops;

#[cfg(test)]
pub(crate) mod mocks;

pub use filter_ops::{FilterOps, IptablesTarget};
pub use netlink_ops::{NetlinkOps, RouteSpec, RuleSpec};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub use filter_ops::RealFilterOps;
        pub use netlink_ops::RealNetlinkOps;
    }
}

pub const RULE_PRIORITY_PRIVILEGED_LEGACY: u32 = 11000;
pub const RULE_PRIORITY_PER_NETWORK_EXPLICIT: u32 = 13000;
pub const RULE_PRIORITY_PER_NETWORK_INTERFACE: u32 = 14000;
pub const RULE_PRIORITY_LEGACY: u32 = 16000;
pub const RULE_PRIORITY_PER_NETWORK_NORMAL: u32 = 17000;
pub const RULE_PRIORITY_DEFAULT_NETWORK: u32 = 19000;
pub const RULE_PRIORITY_MAIN: u32 = 20000;
pub const RULE_PRIORITY_UNREACHABLE: u32 = 21000;

/// Per-interface tables are `offset + ifindex`; the offset keeps them clear
/// of the fixed tables below and of the kernel's reserved range.
pub const ROUTE_TABLE_OFFSET_FROM_INDEX: u32 = 1000;
pub const ROUTE_TABLE_LEGACY: u32 = ROUTE_TABLE_OFFSET_FROM_INDEX - 902;
pub const ROUTE_TABLE_PRIVILEGED_LEGACY: u32 = ROUTE_TABLE_OFFSET_FROM_INDEX - 901;
pub const RT_TABLE_MAIN: u32 = 254;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("interface `{0}` has no known index")]
    UnknownInterface(String),
    #[error("route already exists")]
    RouteExists,
    #[error("route not found")]
    RouteNotFound,
    #[error("filter edit failed: {0}")]
    Filter(String),
    #[error("{0}")]
    General(String),

    #[cfg(target_os = "linux")]
    #[error("rtnetlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),
}

impl Error {
    /// Whether this is the kernel's duplicate-route answer.
    pub fn is_exist(&self) -> bool {
        match self {
            Error::RouteExists => true,
            #[cfg(target_os = "linux")]
            Error::Netlink(rtnetlink::Error::NetlinkError(e)) => e.raw_code() == -libc::EEXIST,
            _ => false,
        }
    }
}

/// Which table a route edit lands in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableType {
    Interface,
    Legacy,
    PrivilegedLegacy,
}

/// Installs and removes the policy rules and routes that realize the
/// network registry's state. Pure rule generation; holds no network state
/// beyond the ifindex cache needed to tear down tables for interfaces that
/// have already disappeared.
pub struct RouteController<N, F> {
    netlink: N,
    filter: F,
    iface_indices: Mutex<HashMap<String, u32>>,
}

impl<N: NetlinkOps, F: FilterOps> RouteController<N, F> {
    pub fn new(netlink: N, filter: F) -> Self {
        RouteController {
            netlink,
            filter,
            iface_indices: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the fixed lower rungs of the ladder. Must run before any
    /// network is created.
    pub async fn init_rule_ladder(&self) -> Result<(), Error> {
        // Main-table lookup with the same selector as the default-network
        // rule but lower priority. Normal lookups never reach it (the
        // default rule's table has a default route), but the kernel falls
        // through to it to find directly-connected routes when validating
        // the nexthop of a route being added.
        let rule = RuleSpec::to_table(
            RULE_PRIORITY_MAIN,
            RT_TABLE_MAIN,
            Fwmark::new(NetId::UNSET, false, false, Permission::NONE).encode(),
            Fwmark::mask(true, false, false, Permission::NONE),
        );
        self.netlink.rule_add(&rule).await?;

        // Legacy routes: anything not explicitly selected may fall through
        // to the legacy tables, the privileged one first.
        let legacy = RuleSpec::to_table(
            RULE_PRIORITY_LEGACY,
            ROUTE_TABLE_LEGACY,
            Fwmark::new(NetId::UNSET, false, false, Permission::NONE).encode(),
            Fwmark::mask(false, true, false, Permission::NONE),
        );
        self.netlink.rule_add(&legacy).await?;

        let privileged = RuleSpec::to_table(
            RULE_PRIORITY_PRIVILEGED_LEGACY,
            ROUTE_TABLE_PRIVILEGED_LEGACY,
            Fwmark::new(NetId::UNSET, false, false, Permission::CONNECTIVITY_INTERNAL).encode(),
            Fwmark::mask(false, true, false, Permission::CONNECTIVITY_INTERNAL),
        );
        self.netlink.rule_add(&privileged).await?;

        // Preempt the kernel's pre-defined "from all lookup main" rule so
        // packets marked with a dead netId fail instead of leaking through
        // the main table.
        self.netlink
            .rule_add(&RuleSpec::unreachable(RULE_PRIORITY_UNREACHABLE))
            .await
    }

    pub async fn add_interface_to_network(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
    ) -> Result<(), Error> {
        self.modify_per_network_rules(net_id, interface, permission, true, true).await
    }

    pub async fn remove_interface_from_network(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
    ) -> Result<(), Error> {
        self.modify_per_network_rules(net_id, interface, permission, false, true)
            .await?;
        self.flush_routes(interface).await
    }

    /// Installs the rules for the new permission before deleting the ones
    /// for the old, so there is no window without per-network rules.
    pub async fn modify_network_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old: Permission,
        new: Permission,
    ) -> Result<(), Error> {
        self.modify_per_network_rules(net_id, interface, new, true, false).await?;
        self.modify_per_network_rules(net_id, interface, old, false, false).await
    }

    pub async fn add_to_default_network(&self, interface: &str, permission: Permission) -> Result<(), Error> {
        self.modify_default_network_rule(interface, permission, true).await
    }

    pub async fn remove_from_default_network(&self, interface: &str, permission: Permission) -> Result<(), Error> {
        self.modify_default_network_rule(interface, permission, false).await
    }

    pub async fn add_route(
        &self,
        interface: &str,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
        table_type: TableType,
    ) -> Result<(), Error> {
        self.modify_route(interface, destination, nexthop, table_type, true).await
    }

    pub async fn remove_route(
        &self,
        interface: &str,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
        table_type: TableType,
    ) -> Result<(), Error> {
        self.modify_route(interface, destination, nexthop, table_type, false).await
    }

    /// Table number for an interface. Falls back to the cached index when
    /// the interface has disappeared, so teardown still finds the table.
    async fn table_for_interface(&self, interface: &str) -> Result<u32, Error> {
        match self.netlink.link_index(interface).await? {
            Some(index) => {
                self.iface_indices
                    .lock()
                    .expect("ifindex cache poisoned")
                    .insert(interface.to_string(), index);
                Ok(index + ROUTE_TABLE_OFFSET_FROM_INDEX)
            }
            None => self
                .iface_indices
                .lock()
                .expect("ifindex cache poisoned")
                .get(interface)
                .map(|index| index + ROUTE_TABLE_OFFSET_FROM_INDEX)
                .ok_or_else(|| Error::UnknownInterface(interface.to_string())),
        }
    }

    async fn modify_per_network_rules(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        add: bool,
        modify_filter: bool,
    ) -> Result<(), Error> {
        let table = self.table_for_interface(interface).await?;

        // Traffic whose outgoing interface the kernel already chose
        // (SO_BINDTODEVICE, IP_PKTINFO, link-local) routes via that
        // interface's table as long as the mark's permission bits satisfy
        // the network.
        let oif_rule = RuleSpec {
            priority: RULE_PRIORITY_PER_NETWORK_INTERFACE,
            table: Some(table),
            fwmark: Fwmark::new(NetId::UNSET, false, false, permission).encode(),
            mask: Fwmark::mask(false, false, false, permission),
            oif: Some(interface.to_string()),
        };
        self.apply_rule(&oif_rule, add).await?;

        // Sockets bound to this network at connect() time stay on it even
        // if the default network changes.
        let normal_rule = RuleSpec::to_table(
            RULE_PRIORITY_PER_NETWORK_NORMAL,
            table,
            Fwmark::new(net_id, false, false, permission).encode(),
            Fwmark::mask(true, false, false, permission),
        );
        self.apply_rule(&normal_rule, add).await?;

        // Explicit selection through the multinetwork APIs. The permission
        // bits were already checked when the netId was set into the mark,
        // but the rule matches them anyway for consistency.
        let explicit_rule = RuleSpec::to_table(
            RULE_PRIORITY_PER_NETWORK_EXPLICIT,
            table,
            Fwmark::new(net_id, true, false, permission).encode(),
            Fwmark::mask(true, true, false, permission),
        );
        self.apply_rule(&explicit_rule, add).await?;

        // Stamp inbound packets on this interface with the netId so
        // replies, accepted connections and related flows carry it without
        // userspace involvement. The stamp is the bare netId.
        if modify_filter {
            let action = if add { "-A" } else { "-D" };
            let mark = format!("0x{:x}", net_id.raw());
            self.filter
                .exec(
                    IptablesTarget::Both,
                    &[
                        "-t", "mangle", action, "INPUT", "-i", interface, "-j", "MARK", "--set-mark", &mark,
                    ],
                )
                .await?;
        }

        Ok(())
    }

    async fn modify_default_network_rule(
        &self,
        interface: &str,
        permission: Permission,
        add: bool,
    ) -> Result<(), Error> {
        let table = self.table_for_interface(interface).await?;

        let rule = RuleSpec::to_table(
            RULE_PRIORITY_DEFAULT_NETWORK,
            table,
            Fwmark::new(NetId::UNSET, false, false, permission).encode(),
            Fwmark::mask(true, false, false, permission),
        );
        self.apply_rule(&rule, add).await
    }

    async fn modify_route(
        &self,
        interface: &str,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
        table_type: TableType,
        add: bool,
    ) -> Result<(), Error> {
        let table = match table_type {
            TableType::Interface => self.table_for_interface(interface).await?,
            TableType::Legacy => ROUTE_TABLE_LEGACY,
            TableType::PrivilegedLegacy => ROUTE_TABLE_PRIVILEGED_LEGACY,
        };
        let if_index = self.current_index(interface).await?;

        let route = RouteSpec {
            table,
            destination,
            nexthop,
            if_index,
        };
        self.apply_route(&route, add).await?;

        // A route without a nexthop is directly connected. Mirror it into
        // the main table so the kernel can validate the nexthops of global
        // routes added later. The kernel may have put it there already when
        // the address was configured; a duplicate answer is fine.
        if nexthop.is_none() {
            let main_route = RouteSpec {
                table: RT_TABLE_MAIN,
                destination,
                nexthop: None,
                if_index,
            };
            match self.apply_route(&main_route, add).await {
                Ok(()) => {}
                Err(e) if add && e.is_exist() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn flush_routes(&self, interface: &str) -> Result<(), Error> {
        let table = self.table_for_interface(interface).await?;
        self.iface_indices
            .lock()
            .expect("ifindex cache poisoned")
            .remove(interface);
        self.netlink.route_flush_table(table).await
    }

    async fn current_index(&self, interface: &str) -> Result<u32, Error> {
        match self.netlink.link_index(interface).await? {
            Some(index) => Ok(index),
            None => self
                .iface_indices
                .lock()
                .expect("ifindex cache poisoned")
                .get(interface)
                .copied()
                .ok_or_else(|| Error::UnknownInterface(interface.to_string())),
        }
    }

    async fn apply_rule(&self, rule: &RuleSpec, add: bool) -> Result<(), Error> {
        if add {
            self.netlink.rule_add(rule).await
        } else {
            self.netlink.rule_del(rule).await
        }
    }

    async fn apply_route(&self, route: &RouteSpec, add: bool) -> Result<(), Error> {
        if add {
            self.netlink.route_add(route).await
        } else {
            self.netlink.route_del(route).await
        }
    }

    #[cfg(test)]
    pub(crate) fn netlink(&self) -> &N {
        &self.netlink
    }

    #[cfg(test)]
    pub(crate) fn filter(&self) -> &F {
        &self.filter
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mocks::{MockFilterOps, MockNetlinkOps, NetlinkState};
    use super::*;

    fn controller() -> RouteController<MockNetlinkOps, MockFilterOps> {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: [("wlan0".to_string(), 5), ("rmnet0".to_string(), 7)].into(),
            ..Default::default()
        });
        RouteController::new(netlink, MockFilterOps::new())
    }

    fn rules_at(ctl: &RouteController<MockNetlinkOps, MockFilterOps>, priority: u32) -> Vec<RuleSpec> {
        ctl.netlink
            .state
            .lock()
            .unwrap()
            .rules
            .iter()
            .filter(|r| r.priority == priority)
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn ladder_init_installs_fixed_rungs() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.init_rule_ladder().await?;

        let main = rules_at(&ctl, RULE_PRIORITY_MAIN);
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].table, Some(RT_TABLE_MAIN));
        assert_eq!(main[0].fwmark, 0);
        assert_eq!(main[0].mask, 0xffff);

        let legacy = rules_at(&ctl, RULE_PRIORITY_LEGACY);
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].table, Some(ROUTE_TABLE_LEGACY));
        assert_eq!(legacy[0].mask, 0x10000);

        let privileged = rules_at(&ctl, RULE_PRIORITY_PRIVILEGED_LEGACY);
        assert_eq!(privileged.len(), 1);
        assert_eq!(privileged[0].table, Some(ROUTE_TABLE_PRIVILEGED_LEGACY));
        assert_eq!(privileged[0].fwmark, 0x80000);
        assert_eq!(privileged[0].mask, 0x90000);

        let unreachable = rules_at(&ctl, RULE_PRIORITY_UNREACHABLE);
        assert_eq!(unreachable.len(), 1);
        assert_eq!(unreachable[0].table, None);
        Ok(())
    }

    #[tokio::test]
    async fn interface_add_installs_rule_triple_and_mark_stamp() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_interface_to_network(NetId::new(100), "wlan0", Permission::NONE)
            .await?;

        let table = 5 + ROUTE_TABLE_OFFSET_FROM_INDEX;

        let explicit = rules_at(&ctl, RULE_PRIORITY_PER_NETWORK_EXPLICIT);
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].table, Some(table));
        assert_eq!(explicit[0].fwmark, 0x10064);
        assert_eq!(explicit[0].mask, 0x1ffff);

        let oif = rules_at(&ctl, RULE_PRIORITY_PER_NETWORK_INTERFACE);
        assert_eq!(oif.len(), 1);
        assert_eq!(oif[0].oif.as_deref(), Some("wlan0"));
        assert_eq!(oif[0].mask, 0);

        let normal = rules_at(&ctl, RULE_PRIORITY_PER_NETWORK_NORMAL);
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].fwmark, 0x64);
        assert_eq!(normal[0].mask, 0xffff);

        // The ingress stamp carries the bare netId, no permission bits.
        let edits = ctl.filter.state.lock().unwrap().edits.clone();
        assert!(
            edits
                .iter()
                .any(|e| e.contains("-t mangle -A INPUT -i wlan0 -j MARK --set-mark 0x64"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn interface_remove_clears_rules_and_flushes_table() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_interface_to_network(NetId::new(100), "wlan0", Permission::NONE)
            .await?;
        ctl.add_route(
            "wlan0",
            "192.0.2.0/24".parse()?,
            None,
            TableType::Interface,
        )
        .await?;

        ctl.remove_interface_from_network(NetId::new(100), "wlan0", Permission::NONE)
            .await?;

        let state = ctl.netlink.state.lock().unwrap();
        assert!(state.rules.is_empty());
        let table = 5 + ROUTE_TABLE_OFFSET_FROM_INDEX;
        assert!(state.routes.iter().all(|r| r.table != table));
        Ok(())
    }

    #[tokio::test]
    async fn teardown_uses_cached_index_after_interface_is_gone() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_interface_to_network(NetId::new(100), "wlan0", Permission::NONE)
            .await?;

        // Interface disappears from the kernel.
        ctl.netlink.state.lock().unwrap().links.remove("wlan0");

        ctl.remove_interface_from_network(NetId::new(100), "wlan0", Permission::NONE)
            .await?;
        assert!(ctl.netlink.state.lock().unwrap().rules.is_empty());

        // The cache entry went away with the flush; a further lookup fails.
        assert!(matches!(
            ctl.add_interface_to_network(NetId::new(100), "wlan0", Permission::NONE).await,
            Err(Error::UnknownInterface(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn permission_change_installs_new_rules_before_deleting_old() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_interface_to_network(NetId::new(100), "wlan0", Permission::NONE)
            .await?;

        ctl.modify_network_permission(
            NetId::new(100),
            "wlan0",
            Permission::NONE,
            Permission::CHANGE_NETWORK_STATE,
        )
        .await?;

        // Exactly one triple remains, carrying the new permission bits.
        let normal = rules_at(&ctl, RULE_PRIORITY_PER_NETWORK_NORMAL);
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].fwmark, 0x40064);
        assert_eq!(normal[0].mask, 0x4ffff);

        // Every rule add precedes every rule delete, so no kernel snapshot
        // is without the per-network rules.
        let journal = ctl.netlink.state.lock().unwrap().journal.clone();
        let first_del = journal.iter().position(|op| op.starts_with("rule_del"));
        let last_add = journal.iter().rposition(|op| op.starts_with("rule_add"));
        assert!(matches!((last_add, first_del), (Some(add), Some(del)) if add < del));
        Ok(())
    }

    #[tokio::test]
    async fn directly_connected_route_is_mirrored_into_main() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_route(
            "wlan0",
            "192.0.2.0/24".parse()?,
            None,
            TableType::Interface,
        )
        .await?;

        let state = ctl.netlink.state.lock().unwrap();
        let tables: Vec<u32> = state.routes.iter().map(|r| r.table).collect();
        assert!(tables.contains(&(5 + ROUTE_TABLE_OFFSET_FROM_INDEX)));
        assert!(tables.contains(&RT_TABLE_MAIN));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_main_table_mirror_is_ignored() -> anyhow::Result<()> {
        let ctl = controller();
        // The kernel already added the connected route when the address was
        // configured.
        ctl.netlink.state.lock().unwrap().routes.push(RouteSpec {
            table: RT_TABLE_MAIN,
            destination: "192.0.2.0/24".parse()?,
            nexthop: None,
            if_index: 5,
        });

        ctl.add_route(
            "wlan0",
            "192.0.2.0/24".parse()?,
            None,
            TableType::Interface,
        )
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn gatewayed_route_goes_only_to_the_interface_table() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_route(
            "wlan0",
            "0.0.0.0/0".parse()?,
            Some("192.0.2.1".parse()?),
            TableType::Interface,
        )
        .await?;

        let state = ctl.netlink.state.lock().unwrap();
        assert_eq!(state.routes.len(), 1);
        assert_eq!(state.routes[0].table, 5 + ROUTE_TABLE_OFFSET_FROM_INDEX);
        Ok(())
    }

    #[tokio::test]
    async fn legacy_routes_use_the_fixed_tables() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_route("wlan0", "10.0.0.0/8".parse()?, None, TableType::Legacy)
            .await?;
        ctl.add_route(
            "wlan0",
            "172.16.0.0/12".parse()?,
            None,
            TableType::PrivilegedLegacy,
        )
        .await?;

        let state = ctl.netlink.state.lock().unwrap();
        assert!(state.routes.iter().any(|r| r.table == ROUTE_TABLE_LEGACY));
        assert!(state.routes.iter().any(|r| r.table == ROUTE_TABLE_PRIVILEGED_LEGACY));
        Ok(())
    }

    #[tokio::test]
    async fn default_network_rule_matches_unset_net_id() -> anyhow::Result<()> {
        let ctl = controller();
        ctl.add_to_default_network("wlan0", Permission::NONE).await?;

        let default = rules_at(&ctl, RULE_PRIORITY_DEFAULT_NETWORK);
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].fwmark, 0);
        assert_eq!(default[0].mask, 0xffff);
        assert_eq!(default[0].table, Some(5 + ROUTE_TABLE_OFFSET_FROM_INDEX));

        ctl.remove_from_default_network("wlan0", Permission::NONE).await?;
        assert!(rules_at(&ctl, RULE_PRIORITY_DEFAULT_NETWORK).is_empty());
        Ok(())
    }
}
