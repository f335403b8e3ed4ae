//! The registry of logical networks and the selection algorithm.
//!
//! Methods here are called from the admin dispatcher (mutating) and from
//! the fwmark and DNS workers (read-only). The daemon wraps the controller
//! in one reader-writer lock; the dispatcher is the only writer and
//! processes one command at a time, so mutators never race each other and
//! readers always see a consistent snapshot.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::net_id::NetId;
use crate::permission::Permission;
use crate::routing::{FilterOps, NetlinkOps, RouteController, TableType};

use super::{Error, Network};

/// One UID→network routing preference. The newest entry containing a UID
/// wins; DNS lookups honor it only when `forward_dns` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidRangeEntry {
    pub uid_start: u32,
    pub uid_end: u32,
    pub net_id: NetId,
    pub forward_dns: bool,
}

pub struct NetworkController<N, F> {
    route: RouteController<N, F>,
    networks: BTreeMap<NetId, Network>,
    uid_ranges: Vec<UidRangeEntry>,
    users: HashMap<u32, Permission>,
    default_net_id: NetId,
}

impl<N: NetlinkOps, F: FilterOps> NetworkController<N, F> {
    pub fn new(route: RouteController<N, F>) -> Self {
        NetworkController {
            route,
            networks: BTreeMap::new(),
            uid_ranges: Vec::new(),
            users: HashMap::new(),
            default_net_id: NetId::UNSET,
        }
    }

    // ========================================================================
    // Read side (fwmark server, DNS proxy, dispatcher)
    // ========================================================================

    pub fn get_default_network(&self) -> NetId {
        self.default_net_id
    }

    pub fn is_valid_network(&self, net_id: NetId) -> bool {
        self.networks.contains_key(&net_id)
    }

    pub fn networks(&self) -> impl Iterator<Item = (&NetId, &Network)> {
        self.networks.iter()
    }

    pub fn get_network_id_for_interface(&self, interface: &str) -> NetId {
        self.networks
            .iter()
            .find(|(_, network)| network.has_interface(interface))
            .map(|(net_id, _)| *net_id)
            .unwrap_or(NetId::UNSET)
    }

    /// Maps a caller to the network its traffic should use.
    ///
    /// The UID range map is consulted first (newest entry wins); a DNS
    /// lookup skips an entry that disables DNS forwarding and falls through
    /// to the requested/default networks instead of returning it.
    pub fn get_network_for_user(&self, uid: u32, requested_net_id: NetId, for_dns: bool) -> NetId {
        for entry in &self.uid_ranges {
            if entry.uid_start <= uid && uid <= entry.uid_end {
                if for_dns && !entry.forward_dns {
                    break;
                }
                return entry.net_id;
            }
        }
        if !requested_net_id.is_unset() && self.is_valid_network(requested_net_id) {
            requested_net_id
        } else {
            self.default_net_id
        }
    }

    pub fn get_permission_for_user(&self, uid: u32) -> Permission {
        self.users.get(&uid).copied().unwrap_or(Permission::NONE)
    }

    /// Whether `uid` may bypass VPNs and mark sockets protected.
    pub fn can_protect(&self, uid: u32) -> bool {
        self.get_permission_for_user(uid)
            .contains(Permission::CONNECTIVITY_INTERNAL)
    }

    pub fn is_user_permitted(&self, uid: u32, net_id: NetId) -> bool {
        match self.networks.get(&net_id) {
            Some(Network::Physical(p)) => self.get_permission_for_user(uid).satisfies(p.permission),
            Some(network @ Network::Virtual(_)) => network.owns_uid(uid) || self.can_protect(uid),
            None => false,
        }
    }

    /// Whether `uid` may explicitly select `net_id` for its sockets. A UID
    /// inside a secure VPN's range may only select that VPN unless it can
    /// protect.
    pub fn can_user_select_network(&self, uid: u32, net_id: NetId) -> bool {
        if !self.is_valid_network(net_id) {
            return false;
        }
        let captive = self
            .networks
            .iter()
            .find(|(_, network)| network.is_secure_vpn() && network.owns_uid(uid));
        if let Some((vpn_net_id, _)) = captive {
            if *vpn_net_id != net_id && !self.can_protect(uid) {
                return false;
            }
        }
        self.is_user_permitted(uid, net_id)
    }

    // ========================================================================
    // Write side (admin dispatcher only)
    // ========================================================================

    /// Installs the fixed policy-rule rungs. Runs once at startup, before
    /// any network exists.
    pub async fn init_rule_ladder(&self) -> Result<(), Error> {
        self.route.init_rule_ladder().await?;
        Ok(())
    }

    pub async fn create_physical_network(&mut self, net_id: NetId, permission: Permission) -> Result<(), Error> {
        self.check_creatable(net_id)?;
        self.networks.insert(net_id, Network::physical(permission));
        tracing::info!(%net_id, %permission, "created physical network");
        Ok(())
    }

    pub async fn create_virtual_network(
        &mut self,
        net_id: NetId,
        uid_start: u32,
        uid_end: u32,
        secure: bool,
    ) -> Result<(), Error> {
        self.check_creatable(net_id)?;
        if uid_start > uid_end {
            return Err(Error::InvalidUidRange(uid_start, uid_end));
        }
        self.networks
            .insert(net_id, Network::virtual_(uid_start, uid_end, secure));
        tracing::info!(%net_id, uid_start, uid_end, secure, "created virtual network");
        Ok(())
    }

    /// Tears a network down: drains its interfaces (removing their rules
    /// and flushing their tables), clears the default slot if it held it,
    /// and drops every UID range preference referencing it. Marked sockets
    /// keep their mark; with the rules gone their packets hit the
    /// unreachable rung.
    pub async fn destroy_network(&mut self, net_id: NetId) -> Result<(), Error> {
        if !self.is_valid_network(net_id) {
            return Err(Error::UnknownNetwork(net_id));
        }

        let interfaces: Vec<String> = self.networks[&net_id].interfaces().iter().cloned().collect();
        for interface in interfaces {
            self.remove_interface_from_network(net_id, &interface).await?;
        }

        if self.default_net_id == net_id {
            // Interfaces are already gone, so there is no 19000 rule left
            // to remove; just clear the slot.
            self.default_net_id = NetId::UNSET;
        }

        self.networks.remove(&net_id);
        self.uid_ranges.retain(|entry| entry.net_id != net_id);
        tracing::info!(%net_id, "destroyed network");
        Ok(())
    }

    pub async fn add_interface_to_network(&mut self, net_id: NetId, interface: &str) -> Result<(), Error> {
        if !self.is_valid_network(net_id) {
            return Err(Error::UnknownNetwork(net_id));
        }
        let existing = self.get_network_id_for_interface(interface);
        if !existing.is_unset() && existing != net_id {
            return Err(Error::InterfaceBusy {
                iface: interface.to_string(),
                net_id: existing,
            });
        }

        let network = self.networks.get(&net_id).expect("validated above");
        if network.has_interface(interface) {
            return Ok(());
        }
        let permission = network.route_permission();
        let is_default = network.is_default();

        self.route
            .add_interface_to_network(net_id, interface, permission)
            .await?;
        if is_default {
            self.route.add_to_default_network(interface, permission).await?;
        }

        self.networks
            .get_mut(&net_id)
            .expect("validated above")
            .interfaces_mut()
            .insert(interface.to_string());
        tracing::info!(%net_id, interface, "added interface to network");
        Ok(())
    }

    pub async fn remove_interface_from_network(&mut self, net_id: NetId, interface: &str) -> Result<(), Error> {
        if !self.is_valid_network(net_id) {
            return Err(Error::UnknownNetwork(net_id));
        }
        let network = self.networks.get(&net_id).expect("validated above");
        if !network.has_interface(interface) {
            return Err(Error::InterfaceNotAssigned {
                iface: interface.to_string(),
                net_id,
            });
        }
        let permission = network.route_permission();
        let is_default = network.is_default();

        self.route
            .remove_interface_from_network(net_id, interface, permission)
            .await?;
        if is_default {
            self.route.remove_from_default_network(interface, permission).await?;
        }

        self.networks
            .get_mut(&net_id)
            .expect("validated above")
            .interfaces_mut()
            .remove(interface);
        tracing::info!(%net_id, interface, "removed interface from network");
        Ok(())
    }

    /// Moves the default to `net_id`. The new network's 19000 rules go in
    /// before the old ones come out, so there is never a gap with no
    /// default.
    pub async fn set_default_network(&mut self, net_id: NetId) -> Result<(), Error> {
        if net_id == self.default_net_id {
            return Ok(());
        }

        if !net_id.is_unset() {
            self.add_as_default(net_id).await?;
        }

        let old = self.default_net_id;
        if !old.is_unset() {
            self.remove_as_default(old).await?;
        }

        self.default_net_id = net_id;
        tracing::info!(%net_id, previous = %old, "default network changed");
        Ok(())
    }

    pub async fn clear_default_network(&mut self) -> Result<(), Error> {
        self.set_default_network(NetId::UNSET).await
    }

    pub fn set_permission_for_users(&mut self, permission: Permission, uids: &[u32]) {
        for &uid in uids {
            if permission.is_none() {
                self.users.remove(&uid);
            } else {
                self.users.insert(uid, permission);
            }
        }
    }

    /// Changes the required permission of physical networks. Rules for the
    /// new permission are installed before the old ones are removed, per
    /// interface; a currently-default network also refreshes its 19000
    /// rules the same way.
    pub async fn set_permission_for_networks(&mut self, permission: Permission, net_ids: &[NetId]) -> Result<(), Error> {
        for &net_id in net_ids {
            let (old, interfaces, is_default) = match self.networks.get(&net_id) {
                Some(Network::Physical(p)) => (
                    p.permission,
                    p.interfaces.iter().cloned().collect::<Vec<_>>(),
                    p.is_default,
                ),
                Some(Network::Virtual(_)) => return Err(Error::NotPhysical(net_id)),
                None => return Err(Error::UnknownNetwork(net_id)),
            };
            if old == permission {
                continue;
            }

            for interface in &interfaces {
                self.route
                    .modify_network_permission(net_id, interface, old, permission)
                    .await?;
            }
            if is_default {
                for interface in &interfaces {
                    self.route.add_to_default_network(interface, permission).await?;
                    self.route.remove_from_default_network(interface, old).await?;
                }
            }

            if let Some(Network::Physical(p)) = self.networks.get_mut(&net_id) {
                p.permission = permission;
            }
            tracing::info!(%net_id, %permission, "network permission changed");
        }
        Ok(())
    }

    /// Routes DNS and traffic of a UID range to a network. Re-adding an
    /// identical range only updates the DNS forwarding flag; otherwise the
    /// entry goes to the front so the newest preference wins.
    pub fn set_network_for_uid_range(
        &mut self,
        uid_start: u32,
        uid_end: u32,
        net_id: NetId,
        forward_dns: bool,
    ) -> Result<(), Error> {
        if uid_start > uid_end {
            return Err(Error::InvalidUidRange(uid_start, uid_end));
        }
        if !self.is_valid_network(net_id) {
            return Err(Error::UnknownNetwork(net_id));
        }

        for entry in &mut self.uid_ranges {
            if entry.uid_start == uid_start && entry.uid_end == uid_end && entry.net_id == net_id {
                entry.forward_dns = forward_dns;
                return Ok(());
            }
        }

        self.uid_ranges.insert(
            0,
            UidRangeEntry {
                uid_start,
                uid_end,
                net_id,
                forward_dns,
            },
        );
        Ok(())
    }

    pub fn clear_network_for_uid_range(&mut self, uid_start: u32, uid_end: u32, net_id: NetId) -> Result<(), Error> {
        if uid_start > uid_end {
            return Err(Error::InvalidUidRange(uid_start, uid_end));
        }
        let before = self.uid_ranges.len();
        self.uid_ranges
            .retain(|e| !(e.uid_start == uid_start && e.uid_end == uid_end && e.net_id == net_id));
        if self.uid_ranges.len() == before {
            return Err(Error::UidRangeNotFound);
        }
        Ok(())
    }

    pub async fn add_route(
        &mut self,
        net_id: NetId,
        interface: &str,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
        legacy: bool,
        uid: u32,
    ) -> Result<(), Error> {
        self.modify_route(net_id, interface, destination, nexthop, legacy, uid, true)
            .await
    }

    pub async fn remove_route(
        &mut self,
        net_id: NetId,
        interface: &str,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
        legacy: bool,
        uid: u32,
    ) -> Result<(), Error> {
        self.modify_route(net_id, interface, destination, nexthop, legacy, uid, false)
            .await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_creatable(&self, net_id: NetId) -> Result<(), Error> {
        if !net_id.in_creation_range() {
            return Err(Error::InvalidNetId(net_id));
        }
        if self.is_valid_network(net_id) {
            return Err(Error::DuplicateNetId(net_id));
        }
        Ok(())
    }

    async fn add_as_default(&mut self, net_id: NetId) -> Result<(), Error> {
        let (permission, interfaces) = self.physical_parts(net_id)?;
        for interface in &interfaces {
            self.route.add_to_default_network(interface, permission).await?;
        }
        if let Some(Network::Physical(p)) = self.networks.get_mut(&net_id) {
            p.is_default = true;
        }
        Ok(())
    }

    async fn remove_as_default(&mut self, net_id: NetId) -> Result<(), Error> {
        let (permission, interfaces) = self.physical_parts(net_id)?;
        for interface in &interfaces {
            self.route.remove_from_default_network(interface, permission).await?;
        }
        if let Some(Network::Physical(p)) = self.networks.get_mut(&net_id) {
            p.is_default = false;
        }
        Ok(())
    }

    fn physical_parts(&self, net_id: NetId) -> Result<(Permission, Vec<String>), Error> {
        match self.networks.get(&net_id) {
            Some(Network::Physical(p)) => Ok((p.permission, p.interfaces.iter().cloned().collect())),
            Some(Network::Virtual(_)) => Err(Error::NotPhysical(net_id)),
            None => Err(Error::UnknownNetwork(net_id)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn modify_route(
        &mut self,
        net_id: NetId,
        interface: &str,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
        legacy: bool,
        uid: u32,
        add: bool,
    ) -> Result<(), Error> {
        let existing = self.get_network_id_for_interface(interface);
        if net_id.is_unset() || existing != net_id {
            return Err(Error::InterfaceNotAssigned {
                iface: interface.to_string(),
                net_id,
            });
        }

        let table_type = if legacy {
            if self
                .get_permission_for_user(uid)
                .contains(Permission::CONNECTIVITY_INTERNAL)
            {
                TableType::PrivilegedLegacy
            } else {
                TableType::Legacy
            }
        } else {
            TableType::Interface
        };

        if add {
            self.route.add_route(interface, destination, nexthop, table_type).await?;
        } else {
            self.route.remove_route(interface, destination, nexthop, table_type).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn route_controller(&self) -> &RouteController<N, F> {
        &self.route
    }
}

// ============================================================================
// Tests
// ============================================================================
