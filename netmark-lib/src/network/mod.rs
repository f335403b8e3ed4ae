//! Logical networks: the registry objects behind every netId.
//!
//! A network is physical (backed by real interfaces, guarded by a required
//! permission, eligible to become the default) or virtual (a VPN claiming a
//! UID range; `secure` means apps inside the range cannot select their way
//! around it without the protect capability). Network values are passive
//! data; the [`controller`] orchestrates the route edits their lifecycle
//! implies, so no object holds a controller back-pointer.

use thiserror::Error as ThisError;

use std::collections::BTreeSet;

use crate::net_id::NetId;
use crate::permission::Permission;
use crate::routing;

pub mod controller;

pub use controller::{NetworkController, UidRangeEntry};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid netId {0}")]
    InvalidNetId(NetId),
    #[error("duplicate netId {0}")]
    DuplicateNetId(NetId),
    #[error("unknown netId {0}")]
    UnknownNetwork(NetId),
    #[error("interface `{iface}` already assigned to netId {net_id}")]
    InterfaceBusy { iface: String, net_id: NetId },
    #[error("interface `{iface}` not assigned to netId {net_id}")]
    InterfaceNotAssigned { iface: String, net_id: NetId },
    #[error("invalid uid range {0}-{1}")]
    InvalidUidRange(u32, u32),
    #[error("no matching uid range entry")]
    UidRangeNotFound,
    #[error("netId {0} is not a physical network")]
    NotPhysical(NetId),
    #[error(transparent)]
    Routing(#[from] routing::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkType {
    Physical,
    Virtual,
}

#[derive(Debug)]
pub struct PhysicalNetwork {
    pub(crate) permission: Permission,
    pub(crate) is_default: bool,
    pub(crate) interfaces: BTreeSet<String>,
}

#[derive(Debug)]
pub struct VirtualNetwork {
    pub(crate) uid_start: u32,
    pub(crate) uid_end: u32,
    pub(crate) secure: bool,
    pub(crate) interfaces: BTreeSet<String>,
}

#[derive(Debug)]
pub enum Network {
    Physical(PhysicalNetwork),
    Virtual(VirtualNetwork),
}

impl Network {
    pub fn physical(permission: Permission) -> Self {
        Network::Physical(PhysicalNetwork {
            permission,
            is_default: false,
            interfaces: BTreeSet::new(),
        })
    }

    pub fn virtual_(uid_start: u32, uid_end: u32, secure: bool) -> Self {
        Network::Virtual(VirtualNetwork {
            uid_start,
            uid_end,
            secure,
            interfaces: BTreeSet::new(),
        })
    }

    pub fn get_type(&self) -> NetworkType {
        match self {
            Network::Physical(_) => NetworkType::Physical,
            Network::Virtual(_) => NetworkType::Virtual,
        }
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        match self {
            Network::Physical(p) => &p.interfaces,
            Network::Virtual(v) => &v.interfaces,
        }
    }

    pub(crate) fn interfaces_mut(&mut self) -> &mut BTreeSet<String> {
        match self {
            Network::Physical(p) => &mut p.interfaces,
            Network::Virtual(v) => &mut v.interfaces,
        }
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.interfaces().contains(interface)
    }

    /// The permission the route rules for this network are keyed on.
    /// Virtual networks install unrestricted rules; their gatekeeping is
    /// the UID range, not a permission.
    pub fn route_permission(&self) -> Permission {
        match self {
            Network::Physical(p) => p.permission,
            Network::Virtual(_) => Permission::NONE,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Network::Physical(p) if p.is_default)
    }

    pub fn is_secure_vpn(&self) -> bool {
        matches!(self, Network::Virtual(v) if v.secure)
    }

    pub fn owns_uid(&self, uid: u32) -> bool {
        match self {
            Network::Virtual(v) => v.uid_start <= uid && uid <= v.uid_end,
            Network::Physical(_) => false,
        }
    }
}
