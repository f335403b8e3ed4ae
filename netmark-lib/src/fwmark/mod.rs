//! The 32-bit socket mark every socket carries.
//!
//! Pre-routing stamps incoming packets with it, post-routing rules match on
//! it to pick a routing table. The bit positions are ABI shared with the
//! policy rule ladder and the marking rules:
//!
//! | bits   | field                 |
//! |--------|-----------------------|
//! | 0..15  | netId                 |
//! | 16     | explicitly selected   |
//! | 17     | protected from VPN    |
//! | 18     | CHANGE_NETWORK_STATE  |
//! | 19     | CONNECTIVITY_INTERNAL |
//!
//! All remaining bits are zero.

#[cfg(unix)]
pub mod server;

use crate::net_id::NetId;
use crate::permission::Permission;

const NET_ID_MASK: u32 = 0xffff;
const EXPLICIT_BIT: u32 = 1 << 16;
const PROTECT_BIT: u32 = 1 << 17;
const CHANGE_NETWORK_STATE_BIT: u32 = 1 << 18;
const CONNECTIVITY_INTERNAL_BIT: u32 = 1 << 19;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fwmark {
    pub net_id: NetId,
    pub explicitly_selected: bool,
    pub protected_from_vpn: bool,
    pub permission: Permission,
}

impl Fwmark {
    pub const fn new(
        net_id: NetId,
        explicitly_selected: bool,
        protected_from_vpn: bool,
        permission: Permission,
    ) -> Self {
        Fwmark {
            net_id,
            explicitly_selected,
            protected_from_vpn,
            permission,
        }
    }

    pub fn encode(self) -> u32 {
        let mut bits = u32::from(self.net_id) & NET_ID_MASK;
        if self.explicitly_selected {
            bits |= EXPLICIT_BIT;
        }
        if self.protected_from_vpn {
            bits |= PROTECT_BIT;
        }
        bits | permission_bits(self.permission)
    }

    pub fn decode(bits: u32) -> Self {
        let mut permission = Permission::NONE;
        if bits & CHANGE_NETWORK_STATE_BIT != 0 {
            permission |= Permission::CHANGE_NETWORK_STATE;
        }
        if bits & CONNECTIVITY_INTERNAL_BIT != 0 {
            permission |= Permission::CONNECTIVITY_INTERNAL;
        }
        Fwmark {
            net_id: NetId::new((bits & NET_ID_MASK) as u16),
            explicitly_selected: bits & EXPLICIT_BIT != 0,
            protected_from_vpn: bits & PROTECT_BIT != 0,
            permission,
        }
    }

    /// The mask companion of [`encode`](Self::encode): selects which fields
    /// a rule cares about. A `true` flag makes the corresponding field
    /// significant; `permission` masks exactly the permission bits given.
    pub fn mask(care_net_id: bool, care_explicit: bool, care_protect: bool, permission: Permission) -> u32 {
        let mut bits = if care_net_id { NET_ID_MASK } else { 0 };
        if care_explicit {
            bits |= EXPLICIT_BIT;
        }
        if care_protect {
            bits |= PROTECT_BIT;
        }
        bits | permission_bits(permission)
    }
}

fn permission_bits(permission: Permission) -> u32 {
    let mut bits = 0;
    if permission.contains(Permission::CHANGE_NETWORK_STATE) {
        bits |= CHANGE_NETWORK_STATE_BIT;
    }
    if permission.contains(Permission::CONNECTIVITY_INTERNAL) {
        bits |= CONNECTIVITY_INTERNAL_BIT;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissions() -> [Permission; 4] {
        [
            Permission::NONE,
            Permission::CHANGE_NETWORK_STATE,
            Permission::CONNECTIVITY_INTERNAL,
            Permission::CHANGE_NETWORK_STATE | Permission::CONNECTIVITY_INTERNAL,
        ]
    }

    #[test]
    fn encode_places_each_field_at_its_bit() {
        let mark = Fwmark::new(NetId::new(100), false, false, Permission::NONE);
        assert_eq!(mark.encode(), 0x64);

        let mark = Fwmark::new(NetId::new(100), true, false, Permission::NONE);
        assert_eq!(mark.encode(), 0x10064);

        let mark = Fwmark::new(NetId::UNSET, false, true, Permission::NONE);
        assert_eq!(mark.encode(), 0x20000);

        let mark = Fwmark::new(NetId::UNSET, false, false, Permission::CHANGE_NETWORK_STATE);
        assert_eq!(mark.encode(), 0x40000);

        let mark = Fwmark::new(NetId::UNSET, false, false, Permission::CONNECTIVITY_INTERNAL);
        assert_eq!(mark.encode(), 0x80000);
    }

    #[test]
    fn round_trips_all_legal_field_combinations() {
        for net_id in [NetId::UNSET, NetId::new(10), NetId::new(100), NetId::MAX] {
            for explicit in [false, true] {
                for protect in [false, true] {
                    for permission in permissions() {
                        let mark = Fwmark::new(net_id, explicit, protect, permission);
                        assert_eq!(Fwmark::decode(mark.encode()), mark);
                    }
                }
            }
        }
    }

    #[test]
    fn encode_leaves_bits_above_the_fields_zero() {
        let all = Fwmark::new(
            NetId::MAX,
            true,
            true,
            Permission::CHANGE_NETWORK_STATE | Permission::CONNECTIVITY_INTERNAL,
        );
        assert_eq!(all.encode() & !0xfffff, 0);
    }

    #[test]
    fn mask_mirrors_the_care_flags() {
        assert_eq!(Fwmark::mask(true, false, false, Permission::NONE), 0xffff);
        assert_eq!(Fwmark::mask(false, true, false, Permission::NONE), 0x10000);
        assert_eq!(Fwmark::mask(false, false, true, Permission::NONE), 0x20000);
        assert_eq!(
            Fwmark::mask(
                true,
                true,
                false,
                Permission::CHANGE_NETWORK_STATE | Permission::CONNECTIVITY_INTERNAL
            ),
            0xdffff
        );
    }
}
