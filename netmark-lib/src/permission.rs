use std::fmt::{self, Display};
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use thiserror::Error;

/// The set of networking permissions a caller holds, or a network requires.
///
/// Applied to a UID it is the set granted to that app; applied to a network
/// it is the set an app must hold to use it. The daemon enforces no
/// semantics between the two bits; callers are expected to set all bits
/// they intend explicitly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Permission(u8);

const CHANGE_NETWORK_STATE_BIT: u8 = 0x1;
const CONNECTIVITY_INTERNAL_BIT: u8 = 0x2;

#[derive(Debug, Error)]
#[error("unknown permission `{0}`")]
pub struct ParsePermissionError(String);

impl Permission {
    pub const NONE: Permission = Permission(0);
    pub const CHANGE_NETWORK_STATE: Permission = Permission(CHANGE_NETWORK_STATE_BIT);
    pub const CONNECTIVITY_INTERNAL: Permission = Permission(CONNECTIVITY_INTERNAL_BIT);

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether a holder of `self` may use something requiring `required`
    /// (set inclusion; `NONE` is satisfied by everything).
    pub const fn satisfies(self, required: Permission) -> bool {
        self.contains(required)
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Permission) {
        self.0 |= rhs.0;
    }
}

impl Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_none() {
            return write!(f, "NONE");
        }
        let mut first = true;
        if self.contains(Permission::CHANGE_NETWORK_STATE) {
            write!(f, "CHANGE_NETWORK_STATE")?;
            first = false;
        }
        if self.contains(Permission::CONNECTIVITY_INTERNAL) {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "CONNECTIVITY_INTERNAL")?;
        }
        Ok(())
    }
}

impl FromStr for Permission {
    type Err = ParsePermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(Permission::NONE),
            "CHANGE_NETWORK_STATE" | "NETWORK" => Ok(Permission::CHANGE_NETWORK_STATE),
            "CONNECTIVITY_INTERNAL" | "SYSTEM" => Ok(Permission::CONNECTIVITY_INTERNAL),
            other => Err(ParsePermissionError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_satisfies_only_none() {
        assert!(Permission::NONE.satisfies(Permission::NONE));
        assert!(!Permission::NONE.satisfies(Permission::CHANGE_NETWORK_STATE));
        assert!(!Permission::NONE.satisfies(Permission::CONNECTIVITY_INTERNAL));
    }

    #[test]
    fn union_satisfies_both_parts() {
        let both = Permission::CHANGE_NETWORK_STATE | Permission::CONNECTIVITY_INTERNAL;
        assert!(both.satisfies(Permission::CHANGE_NETWORK_STATE));
        assert!(both.satisfies(Permission::CONNECTIVITY_INTERNAL));
        assert!(both.satisfies(Permission::NONE));
        assert!(!Permission::CHANGE_NETWORK_STATE.satisfies(both));
    }

    #[test]
    fn parses_canonical_names_and_aliases() -> anyhow::Result<()> {
        assert_eq!("NONE".parse::<Permission>()?, Permission::NONE);
        assert_eq!(
            "CHANGE_NETWORK_STATE".parse::<Permission>()?,
            Permission::CHANGE_NETWORK_STATE
        );
        assert_eq!("NETWORK".parse::<Permission>()?, Permission::CHANGE_NETWORK_STATE);
        assert_eq!("SYSTEM".parse::<Permission>()?, Permission::CONNECTIVITY_INTERNAL);
        assert!("ROOT".parse::<Permission>().is_err());
        Ok(())
    }

    #[test]
    fn displays_round_trip_through_parse() -> anyhow::Result<()> {
        for perm in [
            Permission::NONE,
            Permission::CHANGE_NETWORK_STATE,
            Permission::CONNECTIVITY_INTERNAL,
        ] {
            assert_eq!(perm.to_string().parse::<Permission>()?, perm);
        }
        Ok(())
    }
}
