use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;

/// Identifier of one logical network. `UNSET` is a reserved sentinel meaning
/// "no network"; identifiers handed out by the framework live in
/// `MIN..=MAX`. The value is carried verbatim in the lower 16 bits of every
/// socket mark.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetId(u16);

impl NetId {
    pub const UNSET: NetId = NetId(0);
    pub const MIN: NetId = NetId(10);
    pub const MAX: NetId = NetId(u16::MAX);

    pub const fn new(raw: u16) -> Self {
        NetId(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn is_unset(self) -> bool {
        self.0 == Self::UNSET.0
    }

    /// Whether this identifier may be used to create a network.
    pub const fn in_creation_range(self) -> bool {
        self.0 >= Self::MIN.0
    }
}

impl Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NetId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u16>().map(NetId)
    }
}

impl From<NetId> for u32 {
    fn from(net_id: NetId) -> u32 {
        u32::from(net_id.raw())
    }
}
