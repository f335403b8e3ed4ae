//! Abstraction over rtnetlink rule/route operations for testability.
//!
//! Defines [`NetlinkOps`] and the domain types ([`RuleSpec`], [`RouteSpec`])
//! that decouple the rule ladder and table edits from the netlink wire
//! format. Every logical rule is installed for IPv4 and IPv6.
//!
//! Production code uses [`RealNetlinkOps`] which wraps `rtnetlink::Handle`.
//! Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use std::net::IpAddr;

use super::Error;

// ============================================================================
// Domain Types
// ============================================================================

/// Policy routing rule specification.
///
/// `table == None` makes the rule return unreachable instead of pointing at
/// a table. `mask == 0` means the mark is not matched at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub priority: u32,
    pub table: Option<u32>,
    pub fwmark: u32,
    pub mask: u32,
    pub oif: Option<String>,
}

impl RuleSpec {
    pub fn to_table(priority: u32, table: u32, fwmark: u32, mask: u32) -> Self {
        RuleSpec {
            priority,
            table: Some(table),
            fwmark,
            mask,
            oif: None,
        }
    }

    pub fn unreachable(priority: u32) -> Self {
        RuleSpec {
            priority,
            table: None,
            fwmark: 0,
            mask: 0,
            oif: None,
        }
    }
}

/// Route specification decoupled from the rtnetlink wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub table: u32,
    pub destination: IpNetwork,
    pub nexthop: Option<IpAddr>,
    pub if_index: u32,
}

// ============================================================================
// Trait
// ============================================================================

/// Abstraction over netlink rule and route operations.
///
/// Implementors must be cheaply cloneable (e.g. because the underlying
/// handle is already reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    /// Remove every route in the given table, both families.
    async fn route_flush_table(&self, table: u32) -> Result<(), Error>;

    /// Kernel ifindex for an interface name, `None` once it is gone.
    async fn link_index(&self, name: &str) -> Result<Option<u32>, Error>;
}

// ============================================================================
// Real Implementation
// ============================================================================

#[cfg(target_os = "linux")]
pub use real::RealNetlinkOps;

#[cfg(target_os = "linux")]
mod real {
    use futures::TryStreamExt;
    use netlink_packet_route::AddressFamily;
    use netlink_packet_route::route::{RouteAttribute, RouteMessage};
    use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
    use rtnetlink::RouteMessageBuilder;

    use std::ffi::CString;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use super::{Error, NetlinkOps, RouteSpec, RuleSpec, async_trait};

    /// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
    #[derive(Clone)]
    pub struct RealNetlinkOps {
        handle: rtnetlink::Handle,
    }

    impl RealNetlinkOps {
        pub fn new(handle: rtnetlink::Handle) -> Self {
            Self { handle }
        }

        fn rule_message(rule: &RuleSpec, family: AddressFamily) -> RuleMessage {
            let mut msg = RuleMessage::default();
            msg.header.family = family;
            msg.header.action = match rule.table {
                Some(_) => RuleAction::ToTable,
                None => RuleAction::Unreachable,
            };
            msg.attributes.push(RuleAttribute::Priority(rule.priority));
            if let Some(table) = rule.table {
                msg.attributes.push(RuleAttribute::Table(table));
            }
            if rule.mask != 0 {
                msg.attributes.push(RuleAttribute::FwMark(rule.fwmark));
                msg.attributes.push(RuleAttribute::FwMask(rule.mask));
            }
            if let Some(oif) = &rule.oif {
                msg.attributes.push(RuleAttribute::Oifname(oif.clone()));
            }
            msg
        }

        fn route_message(route: &RouteSpec) -> Result<RouteMessage, Error> {
            match route.destination {
                ipnetwork::IpNetwork::V4(net) => {
                    let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
                        .destination_prefix(net.ip(), net.prefix())
                        .output_interface(route.if_index)
                        .table_id(route.table);
                    match route.nexthop {
                        Some(IpAddr::V4(gw)) => builder = builder.gateway(gw),
                        Some(IpAddr::V6(gw)) => {
                            return Err(Error::General(format!(
                                "IPv6 nexthop {gw} for IPv4 destination {net}"
                            )));
                        }
                        None => {}
                    }
                    Ok(builder.build())
                }
                ipnetwork::IpNetwork::V6(net) => {
                    let mut builder = RouteMessageBuilder::<Ipv6Addr>::default()
                        .destination_prefix(net.ip(), net.prefix())
                        .output_interface(route.if_index)
                        .table_id(route.table);
                    match route.nexthop {
                        Some(IpAddr::V6(gw)) => builder = builder.gateway(gw),
                        Some(IpAddr::V4(gw)) => {
                            return Err(Error::General(format!(
                                "IPv4 nexthop {gw} for IPv6 destination {net}"
                            )));
                        }
                        None => {}
                    }
                    Ok(builder.build())
                }
            }
        }

        async fn flush_family(&self, table: u32, template: RouteMessage) -> Result<(), Error> {
            let routes: Vec<_> = self.handle.route().get(template).execute().try_collect().await?;
            for msg in routes {
                let in_table = msg
                    .attributes
                    .iter()
                    .any(|a| matches!(a, RouteAttribute::Table(t) if *t == table))
                    || u32::from(msg.header.table) == table;
                if in_table {
                    self.handle.route().del(msg).execute().await?;
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NetlinkOps for RealNetlinkOps {
        async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
            for family in [AddressFamily::Inet, AddressFamily::Inet6] {
                let mut req = self.handle.rule().add();
                *req.message_mut() = Self::rule_message(rule, family);
                req.execute().await?;
            }
            Ok(())
        }

        async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
            for family in [AddressFamily::Inet, AddressFamily::Inet6] {
                let msg = Self::rule_message(rule, family);
                self.handle.rule().del(msg).execute().await?;
            }
            Ok(())
        }

        async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
            let msg = Self::route_message(route)?;
            self.handle.route().add(msg).execute().await?;
            Ok(())
        }

        async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
            let msg = Self::route_message(route)?;
            self.handle.route().del(msg).execute().await?;
            Ok(())
        }

        async fn route_flush_table(&self, table: u32) -> Result<(), Error> {
            let v4 = RouteMessageBuilder::<Ipv4Addr>::default().table_id(table).build();
            self.flush_family(table, v4).await?;
            let v6 = RouteMessageBuilder::<Ipv6Addr>::default().table_id(table).build();
            self.flush_family(table, v6).await?;
            Ok(())
        }

        async fn link_index(&self, name: &str) -> Result<Option<u32>, Error> {
            let cname = CString::new(name).map_err(|_| Error::General(format!("bad interface name `{name}`")))?;
            let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
            if index == 0 { Ok(None) } else { Ok(Some(index)) }
        }
    }
}
