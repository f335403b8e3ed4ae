//! Executes parsed admin commands against the controllers.
//!
//! The dispatcher is the composition point: it holds the writer side of
//! the network controller lock, the firewall controller (which nothing
//! else touches) and the resolver handle used for cache invalidation. One
//! `dispatch_line` call runs to completion before the next is read, so
//! every mutation is serialized here.

use thiserror::Error as ThisError;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::dns::NativeResolver;
use crate::firewall::{self, FirewallController};
use crate::net_id::NetId;
use crate::network::{self, Network, NetworkController};
use crate::routing::{FilterOps, NetlinkOps};

use super::command::{self, AdminCommand, ParseError};
use super::{ResponseCode, tokenize};

#[derive(Debug, ThisError)]
enum ExecError {
    #[error(transparent)]
    Network(#[from] network::Error),
    #[error(transparent)]
    Firewall(#[from] firewall::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: ResponseCode,
    pub message: String,
}

/// Everything written back for one command line. `lines` always ends with
/// exactly one terminal (non-100-series) line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub cookie: String,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    fn single(cookie: &str, code: ResponseCode, message: impl Into<String>) -> Self {
        Reply {
            cookie: cookie.to_string(),
            lines: vec![ReplyLine {
                code,
                message: message.into(),
            }],
        }
    }

    /// The terminal response code of this reply.
    pub fn code(&self) -> ResponseCode {
        self.lines.last().map(|l| l.code).unwrap_or(ResponseCode::CommandSyntaxError)
    }
}

pub struct Dispatcher<N, F, R> {
    network: Arc<RwLock<NetworkController<N, F>>>,
    firewall: FirewallController<F>,
    resolver: Arc<R>,
}

impl<N: NetlinkOps, F: FilterOps, R: NativeResolver> Dispatcher<N, F, R> {
    pub fn new(
        network: Arc<RwLock<NetworkController<N, F>>>,
        firewall: FirewallController<F>,
        resolver: Arc<R>,
    ) -> Self {
        Dispatcher {
            network,
            firewall,
            resolver,
        }
    }

    /// Processes one admin line: `<cookie> <command> <args…>`.
    pub async fn dispatch_line(&mut self, line: &str) -> Reply {
        let tokens = match tokenize(line) {
            Ok(tokens) => tokens,
            Err(e) => return Reply::single("0", ResponseCode::CommandSyntaxError, e.to_string()),
        };

        let Some((cookie, argv)) = tokens.split_first() else {
            return Reply::single("0", ResponseCode::CommandSyntaxError, "empty line");
        };
        if argv.is_empty() {
            return Reply::single(cookie, ResponseCode::CommandSyntaxError, "missing command");
        }

        let parsed = match command::parse(argv) {
            Ok(parsed) => parsed,
            Err(ParseError::Syntax(msg)) => {
                return Reply::single(cookie, ResponseCode::CommandSyntaxError, msg);
            }
            Err(ParseError::Parameter(msg)) => {
                return Reply::single(cookie, ResponseCode::CommandParameterError, msg);
            }
        };

        tracing::debug!(command = ?parsed, "admin command");
        match self.execute(parsed).await {
            Ok(lines) => Reply {
                cookie: cookie.clone(),
                lines,
            },
            Err(e) => {
                tracing::warn!(error = %e, "admin command failed");
                Reply::single(cookie, ResponseCode::OperationFailed, e.to_string())
            }
        }
    }

    async fn execute(&mut self, command: AdminCommand) -> Result<Vec<ReplyLine>, ExecError> {
        match command {
            AdminCommand::NetworkCreatePhysical { net_id, permission } => {
                self.network
                    .write()
                    .await
                    .create_physical_network(net_id, permission)
                    .await?;
            }
            AdminCommand::NetworkCreateVirtual {
                net_id,
                uid_start,
                uid_end,
                secure,
            } => {
                self.network
                    .write()
                    .await
                    .create_virtual_network(net_id, uid_start, uid_end, secure)
                    .await?;
            }
            AdminCommand::NetworkDestroy { net_id } => {
                self.network.write().await.destroy_network(net_id).await?;
                // Cached answers keyed by the dead network are useless and
                // must not leak into a netId that gets reused.
                self.resolver.flush_cache(net_id);
            }
            AdminCommand::NetworkInterface { add, net_id, iface } => {
                let mut network = self.network.write().await;
                if add {
                    network.add_interface_to_network(net_id, &iface).await?;
                } else {
                    network.remove_interface_from_network(net_id, &iface).await?;
                }
            }
            AdminCommand::NetworkDefaultSet { net_id } => {
                self.network.write().await.set_default_network(net_id).await?;
            }
            AdminCommand::NetworkDefaultClear => {
                self.network.write().await.clear_default_network().await?;
            }
            AdminCommand::NetworkPermissionUser { permission, uids } => {
                self.network.write().await.set_permission_for_users(permission, &uids);
            }
            AdminCommand::NetworkPermissionNetwork { permission, net_ids } => {
                self.network
                    .write()
                    .await
                    .set_permission_for_networks(permission, &net_ids)
                    .await?;
            }
            AdminCommand::NetworkUidRangeAdd {
                net_id,
                uid_start,
                uid_end,
                forward_dns,
            } => {
                self.network
                    .write()
                    .await
                    .set_network_for_uid_range(uid_start, uid_end, net_id, forward_dns)?;
            }
            AdminCommand::NetworkUidRangeRemove {
                net_id,
                uid_start,
                uid_end,
            } => {
                self.network
                    .write()
                    .await
                    .clear_network_for_uid_range(uid_start, uid_end, net_id)?;
            }
            AdminCommand::NetworkRoute {
                add,
                legacy,
                uid,
                net_id,
                iface,
                destination,
                nexthop,
            } => {
                let mut network = self.network.write().await;
                if add {
                    network
                        .add_route(net_id, &iface, destination, nexthop, legacy, uid)
                        .await?;
                } else {
                    network
                        .remove_route(net_id, &iface, destination, nexthop, legacy, uid)
                        .await?;
                }
            }
            AdminCommand::NetworkList => {
                let network = self.network.read().await;
                let mut lines: Vec<ReplyLine> = network
                    .networks()
                    .map(|(net_id, net)| ReplyLine {
                        code: ResponseCode::ListResult,
                        message: describe_network(*net_id, net, network.get_default_network()),
                    })
                    .collect();
                lines.push(ReplyLine {
                    code: ResponseCode::CommandOkay,
                    message: "ok".to_string(),
                });
                return Ok(lines);
            }
            AdminCommand::FirewallEnable { mode } => {
                self.firewall.enable(mode).await?;
            }
            AdminCommand::FirewallDisable => {
                self.firewall.disable().await?;
            }
            AdminCommand::FirewallChain { chain, enable } => {
                self.firewall.enable_child_chain(chain, enable).await?;
            }
            AdminCommand::FirewallSetUidRule { chain, uid, rule } => {
                self.firewall.set_uid_rule(chain, uid, rule).await?;
            }
            AdminCommand::FirewallSetChain { name, mode, uids } => {
                self.firewall.replace_uid_chain(&name, mode, &uids).await?;
            }
        }

        Ok(vec![ReplyLine {
            code: ResponseCode::CommandOkay,
            message: "ok".to_string(),
        }])
    }
}

fn describe_network(net_id: NetId, network: &Network, default_net_id: NetId) -> String {
    let interfaces: Vec<&str> = network.interfaces().iter().map(String::as_str).collect();
    let interfaces = if interfaces.is_empty() {
        "-".to_string()
    } else {
        interfaces.join(",")
    };
    match network {
        Network::Physical(p) => {
            let default = if net_id == default_net_id { " default" } else { "" };
            format!(
                "{net_id} physical permission={}{default} interfaces={interfaces}",
                p.permission
            )
        }
        Network::Virtual(v) => {
            let secure = if v.secure { " secure" } else { "" };
            format!(
                "{net_id} vpn uids={}-{}{secure} interfaces={interfaces}",
                v.uid_start, v.uid_end
            )
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns;
    use crate::dns::mock::MockResolver;
    use crate::net_id::NetId;
    use crate::routing::mocks::{MockFilterOps, MockNetlinkOps, NetlinkState};
    use crate::routing::{
        ROUTE_TABLE_OFFSET_FROM_INDEX, RULE_PRIORITY_DEFAULT_NETWORK, RULE_PRIORITY_PER_NETWORK_EXPLICIT,
        RULE_PRIORITY_PER_NETWORK_INTERFACE, RULE_PRIORITY_PER_NETWORK_NORMAL, RULE_PRIORITY_UNREACHABLE,
        RouteController, RuleSpec,
    };

    struct Fixture {
        dispatcher: Dispatcher<MockNetlinkOps, MockFilterOps, MockResolver>,
        netlink: MockNetlinkOps,
        filter: MockFilterOps,
        resolver: Arc<MockResolver>,
        network: Arc<RwLock<NetworkController<MockNetlinkOps, MockFilterOps>>>,
    }

    fn fixture() -> Fixture {
        let netlink = MockNetlinkOps::with_state(NetlinkState {
            links: [
                ("wlan0".to_string(), 5),
                ("rmnet0".to_string(), 7),
                ("tun0".to_string(), 9),
            ]
            .into(),
            ..Default::default()
        });
        let filter = MockFilterOps::new();
        let resolver = Arc::new(MockResolver::new());
        let network = Arc::new(RwLock::new(NetworkController::new(RouteController::new(
            netlink.clone(),
            filter.clone(),
        ))));
        let dispatcher = Dispatcher::new(
            network.clone(),
            FirewallController::new(filter.clone()),
            resolver.clone(),
        );
        Fixture {
            dispatcher,
            netlink,
            filter,
            resolver,
            network,
        }
    }

    fn rules(fx: &Fixture) -> Vec<RuleSpec> {
        fx.netlink.state.lock().unwrap().rules.clone()
    }

    async fn ok(fx: &mut Fixture, line: &str) {
        let reply = fx.dispatcher.dispatch_line(line).await;
        assert_eq!(
            reply.code(),
            ResponseCode::CommandOkay,
            "command `{line}` failed: {:?}",
            reply.lines
        );
    }

    #[tokio::test]
    async fn create_interface_default_installs_the_expected_rules() -> anyhow::Result<()> {
        let mut fx = fixture();
        fx.network.read().await.init_rule_ladder().await?;

        ok(&mut fx, "12 network create 100").await;
        ok(&mut fx, "13 network interface add 100 wlan0").await;
        ok(&mut fx, "14 network default set 100").await;

        let table = 5 + ROUTE_TABLE_OFFSET_FROM_INDEX;
        let current = rules(&fx);

        // Default rule: mark 0/0xffff into wlan0's table.
        let default: Vec<_> = current
            .iter()
            .filter(|r| r.priority == RULE_PRIORITY_DEFAULT_NETWORK)
            .collect();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].fwmark & 0xffff, 0);
        assert_eq!(default[0].mask, 0xffff);
        assert_eq!(default[0].table, Some(table));

        // The per-network triple is present for (100, wlan0).
        for priority in [
            RULE_PRIORITY_PER_NETWORK_EXPLICIT,
            RULE_PRIORITY_PER_NETWORK_INTERFACE,
            RULE_PRIORITY_PER_NETWORK_NORMAL,
        ] {
            assert_eq!(
                current.iter().filter(|r| r.priority == priority && r.table == Some(table)).count(),
                1,
                "missing rule at {priority}"
            );
        }

        // Ingress packets on wlan0 are stamped with 0x64.
        let edits = fx.filter.state.lock().unwrap().edits.clone();
        assert!(
            edits
                .iter()
                .any(|e| e.contains("-t mangle -A INPUT -i wlan0 -j MARK --set-mark 0x64"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn permission_upgrade_returns_ok_and_rewrites_rules() -> anyhow::Result<()> {
        let mut fx = fixture();
        ok(&mut fx, "0 network create 100").await;
        ok(&mut fx, "0 network interface add 100 wlan0").await;

        ok(&mut fx, "0 network permission network set CHANGE_NETWORK_STATE 100").await;

        let normal: Vec<_> = rules(&fx)
            .into_iter()
            .filter(|r| r.priority == RULE_PRIORITY_PER_NETWORK_NORMAL)
            .collect();
        assert_eq!(normal.len(), 1);
        assert_ne!(normal[0].fwmark & 0x40000, 0);
        Ok(())
    }

    #[tokio::test]
    async fn uid_range_override_steers_dns_to_the_other_network() -> anyhow::Result<()> {
        let mut fx = fixture();
        ok(&mut fx, "0 network create 100").await;
        ok(&mut fx, "0 network interface add 100 wlan0").await;
        ok(&mut fx, "0 network default set 100").await;
        ok(&mut fx, "0 network create 101").await;
        ok(&mut fx, "0 network interface add 101 rmnet0").await;
        ok(&mut fx, "0 network uidrange add 101 10000-10099 true").await;

        // A getaddrinfo from UID 10050 consults network 101, not the default.
        let request = dns::parse_request(
            &["getaddrinfo", "example.com", "^", "-1", "-1", "-1", "-1", "0"]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
        )?;
        let effective = fx
            .network
            .read()
            .await
            .get_network_for_user(10050, request.requested_net_id(), true);
        assert_eq!(effective, NetId::new(101));

        dns::run_request(&request, effective, fx.resolver.as_ref()).await;
        let queries = fx.resolver.state.lock().unwrap().queries.clone();
        assert_eq!(queries[0].0, NetId::new(101));
        Ok(())
    }

    #[tokio::test]
    async fn destroy_flushes_the_resolver_cache_and_every_rule() -> anyhow::Result<()> {
        let mut fx = fixture();
        fx.network.read().await.init_rule_ladder().await?;
        ok(&mut fx, "0 network create 100").await;
        ok(&mut fx, "0 network interface add 100 wlan0").await;
        ok(&mut fx, "0 network default set 100").await;

        ok(&mut fx, "0 network destroy 100").await;

        assert_eq!(fx.resolver.state.lock().unwrap().flushed, vec![NetId::new(100)]);

        // No rule references netId 100 anymore; the unreachable rung still
        // catches marked packets from surviving sockets.
        let current = rules(&fx);
        assert!(!current.iter().any(|r| r.fwmark & 0xffff == 100));
        assert!(current.iter().any(|r| r.priority == RULE_PRIORITY_UNREACHABLE && r.table.is_none()));
        Ok(())
    }

    #[tokio::test]
    async fn firewall_set_chain_replaces_atomically_via_dispatcher() -> anyhow::Result<()> {
        let mut fx = fixture();
        ok(&mut fx, "0 firewall set_chain fw_dozable whitelist 10023 10059 10124").await;

        let chain = fx.filter.chain_v4("fw_dozable").unwrap();
        assert_eq!(
            chain,
            vec![
                "-m owner --uid-owner 0-9999 -j RETURN",
                "-m owner --uid-owner 10023 -j RETURN",
                "-m owner --uid-owner 10059 -j RETURN",
                "-m owner --uid-owner 10124 -j RETURN",
                "-j DROP",
            ]
        );
        let v6 = fx.filter.chain_v6("fw_dozable").unwrap();
        assert!(v6.iter().any(|r| r.contains("icmpv6")));
        Ok(())
    }

    #[tokio::test]
    async fn response_codes_follow_the_error_taxonomy() -> anyhow::Result<()> {
        let mut fx = fixture();

        let reply = fx.dispatcher.dispatch_line("7 interface list").await;
        assert_eq!(reply.code(), ResponseCode::CommandSyntaxError);
        assert_eq!(reply.cookie, "7");

        let reply = fx.dispatcher.dispatch_line("8 network create banana").await;
        assert_eq!(reply.code(), ResponseCode::CommandParameterError);

        // Parses fine, fails at the domain layer.
        let reply = fx.dispatcher.dispatch_line("9 network destroy 100").await;
        assert_eq!(reply.code(), ResponseCode::OperationFailed);
        assert_eq!(reply.cookie, "9");

        // No side effects from any of the failures.
        assert!(rules(&fx).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_create_fails_without_side_effects() -> anyhow::Result<()> {
        let mut fx = fixture();
        ok(&mut fx, "0 network create 100").await;

        let reply = fx.dispatcher.dispatch_line("1 network create 100").await;
        assert_eq!(reply.code(), ResponseCode::OperationFailed);
        assert!(reply.lines[0].message.contains("duplicate"));

        let reply = fx.dispatcher.dispatch_line("2 network create 5").await;
        assert_eq!(reply.code(), ResponseCode::OperationFailed);
        assert!(reply.lines[0].message.contains("invalid"));
        Ok(())
    }

    #[tokio::test]
    async fn network_list_reports_each_network_then_ok() -> anyhow::Result<()> {
        let mut fx = fixture();
        ok(&mut fx, "0 network create 100").await;
        ok(&mut fx, "0 network interface add 100 wlan0").await;
        ok(&mut fx, "0 network default set 100").await;
        ok(&mut fx, "0 network create 200 vpn 10000-10999 secure").await;

        let reply = fx.dispatcher.dispatch_line("5 network list").await;
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.lines[0].code, ResponseCode::ListResult);
        assert_eq!(
            reply.lines[0].message,
            "100 physical permission=NONE default interfaces=wlan0"
        );
        assert_eq!(
            reply.lines[1].message,
            "200 vpn uids=10000-10999 secure interfaces=-"
        );
        assert_eq!(reply.code(), ResponseCode::CommandOkay);
        Ok(())
    }
}
