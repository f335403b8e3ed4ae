//! Parsing of admin command lines into typed commands.

use thiserror::Error as ThisError;

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::firewall::{ChildChain, FirewallMode, FirewallRule};
use crate::net_id::NetId;
use crate::permission::Permission;

/// `Syntax` is an unknown or structurally wrong command (500);
/// `Parameter` is a recognized command with a bad argument (501).
#[derive(Debug, ThisError)]
pub enum ParseError {
    #[error("{0}")]
    Syntax(String),
    #[error("{0}")]
    Parameter(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    NetworkCreatePhysical {
        net_id: NetId,
        permission: Permission,
    },
    NetworkCreateVirtual {
        net_id: NetId,
        uid_start: u32,
        uid_end: u32,
        secure: bool,
    },
    NetworkDestroy {
        net_id: NetId,
    },
    NetworkInterface {
        add: bool,
        net_id: NetId,
        iface: String,
    },
    NetworkDefaultSet {
        net_id: NetId,
    },
    NetworkDefaultClear,
    NetworkPermissionUser {
        permission: Permission,
        uids: Vec<u32>,
    },
    NetworkPermissionNetwork {
        permission: Permission,
        net_ids: Vec<NetId>,
    },
    NetworkUidRangeAdd {
        net_id: NetId,
        uid_start: u32,
        uid_end: u32,
        forward_dns: bool,
    },
    NetworkUidRangeRemove {
        net_id: NetId,
        uid_start: u32,
        uid_end: u32,
    },
    NetworkRoute {
        add: bool,
        legacy: bool,
        uid: u32,
        net_id: NetId,
        iface: String,
        destination: IpNetwork,
        nexthop: Option<IpAddr>,
    },
    NetworkList,
    FirewallEnable {
        mode: FirewallMode,
    },
    FirewallDisable,
    FirewallChain {
        chain: ChildChain,
        enable: bool,
    },
    FirewallSetUidRule {
        chain: ChildChain,
        uid: u32,
        rule: FirewallRule,
    },
    FirewallSetChain {
        name: String,
        mode: FirewallMode,
        uids: Vec<u32>,
    },
}

fn syntax(msg: impl Into<String>) -> ParseError {
    ParseError::Syntax(msg.into())
}

fn parameter(msg: impl Into<String>) -> ParseError {
    ParseError::Parameter(msg.into())
}

fn parse_net_id(token: &str) -> Result<NetId, ParseError> {
    token
        .parse::<NetId>()
        .map_err(|_| parameter(format!("invalid netId `{token}`")))
}

fn parse_uid(token: &str) -> Result<u32, ParseError> {
    token
        .parse::<u32>()
        .map_err(|_| parameter(format!("invalid uid `{token}`")))
}

fn parse_uid_range(token: &str) -> Result<(u32, u32), ParseError> {
    let (start, end) = token
        .split_once('-')
        .ok_or_else(|| parameter(format!("invalid uid range `{token}`")))?;
    Ok((parse_uid(start)?, parse_uid(end)?))
}

fn parse_permission(token: &str) -> Result<Permission, ParseError> {
    token
        .parse::<Permission>()
        .map_err(|e| parameter(e.to_string()))
}

fn parse_bool(token: &str) -> Result<bool, ParseError> {
    match token {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(parameter(format!("invalid boolean `{other}`"))),
    }
}

fn parse_mode(token: &str) -> Result<FirewallMode, ParseError> {
    match token {
        "whitelist" => Ok(FirewallMode::Whitelist),
        "blacklist" => Ok(FirewallMode::Blacklist),
        other => Err(parameter(format!("invalid firewall mode `{other}`"))),
    }
}

fn parse_child_chain(token: &str) -> Result<ChildChain, ParseError> {
    match token {
        "none" => Ok(ChildChain::None),
        "dozable" => Ok(ChildChain::Dozable),
        "standby" => Ok(ChildChain::Standby),
        other => Err(parameter(format!("invalid chain `{other}`"))),
    }
}

fn parse_destination(token: &str) -> Result<IpNetwork, ParseError> {
    token
        .parse::<IpNetwork>()
        .map_err(|_| parameter(format!("invalid destination `{token}`")))
}

fn parse_nexthop(token: &str) -> Result<IpAddr, ParseError> {
    token
        .parse::<IpAddr>()
        .map_err(|_| parameter(format!("invalid nexthop `{token}`")))
}

/// Parses a tokenized command (without the cookie).
pub fn parse(argv: &[String]) -> Result<AdminCommand, ParseError> {
    let words: Vec<&str> = argv.iter().map(String::as_str).collect();
    match words.as_slice() {
        ["network", rest @ ..] => parse_network(rest),
        ["firewall", rest @ ..] => parse_firewall(rest),
        [other, ..] => Err(syntax(format!("unknown command `{other}`"))),
        [] => Err(syntax("empty command")),
    }
}

fn parse_network(words: &[&str]) -> Result<AdminCommand, ParseError> {
    match words {
        ["create", net_id] => Ok(AdminCommand::NetworkCreatePhysical {
            net_id: parse_net_id(net_id)?,
            permission: Permission::NONE,
        }),
        ["create", net_id, "vpn", uid_range, rest @ ..] => {
            let (uid_start, uid_end) = parse_uid_range(uid_range)?;
            let secure = match rest {
                [] => false,
                ["secure"] => true,
                _ => return Err(syntax("usage: network create <netId> vpn <uidStart>-<uidEnd> [secure]")),
            };
            Ok(AdminCommand::NetworkCreateVirtual {
                net_id: parse_net_id(net_id)?,
                uid_start,
                uid_end,
                secure,
            })
        }
        ["create", net_id, permission] => Ok(AdminCommand::NetworkCreatePhysical {
            net_id: parse_net_id(net_id)?,
            permission: parse_permission(permission)?,
        }),
        ["destroy", net_id] => Ok(AdminCommand::NetworkDestroy {
            net_id: parse_net_id(net_id)?,
        }),
        ["interface", action @ ("add" | "remove"), net_id, iface] => Ok(AdminCommand::NetworkInterface {
            add: *action == "add",
            net_id: parse_net_id(net_id)?,
            iface: iface.to_string(),
        }),
        ["default", "set", net_id] => Ok(AdminCommand::NetworkDefaultSet {
            net_id: parse_net_id(net_id)?,
        }),
        ["default", "clear"] => Ok(AdminCommand::NetworkDefaultClear),
        ["permission", "user", "set", permission, uids @ ..] if !uids.is_empty() => {
            Ok(AdminCommand::NetworkPermissionUser {
                permission: parse_permission(permission)?,
                uids: uids.iter().map(|u| parse_uid(u)).collect::<Result<_, _>>()?,
            })
        }
        ["permission", "network", "set", permission, net_ids @ ..] if !net_ids.is_empty() => {
            Ok(AdminCommand::NetworkPermissionNetwork {
                permission: parse_permission(permission)?,
                net_ids: net_ids.iter().map(|n| parse_net_id(n)).collect::<Result<_, _>>()?,
            })
        }
        ["uidrange", "add", net_id, uid_range, forward_dns] => {
            let (uid_start, uid_end) = parse_uid_range(uid_range)?;
            Ok(AdminCommand::NetworkUidRangeAdd {
                net_id: parse_net_id(net_id)?,
                uid_start,
                uid_end,
                forward_dns: parse_bool(forward_dns)?,
            })
        }
        ["uidrange", "remove", net_id, uid_range] => {
            let (uid_start, uid_end) = parse_uid_range(uid_range)?;
            Ok(AdminCommand::NetworkUidRangeRemove {
                net_id: parse_net_id(net_id)?,
                uid_start,
                uid_end,
            })
        }
        ["route", action @ ("add" | "remove"), "legacy", uid, net_id, iface, destination, rest @ ..] => {
            Ok(AdminCommand::NetworkRoute {
                add: *action == "add",
                legacy: true,
                uid: parse_uid(uid)?,
                net_id: parse_net_id(net_id)?,
                iface: iface.to_string(),
                destination: parse_destination(destination)?,
                nexthop: parse_optional_nexthop(rest)?,
            })
        }
        ["route", action @ ("add" | "remove"), net_id, iface, destination, rest @ ..] => {
            Ok(AdminCommand::NetworkRoute {
                add: *action == "add",
                legacy: false,
                uid: 0,
                net_id: parse_net_id(net_id)?,
                iface: iface.to_string(),
                destination: parse_destination(destination)?,
                nexthop: parse_optional_nexthop(rest)?,
            })
        }
        ["list"] => Ok(AdminCommand::NetworkList),
        _ => Err(syntax("unknown or malformed network command")),
    }
}

fn parse_optional_nexthop(rest: &[&str]) -> Result<Option<IpAddr>, ParseError> {
    match rest {
        [] => Ok(None),
        [nexthop] => Ok(Some(parse_nexthop(nexthop)?)),
        _ => Err(syntax("too many route arguments")),
    }
}

fn parse_firewall(words: &[&str]) -> Result<AdminCommand, ParseError> {
    match words {
        ["enable", mode] => Ok(AdminCommand::FirewallEnable {
            mode: parse_mode(mode)?,
        }),
        ["disable"] => Ok(AdminCommand::FirewallDisable),
        ["chain", action @ ("enable" | "disable"), chain] => {
            let chain = parse_child_chain(chain)?;
            if chain == ChildChain::None {
                return Err(parameter("only dozable and standby can be toggled"));
            }
            Ok(AdminCommand::FirewallChain {
                chain,
                enable: *action == "enable",
            })
        }
        ["set_uid_rule", chain, uid, rule] => {
            let rule = match *rule {
                "allow" => FirewallRule::Allow,
                "deny" => FirewallRule::Deny,
                other => return Err(parameter(format!("invalid rule `{other}`"))),
            };
            Ok(AdminCommand::FirewallSetUidRule {
                chain: parse_child_chain(chain)?,
                uid: parse_uid(uid)?,
                rule,
            })
        }
        ["set_chain", name, mode, uids @ ..] => Ok(AdminCommand::FirewallSetChain {
            name: name.to_string(),
            mode: parse_mode(mode)?,
            uids: uids.iter().map(|u| parse_uid(u)).collect::<Result<_, _>>()?,
        }),
        _ => Err(syntax("unknown or malformed firewall command")),
    }
}
