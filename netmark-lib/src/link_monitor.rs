//! Kernel link-event subscription.
//!
//! Observes RTNLGRP_LINK and turns new-link / del-link messages into
//! [`LinkEvent`]s for the admin broadcast channel. Pure observation; daemon
//! state is never mutated from here. Quota alerts travel the same channel
//! but are produced by the accounting machinery, not this monitor.

use thiserror::Error as ThisError;

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::admin::ResponseCode;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("netlink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Added { name: String },
    Removed { name: String },
    LinkState { name: String, up: bool },
    QuotaAlert { alert: String, iface: String },
}

impl LinkEvent {
    /// The unsolicited broadcast line for this event, without the code.
    pub fn broadcast(&self) -> (ResponseCode, String) {
        match self {
            LinkEvent::Added { name } => (ResponseCode::InterfaceChange, format!("Iface added {name}")),
            LinkEvent::Removed { name } => (ResponseCode::InterfaceChange, format!("Iface removed {name}")),
            LinkEvent::LinkState { name, up } => (
                ResponseCode::InterfaceChange,
                format!("Iface linkstate {name} {}", if *up { "up" } else { "down" }),
            ),
            LinkEvent::QuotaAlert { alert, iface } => {
                (ResponseCode::BandwidthControl, format!("limit alert {alert} {iface}"))
            }
        }
    }
}

/// Folds raw new/del link observations into lifecycle events. A new index
/// is an addition; a known index whose carrier flipped is a link-state
/// change; renames update the map silently.
#[derive(Debug, Default)]
pub struct LinkTracker {
    links: HashMap<u32, (String, bool)>,
}

impl LinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_new(&mut self, index: u32, name: String, lower_up: bool) -> Vec<LinkEvent> {
        match self.links.insert(index, (name.clone(), lower_up)) {
            None => {
                let mut events = vec![LinkEvent::Added { name: name.clone() }];
                if lower_up {
                    events.push(LinkEvent::LinkState { name, up: true });
                }
                events
            }
            Some((_, was_up)) if was_up != lower_up => {
                vec![LinkEvent::LinkState { name, up: lower_up }]
            }
            Some(_) => vec![],
        }
    }

    pub fn observe_del(&mut self, index: u32, fallback_name: &str) -> LinkEvent {
        let name = self
            .links
            .remove(&index)
            .map(|(name, _)| name)
            .unwrap_or_else(|| fallback_name.to_string());
        LinkEvent::Removed { name }
    }
}

/// Subscribes to kernel link events and forwards them until the receiver
/// goes away.
#[cfg(target_os = "linux")]
pub async fn run(sender: mpsc::Sender<LinkEvent>) -> Result<(), Error> {
    use futures::StreamExt;
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
    use rtnetlink::packet_core::NetlinkPayload;
    use rtnetlink::sys::{AsyncSocket, SocketAddr};

    const RTMGRP_LINK: u32 = 1;

    let (mut conn, _handle, mut messages) = rtnetlink::new_connection()?;
    conn.socket_mut().socket_mut().bind(&SocketAddr::new(0, RTMGRP_LINK))?;
    tokio::spawn(conn);

    fn link_name(msg: &LinkMessage) -> Option<String> {
        msg.attributes.iter().find_map(|a| match a {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
    }

    let mut tracker = LinkTracker::new();
    tracing::info!("listening for kernel link events");

    while let Some((message, _addr)) = messages.next().await {
        let events = match message.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                let Some(name) = link_name(&link) else { continue };
                let lower_up = link.header.flags.contains(LinkFlags::LowerUp);
                tracker.observe_new(link.header.index, name, lower_up)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                let name = link_name(&link).unwrap_or_default();
                vec![tracker.observe_del(link.header.index, &name)]
            }
            _ => continue,
        };

        for event in events {
            tracing::debug!(?event, "link event");
            if sender.send(event).await.is_err() {
                tracing::debug!("link event receiver closed, stopping monitor");
                return Ok(());
            }
        }
    }

    Ok(())
}
