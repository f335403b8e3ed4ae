//! The per-socket state machine behind the fwmark service socket.
//!
//! A client sends one fixed-size command record plus one socket fd as
//! ancillary data; the daemon reads that socket's current mark, applies the
//! transition below, writes the mark back, replies with a single status
//! word and closes the connection. The reply is sent even on failure
//! because the client always blocks on it, and the connection is closed
//! unconditionally so a client that never reads cannot wedge the service.
//!
//! Record layout: two little-endian `u32`s, command id then netId.
//! Reply layout: one little-endian `i32`, 0 or a negative errno.

use nix::errno::Errno;

use crate::net_id::NetId;
use crate::network::NetworkController;
use crate::routing::{FilterOps, NetlinkOps};

use super::Fwmark;

pub const COMMAND_SIZE: usize = 8;

pub const ON_ACCEPT: u32 = 1;
pub const ON_CONNECT: u32 = 2;
pub const SELECT_NETWORK: u32 = 3;
pub const PROTECT_FROM_VPN: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FwmarkCommand {
    pub id: u32,
    pub net_id: NetId,
}

/// Decodes one command record. Anything but exactly [`COMMAND_SIZE`] bytes
/// is a framing error.
pub fn parse_command(bytes: &[u8]) -> Result<FwmarkCommand, Errno> {
    if bytes.len() != COMMAND_SIZE {
        return Err(Errno::EBADMSG);
    }
    let id = u32::from_le_bytes(bytes[0..4].try_into().expect("length checked"));
    let raw_net_id = u32::from_le_bytes(bytes[4..8].try_into().expect("length checked"));
    Ok(FwmarkCommand {
        id,
        net_id: NetId::new((raw_net_id & 0xffff) as u16),
    })
}

/// Runs one transition over a socket's current mark and returns the mark
/// to write back. Read-only against the network controller.
pub fn apply<N: NetlinkOps, F: FilterOps>(
    command: FwmarkCommand,
    client_uid: u32,
    mark_bits: u32,
    controller: &NetworkController<N, F>,
) -> Result<u32, Errno> {
    let mut fwmark = Fwmark::decode(mark_bits);
    let mut permission = controller.get_permission_for_user(client_uid);

    match command.id {
        ON_ACCEPT => {
            // The kernel stamped the netId and the listener's permission
            // bits on accept; just fold in the rest of this user's
            // permissions.
            permission = permission | fwmark.permission;
        }

        ON_CONNECT => {
            // Fill in the netId the caller's traffic should use, unless a
            // network was already selected explicitly. A protected socket
            // ignores any VPN claiming the UID.
            if !fwmark.explicitly_selected {
                fwmark.net_id = if fwmark.protected_from_vpn {
                    controller.get_default_network()
                } else {
                    controller.get_network_for_user(client_uid, NetId::UNSET, false)
                };
            }
        }

        SELECT_NETWORK => {
            fwmark.net_id = command.net_id;
            if command.net_id.is_unset() {
                fwmark.explicitly_selected = false;
                fwmark.protected_from_vpn = false;
                permission = crate::permission::Permission::NONE;
            } else if controller.can_user_select_network(client_uid, command.net_id) {
                fwmark.explicitly_selected = true;
                fwmark.protected_from_vpn = controller.can_protect(client_uid);
            } else {
                return Err(Errno::EPERM);
            }
        }

        PROTECT_FROM_VPN => {
            if !controller.can_protect(client_uid) {
                return Err(Errno::EPERM);
            }
            fwmark.protected_from_vpn = true;
            permission = permission | fwmark.permission;
        }

        _ => return Err(Errno::EPROTO),
    }

    fwmark.permission = permission;
    Ok(fwmark.encode())
}

/// The 4-byte reply: 0 on success, negative errno on failure.
pub fn encode_reply(result: &Result<(), Errno>) -> [u8; 4] {
    let status: i32 = match result {
        Ok(()) => 0,
        Err(errno) => -(*errno as i32),
    };
    status.to_le_bytes()
}

// ============================================================================
// Tests
// ============================================================================
