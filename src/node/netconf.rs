//! Controller answer paths.
//!
//! When an in-process controller is installed, its answers flow back
//! through the engine: configurations are chunked, signed, and sent (or
//! applied locally when the member is ourselves), revocations ride a
//! credentials packet, and failures become ERROR replies.

use crate::controller::{ControllerErrorCode, ControllerSender};
use crate::host::CallContext;
use crate::identity::Address;
use crate::network::config::{NetworkConfig, Revocation};
use crate::packet::{ErrorCode, Packet, Verb, MAX_PACKET_PAYLOAD};

use super::{LocalControllerAuth, Node};
use crate::sync::MutexExt;

/// Ceiling on one config chunk: leave generous headroom in the packet for
/// the reply preamble, field framing, and trailing signature.
const CONFIG_CHUNK_MAX: usize = MAX_PACKET_PAYLOAD - 256;

impl Node {
    /// Chunk, sign, and send serialized configuration bytes.
    ///
    /// Each chunk carries the network ID, its slice of the dictionary, a
    /// shared nonzero update ID, the total size, the chunk's byte offset,
    /// and a signature over everything from the network ID onward. With a
    /// nonzero `request_packet_id` chunks are OK replies to the member's
    /// request; otherwise they are unsolicited config pushes.
    pub(crate) fn nc_send_config_bytes(
        &self,
        cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        destination: Address,
        dict_bytes: &[u8],
    ) {
        let now = self.now();
        let config_update_id = match self.prng_next() {
            0 => 1,
            id => id,
        };
        let total = dict_bytes.len();
        let mut chunk_index = 0usize;
        while chunk_index < total {
            let chunk_len = (total - chunk_index).min(CONFIG_CHUNK_MAX);
            let verb = if request_packet_id != 0 {
                Verb::Ok
            } else {
                Verb::NetworkConfig
            };
            let mut packet = Packet::outgoing(destination, self.ctx.address(), verb);
            if request_packet_id != 0 {
                packet.append_u8(Verb::NetworkConfigRequest as u8);
                packet.append_u64(request_packet_id);
            }

            let signed_from = packet.len();
            packet.append_u64(nwid);
            packet.append_u16(chunk_len as u16);
            packet.append_bytes(&dict_bytes[chunk_index..chunk_index + chunk_len]);
            packet.append_u8(0); // flags
            packet.append_u64(config_update_id);
            packet.append_u32(total as u32);
            packet.append_u32(chunk_index as u32);

            let Ok(signature) = self.ctx.identity.sign(&packet.as_bytes()[signed_from..]) else {
                return;
            };
            packet.append_u8(1);
            packet.append_u16_prefixed(&signature);

            self.switch.send(cc, packet, true, now);
            chunk_index += chunk_len;
        }
    }
}

impl ControllerSender for Node {
    fn nc_send_config(
        &self,
        cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        destination: Address,
        config: &NetworkConfig,
    ) {
        self.local_controller_auth.lock_unpoisoned().insert(
            LocalControllerAuth {
                nwid,
                member: destination,
            },
            self.now(),
        );

        if destination == self.ctx.address() {
            if let Some(network) = self.networks.get(nwid) {
                network.set_configuration(cc, config.clone(), true, self.now());
            }
            return;
        }
        let dict_bytes = config.to_dictionary().to_bytes();
        self.nc_send_config_bytes(cc, nwid, request_packet_id, destination, &dict_bytes);
    }

    fn nc_send_revocation(&self, cc: CallContext, destination: Address, rev: &Revocation) {
        if destination == self.ctx.address() {
            if let Some(network) = self.networks.get(rev.network_id) {
                network.add_credential_revocation(rev, Some(&self.ctx.identity), self.now());
            }
            return;
        }
        let mut packet = Packet::outgoing(destination, self.ctx.address(), Verb::NetworkCredentials);
        packet.append_u8(0); // no certificates of membership
        packet.append_u16(0); // capabilities
        packet.append_u16(0); // tags
        packet.append_u16(1); // exactly one revocation
        {
            let mut bytes = Vec::new();
            rev.marshal(&mut bytes);
            packet.append_bytes(&bytes);
        }
        packet.append_u16(0); // certificates of ownership
        self.switch.send(cc, packet, true, self.now());
    }

    fn nc_send_error(
        &self,
        cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        destination: Address,
        error: ControllerErrorCode,
    ) {
        if destination == self.ctx.address() {
            if let Some(network) = self.networks.get(nwid) {
                match error {
                    ControllerErrorCode::ObjectNotFound
                    | ControllerErrorCode::InternalServerError => network.set_not_found(),
                    ControllerErrorCode::AccessDenied => network.set_access_denied(),
                }
            }
            return;
        }
        if request_packet_id == 0 {
            // an ERROR in reply to nothing is meaningless; discard
            return;
        }
        let mut packet = Packet::outgoing(destination, self.ctx.address(), Verb::Error);
        packet.append_u8(Verb::NetworkConfigRequest as u8);
        packet.append_u64(request_packet_id);
        packet.append_u8(match error {
            ControllerErrorCode::AccessDenied => ErrorCode::NetworkAccessDenied as u8,
            _ => ErrorCode::ObjNotFound as u8,
        });
        packet.append_u64(nwid);
        self.switch.send(cc, packet, true, self.now());
    }
}
