//! The periodic background sweep.
//!
//! Driven entirely by the host's clock: pings peers and upstreams, chases
//! missing upstream identities, refreshes stale network configs, pushes
//! membership updates, detects online/offline transitions, and runs the
//! slow housekeeping of every cache. The whole sweep holds the
//! background-tasks lock, making it mutually exclusive with itself but not
//! with packet I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::host::{CallContext, Event};
use crate::identity::Address;
use crate::inet::LocalSocket;
use crate::network::{Network, NETWORK_AUTOCONF_DELAY};
use crate::peer::PEER_ACTIVITY_TIMEOUT;
use crate::sync::MutexExt;

use super::{
    Node, NodeError, NodeResult, CORE_TIMER_GRANULARITY, HOUSEKEEPING_PERIOD, PING_CHECK_INTERVAL,
};

impl Node {
    /// Run background work and compute the next deadline.
    ///
    /// The returned deadline is always at least
    /// [`CORE_TIMER_GRANULARITY`] past `now`; the host should call again no
    /// later than then. Any panic inside the sweep surfaces as
    /// [`NodeError::Internal`].
    pub fn process_background_tasks(&self, cc: CallContext, now: i64) -> NodeResult<i64> {
        self.now.store(now, Ordering::Relaxed);
        let mut state = self.background_tasks.lock_unpoisoned();

        let mut time_until_next_ping_check = PING_CHECK_INTERVAL;
        let since_last_ping_check = now - state.last_ping_check;
        if since_last_ping_check >= PING_CHECK_INTERVAL {
            state.last_ping_check = now;
            catch_unwind(AssertUnwindSafe(|| self.ping_check_sweep(cc, now)))
                .map_err(|_| NodeError::Internal)?;
        } else {
            time_until_next_ping_check -= since_last_ping_check;
        }

        if now - state.last_memoized_trace >= HOUSEKEEPING_PERIOD / 4 {
            state.last_memoized_trace = now;
            self.ctx.trace.update_memoized_settings(&self.networks);
        }

        if now - state.last_housekeeping >= HOUSEKEEPING_PERIOD {
            state.last_housekeeping = now;
            catch_unwind(AssertUnwindSafe(|| {
                self.topology.do_periodic_tasks(cc, now);
                self.self_awareness.clean(now);
                self.multicaster.clean(now);
            }))
            .map_err(|_| NodeError::Internal)?;
        }

        let switch_hint = catch_unwind(AssertUnwindSafe(|| self.switch.do_timer_tasks(cc, now)))
            .map_err(|_| NodeError::Internal)?;

        Ok(now + time_until_next_ping_check.min(switch_hint).max(CORE_TIMER_GRANULARITY))
    }

    /// The ping/contact pass.
    fn ping_check_sweep(&self, cc: CallContext, now: i64) {
        // upstreams (and pending moon seeds) we must stay in contact with
        let mut always_contact: HashMap<Address, Vec<SocketAddr>> = HashMap::new();
        self.topology.get_upstreams_to_contact(&mut always_contact);

        // online means: heard from a designated upstream recently
        let mut last_received_from_upstream = 0i64;
        for address in always_contact.keys() {
            if let Some(peer) = self.topology.get_peer(*address) {
                last_received_from_upstream =
                    last_received_from_upstream.max(peer.last_receive());
            }
        }

        // age out local-controller authorization memos
        self.local_controller_auth
            .lock_unpoisoned()
            .retain(|_, issued| now - *issued <= NETWORK_AUTOCONF_DELAY * 3);

        // one pass over the networks map: collect anchor contacts and
        // config staleness, holding the map lock only for the snapshot
        let mut network_config_needed: Vec<(Arc<Network>, bool)> = Vec::new();
        for network in self.networks.all() {
            network.always_contact_addresses(&mut always_contact);
            let stale = network.config_is_stale(now);
            network_config_needed.push((network, stale));
        }

        // ping policy over every known peer
        let best_upstream = self.topology.get_upstream_peer(now);
        self.topology.each_peer(|peer| {
            if let Some(endpoints) = always_contact.get(&peer.address()).cloned() {
                let sent = peer.do_ping_and_keepalive(&self.ctx, cc, now);
                let mut contacted = sent.any();

                // families the keepalive pass missed get a HELLO at a
                // random stable endpoint of that family
                if !sent.v4 {
                    contacted |= self.hello_random_endpoint(cc, peer, &endpoints, true, now);
                }
                if !sent.v6 {
                    contacted |= self.hello_random_endpoint(cc, peer, &endpoints, false, now);
                }

                // still nothing: ask our best upstream to introduce us by
                // HELLOing the peer through the upstream's path
                if !contacted {
                    if let Some(upstream) = &best_upstream {
                        if upstream.address() != peer.address() {
                            if let Some(path) = upstream.get_appropriate_path(now, true) {
                                peer.send_hello(
                                    &self.ctx,
                                    cc,
                                    path.local_socket(),
                                    path.address(),
                                    now,
                                );
                            }
                        }
                    }
                }

                // whatever survives this map at the end gets a WHOIS
                always_contact.remove(&peer.address());
            } else if peer.is_active(now) {
                peer.do_ping_and_keepalive(&self.ctx, cc, now);
            }
        });

        // upstream addresses we know no identity for yet
        for address in always_contact.keys() {
            self.switch.request_whois(cc, *address, now);
        }

        // refresh stale configs; push membership updates unconditionally
        for (network, stale) in network_config_needed {
            if stale {
                network.request_configuration(cc, now);
            }
            network.send_updates_to_members(cc, now);
        }

        // online state transition
        let online = (now - last_received_from_upstream < PEER_ACTIVITY_TIMEOUT)
            || self.topology.am_upstream();
        let was_online = self.online.swap(online, Ordering::Relaxed);
        if was_online != online {
            self.ctx.trace.online_state(online);
            self.ctx
                .event(cc, if online { &Event::Online } else { &Event::Offline });
        }
    }

    /// HELLO one endpoint of the requested family, starting at a
    /// PRNG-chosen index. Returns whether anything was sent.
    fn hello_random_endpoint(
        &self,
        cc: CallContext,
        peer: &Arc<crate::peer::Peer>,
        endpoints: &[SocketAddr],
        want_v4: bool,
        now: i64,
    ) -> bool {
        if endpoints.is_empty() {
            return false;
        }
        let start = self.prng_next() as usize;
        for k in 0..endpoints.len() {
            let endpoint = &endpoints[(start.wrapping_add(k)) % endpoints.len()];
            if endpoint.is_ipv4() == want_v4 {
                peer.send_hello(&self.ctx, cc, LocalSocket::ANY, endpoint, now);
                return true;
            }
        }
        false
    }
}
