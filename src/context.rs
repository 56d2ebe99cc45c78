//! Shared runtime handles.
//!
//! Engine subordinates never hold references to each other or back to the
//! engine; anything they all need lives in this immutable bundle, built
//! once during construction and shared by `Arc`. Collaborator-specific
//! dependencies are passed into operations as arguments instead.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use crate::controller::NetworkController;
use crate::host::{CallContext, Event, NodeHost, StateObjectKind};
use crate::identity::{Address, Identity};
use crate::inet::LocalSocket;
use crate::node::replies::ExpectedReplies;
use crate::sync::RwLockExt;
use crate::trace::Trace;

/// Immutable bundle of handles shared by all engine components.
pub(crate) struct Context {
    /// Host callback table (version already checked).
    pub host: Arc<dyn NodeHost>,
    /// Our full identity, secret halves included.
    pub identity: Identity,
    /// Canonical public identity string.
    pub public_identity_str: String,
    /// Canonical secret identity string.
    pub secret_identity_str: String,
    /// In-flight request nonces for which replies are acceptable.
    pub replies: ExpectedReplies,
    /// Optional in-process network controller.
    pub controller: RwLock<Option<Arc<dyn NetworkController>>>,
    /// Diagnostics sink.
    pub trace: Trace,
}

impl Context {
    /// Our overlay address.
    pub fn address(&self) -> Address {
        self.identity.address()
    }

    /// Post an event to the host.
    pub fn event(&self, cc: CallContext, event: &Event) {
        self.host.event(cc, event);
    }

    /// Send raw bytes out a wire path.
    pub fn wire_send(
        &self,
        cc: CallContext,
        local_socket: LocalSocket,
        remote: &SocketAddr,
        data: &[u8],
    ) -> bool {
        self.host.wire_packet_send(cc, local_socket, remote, data)
    }

    /// Fetch a persisted state object.
    pub fn state_get(&self, cc: CallContext, kind: StateObjectKind, scope: u64) -> Option<Vec<u8>> {
        self.host.state_object_get(cc, kind, scope)
    }

    /// Persist a state object.
    pub fn state_put(&self, cc: CallContext, kind: StateObjectKind, scope: u64, data: &[u8]) -> bool {
        self.host.state_object_put(cc, kind, scope, data)
    }

    /// Delete a persisted state object.
    pub fn state_delete(&self, cc: CallContext, kind: StateObjectKind, scope: u64) {
        self.host.state_object_delete(cc, kind, scope);
    }

    /// Snapshot the installed controller, if any.
    pub fn controller(&self) -> Option<Arc<dyn NetworkController>> {
        self.controller.read_unpoisoned().clone()
    }
}
