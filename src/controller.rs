//! Network controller boundary.
//!
//! A controller issues signed network configurations. Most nodes talk to a
//! remote controller over the overlay, but a host may install an in-process
//! controller; the engine then routes configuration requests for networks
//! whose controller address is our own address directly to it, and the
//! controller answers back through [`ControllerSender`].

use std::sync::Weak;

use crate::dictionary::Dictionary;
use crate::host::CallContext;
use crate::identity::{Address, Identity};
use crate::network::config::{NetworkConfig, Revocation};

/// Error outcomes a controller can report for a configuration request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerErrorCode {
    /// The network does not exist.
    ObjectNotFound,
    /// The requesting member is not authorized.
    AccessDenied,
    /// The controller failed internally.
    InternalServerError,
}

/// The answer path from an in-process controller back into the engine.
///
/// Implemented by the node engine; handed to the controller at
/// installation.
pub trait ControllerSender: Send + Sync {
    /// Deliver a network configuration to a member (possibly ourselves).
    fn nc_send_config(
        &self,
        cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        destination: Address,
        config: &NetworkConfig,
    );

    /// Deliver a credential revocation to a member (possibly ourselves).
    fn nc_send_revocation(&self, cc: CallContext, destination: Address, rev: &Revocation);

    /// Report a request failure to a member (possibly ourselves).
    fn nc_send_error(
        &self,
        cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        destination: Address,
        error: ControllerErrorCode,
    );
}

/// An in-process network controller.
pub trait NetworkController: Send + Sync {
    /// Called once at installation with the identity configurations will be
    /// signed under and the engine back-reference for answers.
    fn init(&self, signing_identity: &Identity, sender: Weak<dyn ControllerSender>);

    /// Handle a member's configuration request.
    ///
    /// Answers go back through the sender *after* this call returns (from a
    /// worker or a later tick). Join-time requests arrive while the engine
    /// holds its networks lock, so calling the sender from inside `request`
    /// can deadlock.
    fn request(
        &self,
        cc: CallContext,
        nwid: u64,
        request_packet_id: u64,
        from: &Identity,
        metadata: &Dictionary,
    );
}
