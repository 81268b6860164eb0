//! Seams to the remote system services this daemon coordinates with.
//!
//! The transport (D-Bus bindings, name watching) lives outside this crate.
//! Whatever drives it reports service appearance and owner changes as
//! [`BusEvent`]s and implements the two service traits below.

use std::os::fd::BorrowedFd;

use crate::error::RemoteError;

/// Name this daemon claims interfaces under.
pub const CLAIMER_NAME: &str = "org.chromium.apmanager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteService {
    Firewall,
    ConnectionManager,
}

impl RemoteService {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteService::Firewall => "firewall",
            RemoteService::ConnectionManager => "connection-manager",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// One-shot notification that a service became reachable.
    ServiceAvailable {
        service: RemoteService,
        available: bool,
    },
    NameOwnerChanged {
        service: RemoteService,
        old_owner: String,
        new_owner: String,
    },
}

/// Remote firewall that opens inbound ports on request.
///
/// Rules granted on a lifeline are revoked by the remote side once every
/// write end of that pipe has been closed.
pub trait FirewallService {
    /// Returns whether access was granted.
    fn request_udp_port_access(
        &mut self,
        port: u16,
        interface: &str,
        lifeline: BorrowedFd<'_>,
    ) -> Result<bool, RemoteError>;

    fn release_udp_port_access(&mut self, port: u16, interface: &str)
        -> Result<bool, RemoteError>;
}

/// Remote connection manager that owns network interfaces unless released.
pub trait ConnectionManagerService {
    fn claim_interface(&mut self, claimer: &str, interface: &str) -> Result<(), RemoteError>;

    fn release_interface(&mut self, claimer: &str, interface: &str) -> Result<(), RemoteError>;
}

/// Backend for running without a bus: every service reports as absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl FirewallService for Detached {
    fn request_udp_port_access(
        &mut self,
        _port: u16,
        _interface: &str,
        _lifeline: BorrowedFd<'_>,
    ) -> Result<bool, RemoteError> {
        Err(RemoteError::ServiceUnknown)
    }

    fn release_udp_port_access(
        &mut self,
        _port: u16,
        _interface: &str,
    ) -> Result<bool, RemoteError> {
        Err(RemoteError::ServiceUnknown)
    }
}

impl ConnectionManagerService for Detached {
    fn claim_interface(&mut self, _claimer: &str, _interface: &str) -> Result<(), RemoteError> {
        Err(RemoteError::ServiceUnknown)
    }

    fn release_interface(&mut self, _claimer: &str, _interface: &str) -> Result<(), RemoteError> {
        Err(RemoteError::ServiceUnknown)
    }
}
