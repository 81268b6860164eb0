use std::path::PathBuf;

use thiserror::Error;

/// Failure reported by a remote bus service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The service has no owner on the bus (not running).
    #[error("remote service is not present")]
    ServiceUnknown,
    #[error("remote service error {code}: {message}")]
    Internal { code: String, message: String },
}

impl RemoteError {
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Internal {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_service_unknown(&self) -> bool {
        matches!(self, RemoteError::ServiceUnknown)
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("failed to create lifeline pipe: {0}")]
    Lifeline(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("process already started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("failed to write dhcp config {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to assign {address} to {interface}: {reason}")]
    Address {
        interface: String,
        address: String,
        reason: String,
    },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("interface name must not be empty")]
    MissingInterface,
    #[error("ssid must be 1 to 32 bytes, got {0}")]
    InvalidSsid(usize),
    #[error("passphrase must be 8 to 63 characters, got {0}")]
    InvalidPassphrase(usize),
    #[error("channel {channel} is not valid for hw mode {hw_mode}")]
    InvalidChannel { channel: u16, hw_mode: &'static str },
    #[error("bridge operation mode requires a bridge interface")]
    MissingBridgeInterface,
    #[error("server address index {0} is out of range")]
    InvalidServerAddressIndex(u16),
    #[error("{field} must not contain control characters")]
    ControlCharacter { field: &'static str },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,
    #[error("invalid access point config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("firewall lease failed: {0}")]
    Lease(#[from] LeaseError),
    #[error("failed to write hostapd config {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start hostapd: {0}")]
    Hostapd(#[source] ProcessError),
    #[error("failed to start dhcp server: {0}")]
    Dhcp(#[from] DhcpError),
    #[error("no service with id {0}")]
    UnknownService(u32),
    #[error("interface {interface} is already in use by service {owner}")]
    InterfaceInUse { interface: String, owner: u32 },
}
