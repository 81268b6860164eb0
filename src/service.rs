//! Per access point lifecycle.
//!
//! `Start` acquires, in order: the interface claim, the DHCP port lease,
//! the hostapd config file, the hostapd process and the DHCP server. Any
//! failure releases whatever was already acquired before the service is
//! marked failed. Resources are always released in reverse order so the
//! interface claim, which other system services observe, goes last.

use std::ffi::OsString;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::claims::InterfaceClaimManager;
use crate::config::{ApConfig, RuntimePaths};
use crate::dhcp::{remove_file, write_file, DhcpServer, DhcpServerFactory};
use crate::error::ServiceError;
use crate::firewall::FirewallManager;
use crate::process::{ProcessFactory, Subprocess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Started,
    Failed,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Idle => "Idle",
            ServiceState::Starting => "Starting",
            ServiceState::Started => "Started",
            ServiceState::Failed => "Failed",
        }
    }
}

/// Events raised by whatever watches the hostapd control socket.
///
/// `Start` marks the service started once hostapd is spawned, so `Started`
/// and the station events are informational. Only `Failed` and `Terminated`
/// drive a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostapdEvent {
    Started,
    Failed,
    Terminated,
    StationConnected(String),
    StationDisconnected(String),
}

/// Process-wide managers shared by every service.
pub struct Resources {
    pub firewall: FirewallManager,
    pub claims: InterfaceClaimManager,
}

#[derive(Clone)]
pub struct ServiceEnv {
    pub paths: RuntimePaths,
    pub hostapd_path: PathBuf,
    pub termination_timeout: Duration,
    pub process_factory: Rc<dyn ProcessFactory>,
    pub dhcp_factory: Rc<dyn DhcpServerFactory>,
}

#[derive(Default)]
struct Held {
    interface: Option<String>,
    dhcp_port: Option<String>,
    config_file: Option<PathBuf>,
    hostapd: Option<Box<dyn Subprocess>>,
    dhcp_server: Option<Box<dyn DhcpServer>>,
}

impl Held {
    fn is_empty(&self) -> bool {
        self.interface.is_none()
            && self.dhcp_port.is_none()
            && self.config_file.is_none()
            && self.hostapd.is_none()
            && self.dhcp_server.is_none()
    }
}

pub struct Service {
    id: u32,
    config: ApConfig,
    env: ServiceEnv,
    state: ServiceState,
    held: Held,
}

impl Service {
    pub fn new(id: u32, config: ApConfig, env: ServiceEnv) -> Self {
        Self {
            id,
            config,
            env,
            state: ServiceState::Idle,
            held: Held::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn config(&self) -> &ApConfig {
        &self.config
    }

    pub fn holds_resources(&self) -> bool {
        !self.held.is_empty()
    }

    pub fn start(&mut self, resources: &mut Resources) -> Result<(), ServiceError> {
        if matches!(self.state, ServiceState::Starting | ServiceState::Started) {
            return Err(ServiceError::AlreadyRunning);
        }
        info!(service_id = self.id, interface = %self.config.interface, "starting service");
        self.state = ServiceState::Starting;

        match self.acquire(resources) {
            Ok(()) => {
                self.state = ServiceState::Started;
                info!(service_id = self.id, ssid = %self.config.ssid, "service started");
                Ok(())
            }
            Err(err) => {
                error!(service_id = self.id, "failed to start service: {}", err);
                self.release_resources(resources);
                self.state = ServiceState::Failed;
                Err(err)
            }
        }
    }

    pub fn stop(&mut self, resources: &mut Resources) {
        if self.state == ServiceState::Idle {
            debug!(service_id = self.id, "service already idle");
            return;
        }
        info!(service_id = self.id, state = self.state.as_str(), "stopping service");
        self.release_resources(resources);
        self.state = ServiceState::Idle;
    }

    pub fn handle_hostapd_event(&mut self, event: HostapdEvent, resources: &mut Resources) {
        match &event {
            HostapdEvent::Started => {
                debug!(service_id = self.id, state = self.state.as_str(), "hostapd reports started");
            }
            HostapdEvent::Failed | HostapdEvent::Terminated => {
                if !matches!(self.state, ServiceState::Starting | ServiceState::Started) {
                    return;
                }
                error!(service_id = self.id, ?event, "hostapd stopped unexpectedly");
                self.release_resources(resources);
                self.state = ServiceState::Failed;
            }
            HostapdEvent::StationConnected(mac) => {
                info!(service_id = self.id, station = %mac, "station connected");
            }
            HostapdEvent::StationDisconnected(mac) => {
                info!(service_id = self.id, station = %mac, "station disconnected");
            }
        }
    }

    /// Liveness poll of the hostapd process.
    pub fn check_process(&mut self, resources: &mut Resources) {
        if self.state != ServiceState::Started {
            return;
        }
        let exited = match self.held.hostapd.as_mut() {
            Some(hostapd) => !hostapd.is_running(),
            None => true,
        };
        if exited {
            self.handle_hostapd_event(HostapdEvent::Terminated, resources);
        }
    }

    fn acquire(&mut self, resources: &mut Resources) -> Result<(), ServiceError> {
        let contents = self
            .config
            .render_hostapd(&self.env.paths.hostapd_ctrl_iface())?;
        let interface = self.config.interface.clone();

        resources.claims.claim_interface(&interface);
        self.held.interface = Some(interface.clone());

        if self.config.dhcp_enabled() {
            resources.firewall.request_dhcp_port_access(&interface)?;
            self.held.dhcp_port = Some(interface.clone());
        }

        let config_file = self.env.paths.hostapd_config(self.id);
        // Recorded first so a partially written file is still cleaned up.
        self.held.config_file = Some(config_file.clone());
        write_file(&config_file, &contents).map_err(|source| ServiceError::ConfigWrite {
            path: config_file.clone(),
            source,
        })?;

        let mut hostapd = self.env.process_factory.create_process();
        hostapd
            .start(&self.env.hostapd_path, &[OsString::from(&config_file)])
            .map_err(ServiceError::Hostapd)?;
        self.held.hostapd = Some(hostapd);

        if self.config.dhcp_enabled() {
            let mut server = self.env.dhcp_factory.create_server(self.id);
            server.start(&interface, &self.config.dhcp_settings())?;
            self.held.dhcp_server = Some(server);
        }
        Ok(())
    }

    fn release_resources(&mut self, resources: &mut Resources) {
        if let Some(mut server) = self.held.dhcp_server.take() {
            server.stop();
        }
        if let Some(mut hostapd) = self.held.hostapd.take() {
            hostapd.terminate(self.env.termination_timeout);
        }
        if let Some(interface) = self.held.dhcp_port.take() {
            resources.firewall.release_dhcp_port_access(&interface);
        }
        if let Some(interface) = self.held.interface.take() {
            resources.claims.release_interface(&interface);
        }
        if let Some(path) = self.held.config_file.take() {
            remove_file(&path);
        }
    }
}
