//! Firewall port leases brokered through the remote firewall service.
//!
//! Every lease request carries the read end of a lifeline pipe. The remote
//! service watches it and revokes all rules granted on its behalf once the
//! write end closes, which is how a crash of this daemon is detected. The
//! local lease sets are the source of truth for what must be replayed when
//! the remote service comes back.

use std::collections::BTreeSet;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use tracing::{debug, error, info, warn};

use crate::bus::FirewallService;
use crate::error::{LeaseError, RemoteError};

/// UDP port a DHCP server listens on.
pub const DHCP_SERVER_PORT: u16 = 67;

#[cfg(target_os = "linux")]
mod imp {
    use nix::fcntl::OFlag;
    use std::os::fd::OwnedFd;

    pub fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
        // CLOEXEC keeps spawned hostapd/dnsmasq from inheriting the write end.
        Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::{AsRawFd, OwnedFd};

    pub fn pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
        let (read, write) = nix::unistd::pipe()?;
        for fd in [&read, &write] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok((read, write))
    }
}

/// Both ends of the pipe the remote firewall uses to detect our death.
pub struct Lifeline {
    read: OwnedFd,
    // Held, never written. Closing it is the crash signal.
    _write: OwnedFd,
}

impl Lifeline {
    pub fn open() -> std::io::Result<Self> {
        let (read, write) = imp::pipe()?;
        Ok(Self {
            read,
            _write: write,
        })
    }

    pub fn read_end(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }
}

pub type LifelineOpener = fn() -> std::io::Result<Lifeline>;

pub struct FirewallManager {
    service: Box<dyn FirewallService>,
    open_lifeline: LifelineOpener,
    lifeline: Option<Lifeline>,
    dhcp_interfaces: BTreeSet<String>,
    udp_ports: BTreeSet<(String, u16)>,
}

impl FirewallManager {
    pub fn new(service: Box<dyn FirewallService>) -> Self {
        Self::with_lifeline_opener(service, Lifeline::open)
    }

    pub fn with_lifeline_opener(
        service: Box<dyn FirewallService>,
        open_lifeline: LifelineOpener,
    ) -> Self {
        Self {
            service,
            open_lifeline,
            lifeline: None,
            dhcp_interfaces: BTreeSet::new(),
            udp_ports: BTreeSet::new(),
        }
    }

    pub fn request_dhcp_port_access(&mut self, interface: &str) -> Result<(), LeaseError> {
        self.ensure_lifeline()?;
        self.dhcp_interfaces.insert(interface.to_string());
        self.send_request(DHCP_SERVER_PORT, interface);
        Ok(())
    }

    pub fn release_dhcp_port_access(&mut self, interface: &str) {
        if !self.dhcp_interfaces.contains(interface) {
            debug!(interface = %interface, "dhcp port access not held, nothing to release");
            return;
        }
        self.dhcp_interfaces.remove(interface);
        self.release_if_unused(DHCP_SERVER_PORT, interface);
        self.close_lifeline_if_idle();
    }

    pub fn request_udp_port_access(&mut self, interface: &str, port: u16) -> Result<(), LeaseError> {
        self.ensure_lifeline()?;
        self.udp_ports.insert((interface.to_string(), port));
        self.send_request(port, interface);
        Ok(())
    }

    pub fn release_udp_port_access(&mut self, interface: &str, port: u16) {
        let key = (interface.to_string(), port);
        if !self.udp_ports.contains(&key) {
            debug!(interface = %interface, port, "udp port access not held, nothing to release");
            return;
        }
        self.udp_ports.remove(&key);
        self.release_if_unused(port, interface);
        self.close_lifeline_if_idle();
    }

    /// One-shot notification that the firewall service became reachable.
    pub fn on_service_available(&mut self, available: bool) {
        info!(available, "firewall service availability changed");
        if !available {
            return;
        }
        self.resync_all();
    }

    pub fn on_owner_changed(&mut self, old_owner: &str, new_owner: &str) {
        info!(old_owner = %old_owner, new_owner = %new_owner, "firewall service owner changed");
        // Leases stay recorded until a new owner shows up.
        if new_owner.is_empty() {
            return;
        }
        self.resync_all();
    }

    /// Re-issue every recorded lease. A freshly started firewall service has
    /// no memory of rules granted to its predecessor.
    pub fn resync_all(&mut self) {
        if self.lease_count() == 0 {
            return;
        }
        info!(
            dhcp = self.dhcp_interfaces.len(),
            udp = self.udp_ports.len(),
            "replaying firewall leases"
        );
        let Some(lifeline) = self.lifeline.as_ref() else {
            error!("firewall leases recorded without a lifeline, skipping resync");
            return;
        };
        // A DHCP lease and a single-port lease on 67 are one remote rule.
        let rules: BTreeSet<(u16, &str)> = self
            .dhcp_interfaces
            .iter()
            .map(|interface| (DHCP_SERVER_PORT, interface.as_str()))
            .chain(
                self.udp_ports
                    .iter()
                    .map(|(interface, port)| (*port, interface.as_str())),
            )
            .collect();
        for (port, interface) in rules {
            request(self.service.as_mut(), lifeline, port, interface);
        }
    }

    /// Whether either lease set still covers the remote rule for `port` on
    /// `interface`.
    pub fn is_port_still_leased(&self, interface: &str, port: u16) -> bool {
        (port == DHCP_SERVER_PORT && self.dhcp_interfaces.contains(interface))
            || self.udp_ports.contains(&(interface.to_string(), port))
    }

    pub fn dhcp_interfaces(&self) -> &BTreeSet<String> {
        &self.dhcp_interfaces
    }

    pub fn udp_ports(&self) -> &BTreeSet<(String, u16)> {
        &self.udp_ports
    }

    pub fn lease_count(&self) -> usize {
        self.dhcp_interfaces.len() + self.udp_ports.len()
    }

    pub fn has_lifeline(&self) -> bool {
        self.lifeline.is_some()
    }

    fn ensure_lifeline(&mut self) -> Result<(), LeaseError> {
        if self.lifeline.is_none() {
            let lifeline = (self.open_lifeline)().map_err(LeaseError::Lifeline)?;
            debug!("lifeline pipe created");
            self.lifeline = Some(lifeline);
        }
        Ok(())
    }

    fn close_lifeline_if_idle(&mut self) {
        if self.lease_count() == 0 && self.lifeline.take().is_some() {
            debug!("last firewall lease released, lifeline pipe closed");
        }
    }

    fn send_request(&mut self, port: u16, interface: &str) {
        if let Some(lifeline) = self.lifeline.as_ref() {
            request(self.service.as_mut(), lifeline, port, interface);
        }
    }

    fn release_if_unused(&mut self, port: u16, interface: &str) {
        if self.is_port_still_leased(interface, port) {
            debug!(interface = %interface, port, "port still leased, keeping remote rule");
            return;
        }
        match self.service.release_udp_port_access(port, interface) {
            Ok(true) => debug!(interface = %interface, port, "udp port access released"),
            Ok(false) => warn!(interface = %interface, port, "firewall refused to release udp port"),
            Err(err) => log_remote_error("release udp port access", interface, port, &err),
        }
    }
}

fn request(service: &mut dyn FirewallService, lifeline: &Lifeline, port: u16, interface: &str) {
    match service.request_udp_port_access(port, interface, lifeline.read_end()) {
        Ok(true) => debug!(interface = %interface, port, "udp port access granted"),
        Ok(false) => warn!(interface = %interface, port, "firewall denied udp port access"),
        Err(err) => log_remote_error("request udp port access", interface, port, &err),
    }
}

fn log_remote_error(action: &str, interface: &str, port: u16, err: &RemoteError) {
    if err.is_service_unknown() {
        debug!(interface = %interface, port, "{}: firewall service not present", action);
    } else {
        error!(interface = %interface, port, "failed to {}: {}", action, err);
    }
}
