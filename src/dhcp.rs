use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{DhcpSettings, RuntimePaths};
use crate::error::DhcpError;
use crate::process::{ProcessFactory, Subprocess};

pub trait DhcpServer {
    /// Leaves nothing behind when it fails.
    fn start(&mut self, interface: &str, settings: &DhcpSettings) -> Result<(), DhcpError>;

    fn stop(&mut self);
}

pub trait DhcpServerFactory {
    fn create_server(&self, service_id: u32) -> Box<dyn DhcpServer>;
}

pub struct DnsmasqServerFactory {
    pub paths: RuntimePaths,
    pub dnsmasq_path: PathBuf,
    pub ip_path: PathBuf,
    pub termination_timeout: Duration,
    pub process_factory: Rc<dyn ProcessFactory>,
}

impl DhcpServerFactory for DnsmasqServerFactory {
    fn create_server(&self, service_id: u32) -> Box<dyn DhcpServer> {
        Box::new(DnsmasqServer {
            config_path: self.paths.dnsmasq_config(service_id),
            lease_path: self.paths.dnsmasq_leases(service_id),
            dnsmasq_path: self.dnsmasq_path.clone(),
            ip_path: self.ip_path.clone(),
            termination_timeout: self.termination_timeout,
            process_factory: Rc::clone(&self.process_factory),
            process: None,
            assigned: None,
            files_written: false,
        })
    }
}

/// dnsmasq serving DHCP on a single AP interface.
pub struct DnsmasqServer {
    config_path: PathBuf,
    lease_path: PathBuf,
    dnsmasq_path: PathBuf,
    ip_path: PathBuf,
    termination_timeout: Duration,
    process_factory: Rc<dyn ProcessFactory>,
    process: Option<Box<dyn Subprocess>>,
    // (interface, address/prefix) added with `ip addr add`
    assigned: Option<(String, String)>,
    files_written: bool,
}

impl DnsmasqServer {
    fn try_start(&mut self, interface: &str, settings: &DhcpSettings) -> Result<(), DhcpError> {
        self.files_written = true;
        write_file(&self.config_path, &self.render(interface, settings)).map_err(|source| {
            DhcpError::Config {
                path: self.config_path.clone(),
                source,
            }
        })?;

        let address = format!("{}/{}", settings.server_address(), DhcpSettings::PREFIX_LEN);
        self.ip_addr("add", interface, &address)?;
        self.assigned = Some((interface.to_string(), address));

        let mut process = self.process_factory.create_process();
        process.start(
            &self.dnsmasq_path,
            &[
                OsString::from("--keep-in-foreground"),
                OsString::from("-C"),
                self.config_path.clone().into_os_string(),
            ],
        )?;
        self.process = Some(process);
        Ok(())
    }

    fn render(&self, interface: &str, settings: &DhcpSettings) -> String {
        format!(
            "port=0\nbind-interfaces\nlog-dhcp\ninterface={}\nlisten-address={}\ndhcp-range={},{}\ndhcp-leasefile={}\n",
            interface,
            settings.server_address(),
            settings.range_start(),
            settings.range_end(),
            self.lease_path.display()
        )
    }

    fn ip_addr(&self, action: &str, interface: &str, address: &str) -> Result<(), DhcpError> {
        let output = Command::new(&self.ip_path)
            .args(["addr", action, address, "dev", interface])
            .output()
            .map_err(|err| DhcpError::Address {
                interface: interface.to_string(),
                address: address.to_string(),
                reason: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(DhcpError::Address {
                interface: interface.to_string(),
                address: address.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl DhcpServer for DnsmasqServer {
    fn start(&mut self, interface: &str, settings: &DhcpSettings) -> Result<(), DhcpError> {
        match self.try_start(interface, settings) {
            Ok(()) => {
                info!(interface = %interface, address = %settings.server_address(), "dhcp server started");
                Ok(())
            }
            Err(err) => {
                self.stop();
                Err(err)
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate(self.termination_timeout);
        }
        if let Some((interface, address)) = self.assigned.take() {
            if let Err(err) = self.ip_addr("del", &interface, &address) {
                warn!("failed to remove dhcp server address: {}", err);
            }
        }
        if std::mem::take(&mut self.files_written) {
            for path in [&self.config_path, &self.lease_path] {
                remove_file(path);
            }
            debug!(config = %self.config_path.display(), "dhcp server files removed");
        }
    }
}

pub(crate) fn write_file(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, contents)
}

pub(crate) fn remove_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove file: {}", err),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::process::tests::FakeProcessFactory;
    use std::cell::{Cell, RefCell};

    #[derive(Debug, Default)]
    pub(crate) struct FakeDhcpState {
        pub interface: String,
        pub settings: Option<DhcpSettings>,
        pub running: bool,
        pub stopped: bool,
        pub processes_running_at_stop: Option<usize>,
    }

    struct FakeDhcpServer {
        state: Rc<RefCell<FakeDhcpState>>,
        fail_start: bool,
        processes: Option<FakeProcessFactory>,
    }

    impl DhcpServer for FakeDhcpServer {
        fn start(&mut self, interface: &str, settings: &DhcpSettings) -> Result<(), DhcpError> {
            if self.fail_start {
                return Err(DhcpError::Address {
                    interface: interface.to_string(),
                    address: settings.server_address().to_string(),
                    reason: "injected".to_string(),
                });
            }
            let mut state = self.state.borrow_mut();
            state.interface = interface.to_string();
            state.settings = Some(*settings);
            state.running = true;
            Ok(())
        }

        fn stop(&mut self) {
            let mut state = self.state.borrow_mut();
            state.running = false;
            state.stopped = true;
            state.processes_running_at_stop = self.processes.as_ref().map(|p| p.running_count());
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeDhcpFactory {
        pub fail_start: Rc<Cell<bool>>,
        pub servers: Rc<RefCell<Vec<Rc<RefCell<FakeDhcpState>>>>>,
        /// Sampled when a server stops, to check teardown order.
        pub processes: Option<FakeProcessFactory>,
    }

    impl FakeDhcpFactory {
        pub fn running_count(&self) -> usize {
            self.servers
                .borrow()
                .iter()
                .filter(|s| s.borrow().running)
                .count()
        }
    }

    impl DhcpServerFactory for FakeDhcpFactory {
        fn create_server(&self, _service_id: u32) -> Box<dyn DhcpServer> {
            let state = Rc::new(RefCell::new(FakeDhcpState::default()));
            self.servers.borrow_mut().push(Rc::clone(&state));
            Box::new(FakeDhcpServer {
                state,
                fail_start: self.fail_start.get(),
                processes: self.processes.clone(),
            })
        }
    }

    fn factory(run_dir: &Path, ip_path: &str, processes: &FakeProcessFactory) -> DnsmasqServerFactory {
        DnsmasqServerFactory {
            paths: RuntimePaths::new(run_dir),
            dnsmasq_path: PathBuf::from("/usr/sbin/dnsmasq"),
            ip_path: PathBuf::from(ip_path),
            termination_timeout: Duration::from_secs(2),
            process_factory: Rc::new(processes.clone()),
        }
    }

    #[test]
    fn start_writes_config_and_launches_dnsmasq() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcessFactory::default();
        let mut server = factory(dir.path(), "/bin/true", &processes).create_server(1);
        let settings = DhcpSettings {
            server_address_index: 3,
        };

        server.start("wlan0", &settings).unwrap();

        let paths = RuntimePaths::new(dir.path());
        let conf = std::fs::read_to_string(paths.dnsmasq_config(1)).unwrap();
        assert!(conf.contains("interface=wlan0\n"));
        assert!(conf.contains("listen-address=192.168.3.254\n"));
        assert!(conf.contains("dhcp-range=192.168.3.1,192.168.3.128\n"));
        assert!(conf.contains(&format!(
            "dhcp-leasefile={}\n",
            paths.dnsmasq_leases(1).display()
        )));

        let process = processes.last().unwrap();
        assert_eq!(process.borrow().program, PathBuf::from("/usr/sbin/dnsmasq"));
        assert_eq!(process.borrow().args[0], OsString::from("--keep-in-foreground"));
        assert!(process.borrow().running);

        server.stop();
        assert!(!process.borrow().running);
        assert!(!paths.dnsmasq_config(1).exists());
    }

    #[test]
    fn failed_address_assignment_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcessFactory::default();
        let mut server = factory(dir.path(), "/bin/false", &processes).create_server(2);

        let err = server
            .start("wlan0", &DhcpSettings { server_address_index: 0 })
            .unwrap_err();
        assert!(matches!(err, DhcpError::Address { .. }));
        assert!(!RuntimePaths::new(dir.path()).dnsmasq_config(2).exists());
        assert!(processes.processes.borrow().is_empty());
    }

    #[test]
    fn failed_spawn_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let processes = FakeProcessFactory::default();
        processes.fail_spawn.set(true);
        let mut server = factory(dir.path(), "/bin/true", &processes).create_server(4);

        let err = server
            .start("wlan0", &DhcpSettings { server_address_index: 0 })
            .unwrap_err();
        assert!(matches!(err, DhcpError::Process(_)));
        assert!(!RuntimePaths::new(dir.path()).dnsmasq_config(4).exists());
    }
}
