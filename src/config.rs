use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "/etc/apmanager/config.json";
const DEFAULT_RUN_DIR: &str = "/var/run/apmanager";
const HOSTAPD_DRIVER: &str = "nl80211";
const RSN_PAIRWISE: &str = "CCMP";
const WPA_KEY_MGMT: &str = "WPA-PSK";
const MAX_SSID_LEN: usize = 32;
const MIN_PASSPHRASE_LEN: usize = 8;
const MAX_PASSPHRASE_LEN: usize = 63;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub run_dir: PathBuf,
    pub hostapd_path: PathBuf,
    pub dnsmasq_path: PathBuf,
    pub ip_path: PathBuf,
    pub termination_timeout_secs: u64,
    pub pid_file: Option<PathBuf>,
    pub access_points: Vec<ApConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            hostapd_path: PathBuf::from("/usr/sbin/hostapd"),
            dnsmasq_path: PathBuf::from("/usr/sbin/dnsmasq"),
            ip_path: PathBuf::from("/sbin/ip"),
            termination_timeout_secs: 2,
            pid_file: None,
            access_points: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::new(&self.run_dir)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.run_dir.join("apmanager.pid"))
    }
}

/// Layout of generated files under the run directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimePaths {
    run_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn hostapd_config(&self, service_id: u32) -> PathBuf {
        self.run_dir
            .join("hostapd")
            .join(format!("hostapd-{}.conf", service_id))
    }

    pub fn hostapd_ctrl_iface(&self) -> PathBuf {
        self.run_dir.join("hostapd").join("ctrl_iface")
    }

    pub fn dnsmasq_config(&self, service_id: u32) -> PathBuf {
        self.run_dir
            .join("dnsmasq")
            .join(format!("dhcpd-{}.conf", service_id))
    }

    pub fn dnsmasq_leases(&self, service_id: u32) -> PathBuf {
        self.run_dir
            .join("dnsmasq")
            .join(format!("dhcpd-{}.leases", service_id))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HwMode {
    #[serde(rename = "802.11a", alias = "80211a")]
    A,
    #[serde(rename = "802.11b", alias = "80211b")]
    B,
    #[default]
    #[serde(rename = "802.11g", alias = "80211g")]
    G,
    #[serde(rename = "802.11n", alias = "80211n")]
    N,
}

impl HwMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HwMode::A => "802.11a",
            HwMode::B => "802.11b",
            HwMode::G => "802.11g",
            HwMode::N => "802.11n",
        }
    }

    fn accepts_channel(self, channel: u16) -> bool {
        let band_24 = (1..=13).contains(&channel);
        let band_5 = (34..=165).contains(&channel);
        match self {
            HwMode::A => band_5,
            HwMode::B | HwMode::G => band_24,
            HwMode::N => band_24 || band_5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    None,
    Rsn,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    /// Runs a DHCP server on the AP interface.
    #[default]
    Server,
    /// Attaches the AP interface to an existing bridge.
    Bridge,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApConfig {
    pub interface: String,
    pub ssid: String,
    #[serde(default = "default_channel")]
    pub channel: u16,
    #[serde(default)]
    pub hw_mode: HwMode,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub hidden_network: bool,
    #[serde(default)]
    pub operation_mode: OperationMode,
    #[serde(default)]
    pub bridge_interface: Option<String>,
    #[serde(default)]
    pub server_address_index: u16,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_channel() -> u16 {
    6
}

fn default_autostart() -> bool {
    true
}

impl ApConfig {
    pub fn new(interface: impl Into<String>, ssid: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ssid: ssid.into(),
            channel: default_channel(),
            hw_mode: HwMode::default(),
            security_mode: SecurityMode::default(),
            passphrase: None,
            hidden_network: false,
            operation_mode: OperationMode::default(),
            bridge_interface: None,
            server_address_index: 0,
            autostart: default_autostart(),
        }
    }

    pub fn dhcp_enabled(&self) -> bool {
        self.operation_mode == OperationMode::Server
    }

    pub fn dhcp_settings(&self) -> DhcpSettings {
        DhcpSettings {
            server_address_index: self.server_address_index as u8,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.trim().is_empty() {
            return Err(ConfigError::MissingInterface);
        }
        // Each of these lands on a single line of the hostapd or dnsmasq config.
        let line_values = [
            ("interface", Some(self.interface.as_str())),
            ("ssid", Some(self.ssid.as_str())),
            ("passphrase", self.passphrase.as_deref()),
            ("bridge_interface", self.bridge_interface.as_deref()),
        ];
        for (field, value) in line_values {
            if value.is_some_and(|v| v.chars().any(char::is_control)) {
                return Err(ConfigError::ControlCharacter { field });
            }
        }
        let ssid_len = self.ssid.len();
        if ssid_len == 0 || ssid_len > MAX_SSID_LEN {
            return Err(ConfigError::InvalidSsid(ssid_len));
        }
        if !self.hw_mode.accepts_channel(self.channel) {
            return Err(ConfigError::InvalidChannel {
                channel: self.channel,
                hw_mode: self.hw_mode.as_str(),
            });
        }
        if self.security_mode == SecurityMode::Rsn {
            let len = self.passphrase.as_deref().map_or(0, |p| p.chars().count());
            if !(MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&len) {
                return Err(ConfigError::InvalidPassphrase(len));
            }
        }
        match self.operation_mode {
            OperationMode::Bridge => {
                let bridge = self.bridge_interface.as_deref().unwrap_or("");
                if bridge.trim().is_empty() {
                    return Err(ConfigError::MissingBridgeInterface);
                }
            }
            OperationMode::Server => {
                if self.server_address_index > u8::MAX as u16 {
                    return Err(ConfigError::InvalidServerAddressIndex(
                        self.server_address_index,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validates and renders the hostapd configuration file contents.
    pub fn render_hostapd(&self, ctrl_iface: &Path) -> Result<String, ConfigError> {
        self.validate()?;

        let mut out = String::new();
        let _ = writeln!(out, "driver={}", HOSTAPD_DRIVER);
        let _ = writeln!(out, "ctrl_interface={}", ctrl_iface.display());
        let _ = writeln!(out, "interface={}", self.interface);
        if let (OperationMode::Bridge, Some(bridge)) =
            (self.operation_mode, self.bridge_interface.as_deref())
        {
            let _ = writeln!(out, "bridge={}", bridge);
        }
        let _ = writeln!(out, "ssid={}", self.ssid);
        if self.hidden_network {
            let _ = writeln!(out, "ignore_broadcast_ssid=1");
        }
        let _ = writeln!(out, "channel={}", self.channel);
        let hw_mode = match self.hw_mode {
            HwMode::A => "a",
            HwMode::B => "b",
            HwMode::G => "g",
            HwMode::N if self.channel > 14 => "a",
            HwMode::N => "g",
        };
        let _ = writeln!(out, "hw_mode={}", hw_mode);
        if self.hw_mode == HwMode::N {
            let _ = writeln!(out, "ieee80211n=1");
        }
        if self.security_mode == SecurityMode::Rsn {
            let _ = writeln!(out, "wpa=2");
            let _ = writeln!(out, "rsn_pairwise={}", RSN_PAIRWISE);
            let _ = writeln!(out, "wpa_key_mgmt={}", WPA_KEY_MGMT);
            let _ = writeln!(
                out,
                "wpa_passphrase={}",
                self.passphrase.as_deref().unwrap_or("")
            );
        }
        Ok(out)
    }
}

/// Addressing handed to the DHCP server for one AP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpSettings {
    pub server_address_index: u8,
}

impl DhcpSettings {
    pub const PREFIX_LEN: u8 = 24;

    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.server_address_index, 254)
    }

    pub fn range_start(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.server_address_index, 1)
    }

    pub fn range_end(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, self.server_address_index, 128)
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DaemonConfig::default()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}
