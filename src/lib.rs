//! Access point manager: supervises hostapd on a wireless interface and
//! keeps interface ownership and firewall port leases in sync with the
//! system services that hold them.

pub mod bus;
pub mod claims;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod firewall;
pub mod manager;
pub mod process;
pub mod resource_guard;
pub mod service;
