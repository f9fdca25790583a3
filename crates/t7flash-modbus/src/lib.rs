//! t7flash-modbus - Modbus-TCP transport for the T7 upgrade pipeline
//!
//! The T7's Ethernet interface is standard Modbus TCP: every device
//! register is addressable as a pair of big-endian 16-bit holding
//! registers. [`TcpLink`] implements the pipeline's device-link contract
//! over one connection, and [`TcpEnumerator`] discovers devices by probing
//! a configured list of hosts. Probing doubles as the rediscovery
//! mechanism after the upgrade reboot, when the device drops its
//! connections and comes back up under the same address.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod protocol;

mod device;

pub use device::TcpLink;
pub use error::{ModbusError, Result};

use std::time::Duration;

use t7flash_core::link::{DeviceInfo, Enumerator};
use t7flash_core::Error;

/// T7-family product identifier.
const T7_PRODUCT_ID: u32 = 7;

/// Device discovery over a fixed list of hosts.
///
/// Ethernet has no bus to scan, so "enumeration" means probing each
/// configured address for a responding T7. Hosts that do not answer are
/// skipped silently at the debug level: a device that is mid-reboot
/// drops its connections, and that is the expected state while waiting
/// for it to come back.
pub struct TcpEnumerator {
    hosts: Vec<String>,
    connect_timeout: Duration,
}

impl TcpEnumerator {
    /// Build an enumerator over the given host addresses.
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Override the per-host connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn probe(&self, host: &str) -> Result<DeviceInfo> {
        let mut link = TcpLink::connect(host, self.connect_timeout)?;
        link.probe_info()
    }
}

impl Enumerator for TcpEnumerator {
    type Link = TcpLink;

    fn list_all(&mut self) -> t7flash_core::Result<Vec<DeviceInfo>> {
        let mut found = Vec::new();
        for host in &self.hosts {
            match self.probe(host) {
                Ok(info) if info.product_id as u32 == T7_PRODUCT_ID => found.push(info),
                Ok(info) => log::debug!(
                    "{host}: product id {} is not a T7, skipping",
                    info.product_id
                ),
                Err(e) => log::debug!("{host}: no device ({e})"),
            }
        }
        Ok(found)
    }

    fn open(&mut self, serial: u32) -> t7flash_core::Result<TcpLink> {
        for host in &self.hosts {
            let mut link = match TcpLink::connect(host, self.connect_timeout) {
                Ok(link) => link,
                Err(e) => {
                    log::debug!("{host}: no device ({e})");
                    continue;
                }
            };
            match link.probe_info() {
                Ok(info) if info.serial == serial => {
                    log::info!("opened device {serial} at {host}");
                    return Ok(link);
                }
                Ok(info) => log::debug!("{host}: serial {} does not match", info.serial),
                Err(e) => log::debug!("{host}: probe failed ({e})"),
            }
        }
        Err(Error::link(ModbusError::DeviceNotFound(serial)))
    }
}
