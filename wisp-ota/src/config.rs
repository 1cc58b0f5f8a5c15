use std::time::Duration;

use serde::{Deserialize, Serialize};

use wisp_proto::ble::DEFAULT_MTU;

/// Tunables for an upgrade session. The defaults match what the firmware
/// on the other end expects; override them only for devices that are
/// known to be slower (or a transport that negotiates a different MTU).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Timeout applied to every command/response exchange, in seconds.
    pub command_timeout_secs: u64,
    /// Extra margin on top of the command timeout while connecting,
    /// to cover scanning for a device that is slow to advertise.
    pub connect_margin_secs: u64,
    /// Timeout for GATT service discovery, in seconds.
    pub discover_timeout_secs: u64,
    /// Timeout for the verify exchange; flash checksum can take a while.
    pub verify_timeout_secs: u64,
    /// Upper bound on the ATT MTU used to size data chunks. The session
    /// uses the smaller of this and what the transport negotiated.
    pub mtu: usize,
    /// Polling interval for mesh distribution status, in seconds.
    pub dfu_status_interval_secs: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        OtaConfig {
            command_timeout_secs: 10,
            connect_margin_secs: 30,
            discover_timeout_secs: 30,
            verify_timeout_secs: 30,
            mtu: DEFAULT_MTU,
            dfu_status_interval_secs: 30,
        }
    }
}

impl OtaConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs + self.connect_margin_secs)
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_secs(self.discover_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn dfu_status_interval(&self) -> Duration {
        Duration::from_secs(self.dfu_status_interval_secs)
    }
}
