//! Wisp BLE - btleplug transport for OTA upgrades
//!
//! Wraps a btleplug peripheral as the [`GattTransport`](wisp_ota::GattTransport)
//! the upgrade driver needs, plus scanning helpers to find upgradeable
//! devices in the first place.

mod ble;

pub use ble::{default_adapter, find_device, scan, BlePeripheral, DiscoveredDevice};
