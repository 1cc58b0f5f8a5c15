//! Wisp OTA - firmware upgrade engine for wireless devices
//!
//! This crate drives the whole upgrade: a pure state machine
//! ([`OtaSession`]) that turns transport events into ordered actions, and
//! an async driver ([`OtaUpgrader`]) that executes those actions over a
//! GATT transport, one command at a time. Mesh distribution (one upload,
//! many devices) rides on the same session.

mod config;
mod device;
mod dfu;
mod dispatch;
mod driver;
mod error;
mod event;
mod lock;
mod session;

pub use config::OtaConfig;
pub use device::{
    DeviceProfile, DeviceQuirks, GattTransport, MeshCipher, MeshClient, OtaDevice, OtaGatt,
    OtaTarget, TransportError, TransportEvent,
};
pub use dfu::{
    DfuCommand, DfuContext, DfuMetadata, DfuType, DistributionMonitor, DistributionStatus,
    FirmwareVersion, MetadataError,
};
pub use dispatch::{Dispatcher, Route};
pub use driver::{OtaUpgrader, StopHandle};
pub use error::{ErrorCode, OtaError};
pub use event::{Action, MeshOp, OtaEvent, OtaProgress};
pub use lock::{UpgradeLock, UpgradeToken};
pub use session::{OtaSession, OtaState};

// Re-export the wire layer so callers need only one import.
pub use wisp_proto::ble::{DeviceKind, OtaVersion};
pub use wisp_proto::{AppInfo, DistributionPhase, OtaCommand, OtaStatus};
