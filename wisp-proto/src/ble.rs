//! BLE GATT constants for the OTA upgrade service
//!
//! Two generations of the upgrade service exist in the field. V1 is the
//! original single-device OTA service; V2 adds the mesh DFU commands
//! (`apply`, DFU metadata in `prepareDownload`). Each generation also has a
//! "secure" service UUID variant with identical characteristics.

use uuid::{uuid, Uuid};

/// V1 upgrade service.
pub const SERVICE_UPGRADE_V1: Uuid = uuid!("ae5d1e47-5c13-43a0-8635-82ad38a1381f");
/// V1 secure upgrade service.
pub const SERVICE_SECURE_UPGRADE_V1: Uuid = uuid!("c7261110-f425-447a-a1bd-9d7246768bd8");
/// V1 control point characteristic (write + indicate).
pub const CHARACTERISTIC_CONTROL_POINT_V1: Uuid = uuid!("a3dd50bf-f7a7-4e99-838e-570a086c661b");
/// V1 data characteristic (write).
pub const CHARACTERISTIC_DATA_V1: Uuid = uuid!("a2e86c7a-d961-4091-b74f-2409e72efe26");
/// V1 app info characteristic (read, optional).
pub const CHARACTERISTIC_APP_INFO_V1: Uuid = uuid!("a47f7608-2e2d-47eb-913b-75d4edc4de4b");

/// V2 upgrade service (mesh DFU capable).
pub const SERVICE_UPGRADE_V2: Uuid = uuid!("10022922-ccf5-11e8-b680-025041000001");
/// V2 secure upgrade service.
pub const SERVICE_SECURE_UPGRADE_V2: Uuid = uuid!("10270b52-ccf5-11e8-8c28-025041000001");
/// V2 control point characteristic (write + indicate).
pub const CHARACTERISTIC_CONTROL_POINT_V2: Uuid = uuid!("1058fcfc-ccf5-11e8-b112-025041000001");
/// V2 data characteristic (write).
pub const CHARACTERISTIC_DATA_V2: Uuid = uuid!("107163c8-ccf5-11e8-9b81-025041000001");
/// V2 app info characteristic (read, optional).
pub const CHARACTERISTIC_APP_INFO_V2: Uuid = uuid!("10a51326-ccf5-11e8-ab31-025041000001");

/// All upgrade service UUIDs, for service discovery filters.
pub const OTA_SERVICES: [Uuid; 4] = [
    SERVICE_UPGRADE_V1,
    SERVICE_SECURE_UPGRADE_V1,
    SERVICE_UPGRADE_V2,
    SERVICE_SECURE_UPGRADE_V2,
];

/// All OTA characteristic UUIDs, for routing characteristic events.
pub const OTA_CHARACTERISTICS: [Uuid; 6] = [
    CHARACTERISTIC_CONTROL_POINT_V1,
    CHARACTERISTIC_DATA_V1,
    CHARACTERISTIC_APP_INFO_V1,
    CHARACTERISTIC_CONTROL_POINT_V2,
    CHARACTERISTIC_DATA_V2,
    CHARACTERISTIC_APP_INFO_V2,
];

pub fn is_ota_service(uuid: Uuid) -> bool {
    OTA_SERVICES.contains(&uuid)
}

pub fn is_ota_characteristic(uuid: Uuid) -> bool {
    OTA_CHARACTERISTICS.contains(&uuid)
}

/// Upgrade protocol generation, derived from which service was discovered.
/// Governs which commands are legal: `apply` and DFU start are V2-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaVersion {
    #[default]
    V1,
    V2,
}

impl OtaVersion {
    /// Classify a discovered upgrade service UUID.
    pub fn of_service(service: Uuid) -> Option<OtaVersion> {
        match service {
            SERVICE_UPGRADE_V1 | SERVICE_SECURE_UPGRADE_V1 => Some(OtaVersion::V1),
            SERVICE_UPGRADE_V2 | SERVICE_SECURE_UPGRADE_V2 => Some(OtaVersion::V2),
            _ => None,
        }
    }
}

/// Transport variant for the remote device. A HomeKit-style third variant
/// existed historically and is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Plain BLE peripheral, direct GATT link.
    Ble,
    /// Mesh node reached through the encrypted proxy overlay.
    Mesh,
}

/// Negotiated ATT MTU assumed when the platform stack exposes none.
pub const DEFAULT_MTU: usize = 185;

const LINK_LAYER_OVERHEAD: usize = 3;
const MESH_ENCRYPTION_OVERHEAD: usize = 17;

/// Largest data-characteristic payload for one transfer chunk.
///
/// Mesh payloads lose a further 17 bytes to the proxy encryption layer on
/// top of the 3 link-layer header bytes every write pays. An MTU smaller
/// than the overhead still yields one byte per chunk, so a bogus config
/// stalls instead of underflowing.
pub fn max_chunk_size(mtu: usize, kind: DeviceKind) -> usize {
    let overhead = match kind {
        DeviceKind::Mesh => LINK_LAYER_OVERHEAD + MESH_ENCRYPTION_OVERHEAD,
        DeviceKind::Ble => LINK_LAYER_OVERHEAD,
    };
    mtu.saturating_sub(overhead).max(1)
}
