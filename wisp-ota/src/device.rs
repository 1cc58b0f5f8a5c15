use std::sync::Arc;

use async_trait::async_trait;

use wisp_proto::ble::{DeviceKind, OtaVersion};

use crate::dfu::{DfuType, DistributionStatus};

/// Characteristics of the upgrade service a transport exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaTarget {
    ControlPoint,
    Data,
    AppInfo,
}

/// What GATT discovery found on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaGatt {
    pub version: OtaVersion,
    pub has_app_info: bool,
}

/// Raw events surfaced by a transport while connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notified { target: OtaTarget, value: Vec<u8> },
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("characteristic not available: {0:?}")]
    MissingCharacteristic(OtaTarget),
    #[error("no OTA upgrade service on the device")]
    NoUpgradeService,
    #[error("{0}")]
    Backend(String),
}

/// A GATT link to one device. Implemented over btleplug for real
/// peripherals and over channel-backed fakes in tests.
#[async_trait]
pub trait GattTransport: Send {
    fn name(&self) -> &str;
    /// Stable identity (typically the BD address) used to recognize a
    /// device prepared in an earlier session.
    fn id(&self) -> &str;
    fn mtu(&self) -> usize;

    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;
    /// Discover the upgrade service and resolve its characteristics.
    async fn discover(&mut self) -> Result<OtaGatt, TransportError>;
    /// Enable or disable control point notifications.
    async fn set_notify(&mut self, enabled: bool) -> Result<(), TransportError>;
    async fn write(&mut self, target: OtaTarget, value: &[u8]) -> Result<(), TransportError>;
    async fn read(&mut self, target: OtaTarget) -> Result<Option<Vec<u8>>, TransportError>;
    /// Next notification or disconnect. `None` means the transport is gone.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// Mesh network operations needed by distribution upgrades. Backed by the
/// mesh stack bindings in the host application.
#[async_trait]
pub trait MeshClient: Send + Sync {
    async fn connect_component(&self, component: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    /// Firmware/component info string reported by the node, if any.
    async fn component_info(&self, component: &str) -> Result<Option<String>, TransportError>;
    async fn dfu_start(
        &self,
        dfu_type: DfuType,
        component: &str,
        firmware_id: &[u8; wisp_proto::FIRMWARE_ID_LEN],
        validation_data: &[u8],
    ) -> Result<(), TransportError>;
    async fn dfu_stop(&self) -> Result<(), TransportError>;
    async fn dfu_get_status(&self, component: &str) -> Result<DistributionStatus, TransportError>;
    fn is_network_connected(&self) -> bool;
}

/// Application-layer crypto for mesh proxy links. OTA payloads to mesh
/// components are encrypted before hitting the data characteristic and
/// notifications are decrypted before the session sees them.
pub trait MeshCipher: Send + Sync {
    fn encrypt(&self, component: &str, value: &[u8]) -> Result<Vec<u8>, TransportError>;
    fn decrypt(&self, component: &str, value: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Behavioral oddities of specific firmware builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceQuirks {
    /// Some builds reboot straight into the new image instead of answering
    /// the verify command; a disconnect while verify is pending counts as
    /// success. Off unless the caller knows the firmware does this.
    pub verify_by_disconnect: bool,
}

/// Everything the session needs to know about a device, detached from the
/// live transport so the state machine stays I/O-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub kind: DeviceKind,
    pub name: String,
    pub id: String,
    pub mtu: usize,
    pub quirks: DeviceQuirks,
}

impl DeviceProfile {
    pub fn same_device(&self, other: &DeviceProfile) -> bool {
        self.kind == other.kind && self.id == other.id
    }
}

/// An upgradeable device: a plain BLE peripheral, or a mesh component
/// reached through a proxy link.
pub enum OtaDevice {
    Ble {
        transport: Box<dyn GattTransport>,
        quirks: DeviceQuirks,
    },
    Mesh {
        transport: Box<dyn GattTransport>,
        component: String,
        mesh: Arc<dyn MeshClient>,
        cipher: Arc<dyn MeshCipher>,
    },
}

impl OtaDevice {
    pub fn kind(&self) -> DeviceKind {
        match self {
            OtaDevice::Ble { .. } => DeviceKind::Ble,
            OtaDevice::Mesh { .. } => DeviceKind::Mesh,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OtaDevice::Ble { transport, .. } => transport.name(),
            OtaDevice::Mesh { component, .. } => component,
        }
    }

    pub fn quirks(&self) -> DeviceQuirks {
        match self {
            OtaDevice::Ble { quirks, .. } => *quirks,
            OtaDevice::Mesh { .. } => DeviceQuirks::default(),
        }
    }

    pub fn profile(&self) -> DeviceProfile {
        let transport = self.transport();
        DeviceProfile {
            kind: self.kind(),
            name: self.name().to_string(),
            id: transport.id().to_string(),
            mtu: transport.mtu(),
            quirks: self.quirks(),
        }
    }

    pub fn mesh_client(&self) -> Option<Arc<dyn MeshClient>> {
        match self {
            OtaDevice::Ble { .. } => None,
            OtaDevice::Mesh { mesh, .. } => Some(Arc::clone(mesh)),
        }
    }

    fn transport(&self) -> &dyn GattTransport {
        match self {
            OtaDevice::Ble { transport, .. } | OtaDevice::Mesh { transport, .. } => {
                transport.as_ref()
            }
        }
    }

    fn transport_mut(&mut self) -> &mut dyn GattTransport {
        match self {
            OtaDevice::Ble { transport, .. } | OtaDevice::Mesh { transport, .. } => {
                transport.as_mut()
            }
        }
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if let OtaDevice::Mesh {
            component, mesh, ..
        } = self
        {
            mesh.connect_component(component).await?;
        }
        self.transport_mut().connect().await
    }

    pub async fn disconnect(&mut self) {
        if let Err(e) = self.transport_mut().disconnect().await {
            log::debug!("disconnect failed: {e}");
        }
        if let OtaDevice::Mesh { mesh, .. } = self {
            if let Err(e) = mesh.disconnect().await {
                log::debug!("mesh disconnect failed: {e}");
            }
        }
    }

    pub async fn discover(&mut self) -> Result<OtaGatt, TransportError> {
        self.transport_mut().discover().await
    }

    pub async fn set_notify(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.transport_mut().set_notify(enabled).await
    }

    /// Write a value, encrypting it first for mesh components.
    pub async fn write(&mut self, target: OtaTarget, value: &[u8]) -> Result<(), TransportError> {
        match self {
            OtaDevice::Ble { transport, .. } => transport.write(target, value).await,
            OtaDevice::Mesh {
                transport,
                component,
                cipher,
                ..
            } => {
                let sealed = cipher.encrypt(component, value)?;
                transport.write(target, &sealed).await
            }
        }
    }

    pub async fn read(&mut self, target: OtaTarget) -> Result<Option<Vec<u8>>, TransportError> {
        self.transport_mut().read(target).await
    }

    /// Next transport event, with mesh notification payloads decrypted.
    pub async fn next_event(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        match self {
            OtaDevice::Ble { transport, .. } => transport.next_event().await.map(Ok),
            OtaDevice::Mesh {
                transport,
                component,
                cipher,
                ..
            } => match transport.next_event().await? {
                TransportEvent::Notified { target, value } => {
                    Some(match cipher.decrypt(component, &value) {
                        Ok(value) => Ok(TransportEvent::Notified { target, value }),
                        Err(e) => Err(e),
                    })
                }
                TransportEvent::Disconnected => Some(Ok(TransportEvent::Disconnected)),
            },
        }
    }
}
