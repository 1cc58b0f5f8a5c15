//! btleplug-backed transport for OTA upgrades.
//!
//! Provides scanning helpers plus [`BlePeripheral`], the
//! [`GattTransport`] implementation the upgrade driver talks to.

use std::pin::Pin;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use std::time::Duration;
use uuid::Uuid;

use wisp_ota::{GattTransport, OtaGatt, OtaTarget, TransportError, TransportEvent};
use wisp_proto::ble::{
    is_ota_service, OtaVersion, CHARACTERISTIC_APP_INFO_V1, CHARACTERISTIC_APP_INFO_V2,
    CHARACTERISTIC_CONTROL_POINT_V1, CHARACTERISTIC_CONTROL_POINT_V2, CHARACTERISTIC_DATA_V1,
    CHARACTERISTIC_DATA_V2, DEFAULT_MTU,
};

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises one of the OTA upgrade services.
    pub upgradeable: bool,
}

fn backend(e: btleplug::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

/// Get the default Bluetooth adapter
pub async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(backend)?;
    let adapters = manager.adapters().await.map_err(backend)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Backend("no Bluetooth adapter found".to_string()))
}

/// Scan for BLE devices
///
/// Returns a list of discovered devices. Devices advertising an OTA
/// upgrade service have `upgradeable = true`.
pub async fn scan(duration_secs: u64) -> Result<Vec<DiscoveredDevice>, TransportError> {
    let adapter = default_adapter().await?;

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(backend)?;
    tokio::time::sleep(Duration::from_secs(duration_secs)).await;

    let peripherals = adapter.peripherals().await.map_err(backend)?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await.map_err(backend)? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            let upgradeable = props.services.iter().any(|&s| is_ota_service(s));

            devices.push(DiscoveredDevice {
                name,
                address,
                rssi: props.rssi,
                upgradeable,
            });
        }
    }

    adapter.stop_scan().await.map_err(backend)?;
    Ok(devices)
}

/// Find a device by name/address pattern, or any device advertising an
/// OTA upgrade service, and wrap it as a transport.
pub async fn find_device(target: Option<&str>) -> Result<BlePeripheral, TransportError> {
    let adapter = default_adapter().await?;

    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(backend)?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let peripherals = adapter.peripherals().await.map_err(backend)?;

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await.map_err(backend)? {
            let name = props.local_name.unwrap_or_default();
            let addr = peripheral.address().to_string();

            let matches = match target {
                Some(t) => name.contains(t) || addr.contains(t),
                None => props.services.iter().any(|&s| is_ota_service(s)),
            };

            if matches {
                adapter.stop_scan().await.map_err(backend)?;
                return BlePeripheral::new(&adapter, peripheral).await;
            }
        }
    }

    adapter.stop_scan().await.map_err(backend)?;
    Err(TransportError::Backend("no upgradeable device found".to_string()))
}

struct ResolvedGatt {
    version: OtaVersion,
    control_point: Characteristic,
    data: Characteristic,
    app_info: Option<Characteristic>,
}

/// Pick the upgrade service out of the discovered services and resolve
/// its characteristics.
fn resolve_gatt(services: impl IntoIterator<Item = Service>) -> Result<ResolvedGatt, TransportError> {
    for service in services {
        let Some(version) = OtaVersion::of_service(service.uuid) else {
            continue;
        };
        let mut control_point = None;
        let mut data = None;
        let mut app_info = None;
        for ch in service.characteristics {
            if ch.uuid == CHARACTERISTIC_CONTROL_POINT_V1
                || ch.uuid == CHARACTERISTIC_CONTROL_POINT_V2
            {
                control_point = Some(ch);
            } else if ch.uuid == CHARACTERISTIC_DATA_V1 || ch.uuid == CHARACTERISTIC_DATA_V2 {
                data = Some(ch);
            } else if ch.uuid == CHARACTERISTIC_APP_INFO_V1
                || ch.uuid == CHARACTERISTIC_APP_INFO_V2
            {
                app_info = Some(ch);
            }
        }
        let control_point =
            control_point.ok_or(TransportError::MissingCharacteristic(OtaTarget::ControlPoint))?;
        let data = data.ok_or(TransportError::MissingCharacteristic(OtaTarget::Data))?;
        return Ok(ResolvedGatt {
            version,
            control_point,
            data,
            app_info,
        });
    }
    Err(TransportError::NoUpgradeService)
}

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;
type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// One BLE peripheral as seen by the upgrade driver.
pub struct BlePeripheral {
    peripheral: Peripheral,
    events: CentralEvents,
    notifications: Option<Notifications>,
    gatt: Option<ResolvedGatt>,
    name: String,
    id: String,
    mtu: usize,
}

impl BlePeripheral {
    pub async fn new(adapter: &Adapter, peripheral: Peripheral) -> Result<Self, TransportError> {
        let events = adapter.events().await.map_err(backend)?;
        let name = peripheral
            .properties()
            .await
            .map_err(backend)?
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| "Unknown".to_string());
        let id = peripheral.address().to_string();
        Ok(BlePeripheral {
            peripheral,
            events,
            notifications: None,
            gatt: None,
            name,
            id,
            mtu: DEFAULT_MTU,
        })
    }

    /// Override the assumed ATT MTU. btleplug does not expose the
    /// negotiated value, so callers who know better can set it.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    fn characteristic(&self, target: OtaTarget) -> Result<&Characteristic, TransportError> {
        let gatt = self
            .gatt
            .as_ref()
            .ok_or(TransportError::MissingCharacteristic(target))?;
        match target {
            OtaTarget::ControlPoint => Ok(&gatt.control_point),
            OtaTarget::Data => Ok(&gatt.data),
            OtaTarget::AppInfo => gatt
                .app_info
                .as_ref()
                .ok_or(TransportError::MissingCharacteristic(target)),
        }
    }

    fn target_of(&self, uuid: Uuid) -> Option<OtaTarget> {
        let gatt = self.gatt.as_ref()?;
        if uuid == gatt.control_point.uuid {
            Some(OtaTarget::ControlPoint)
        } else if uuid == gatt.data.uuid {
            Some(OtaTarget::Data)
        } else if gatt.app_info.as_ref().map(|c| c.uuid) == Some(uuid) {
            Some(OtaTarget::AppInfo)
        } else {
            None
        }
    }
}

#[async_trait]
impl GattTransport for BlePeripheral {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.peripheral.connect().await.map_err(backend)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.notifications = None;
        self.peripheral.disconnect().await.map_err(backend)
    }

    async fn discover(&mut self) -> Result<OtaGatt, TransportError> {
        self.peripheral.discover_services().await.map_err(backend)?;
        let gatt = resolve_gatt(self.peripheral.services())?;
        let summary = OtaGatt {
            version: gatt.version,
            has_app_info: gatt.app_info.is_some(),
        };
        log::debug!(
            "{}: found {:?} upgrade service (app info: {})",
            self.name,
            gatt.version,
            summary.has_app_info
        );
        self.gatt = Some(gatt);
        Ok(summary)
    }

    async fn set_notify(&mut self, enabled: bool) -> Result<(), TransportError> {
        let control_point = self.characteristic(OtaTarget::ControlPoint)?.clone();
        if enabled {
            self.peripheral
                .subscribe(&control_point)
                .await
                .map_err(backend)?;
            self.notifications =
                Some(self.peripheral.notifications().await.map_err(backend)?);
        } else {
            self.peripheral
                .unsubscribe(&control_point)
                .await
                .map_err(backend)?;
            self.notifications = None;
        }
        Ok(())
    }

    async fn write(&mut self, target: OtaTarget, value: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(target)?.clone();
        self.peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(backend)
    }

    async fn read(&mut self, target: OtaTarget) -> Result<Option<Vec<u8>>, TransportError> {
        let characteristic = self.characteristic(target)?.clone();
        let value = self.peripheral.read(&characteristic).await.map_err(backend)?;
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        enum Polled {
            Notification(Option<ValueNotification>),
            Central(Option<CentralEvent>),
        }

        loop {
            let BlePeripheral {
                events,
                notifications,
                ..
            } = self;
            let polled = match notifications.as_mut() {
                Some(stream) => tokio::select! {
                    n = stream.next() => Polled::Notification(n),
                    e = events.next() => Polled::Central(e),
                },
                None => Polled::Central(events.next().await),
            };
            match polled {
                Polled::Notification(Some(n)) => match self.target_of(n.uuid) {
                    Some(target) => {
                        return Some(TransportEvent::Notified {
                            target,
                            value: n.value,
                        })
                    }
                    None => log::debug!("notification on unknown characteristic {}", n.uuid),
                },
                // the notification stream closing means the link is gone
                Polled::Notification(None) => return Some(TransportEvent::Disconnected),
                Polled::Central(Some(CentralEvent::DeviceDisconnected(id))) => {
                    if id == self.peripheral.id() {
                        return Some(TransportEvent::Disconnected);
                    }
                }
                Polled::Central(Some(_)) => {}
                Polled::Central(None) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use wisp_proto::ble::{SERVICE_UPGRADE_V1, SERVICE_UPGRADE_V2};

    fn characteristic(service_uuid: Uuid, uuid: Uuid) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties: btleplug::api::CharPropFlags::empty(),
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, characteristics: Vec<Characteristic>) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    #[test]
    fn resolves_a_v1_service() {
        let services = vec![service(
            SERVICE_UPGRADE_V1,
            vec![
                characteristic(SERVICE_UPGRADE_V1, CHARACTERISTIC_CONTROL_POINT_V1),
                characteristic(SERVICE_UPGRADE_V1, CHARACTERISTIC_DATA_V1),
                characteristic(SERVICE_UPGRADE_V1, CHARACTERISTIC_APP_INFO_V1),
            ],
        )];
        let gatt = resolve_gatt(services).unwrap();
        assert_eq!(gatt.version, OtaVersion::V1);
        assert!(gatt.app_info.is_some());
    }

    #[test]
    fn v2_without_app_info_still_resolves() {
        let services = vec![service(
            SERVICE_UPGRADE_V2,
            vec![
                characteristic(SERVICE_UPGRADE_V2, CHARACTERISTIC_CONTROL_POINT_V2),
                characteristic(SERVICE_UPGRADE_V2, CHARACTERISTIC_DATA_V2),
            ],
        )];
        let gatt = resolve_gatt(services).unwrap();
        assert_eq!(gatt.version, OtaVersion::V2);
        assert!(gatt.app_info.is_none());
    }

    #[test]
    fn unrelated_services_are_rejected() {
        let battery = uuid::uuid!("0000180f-0000-1000-8000-00805f9b34fb");
        let services = vec![service(battery, vec![])];
        assert!(matches!(
            resolve_gatt(services),
            Err(TransportError::NoUpgradeService)
        ));
    }

    #[test]
    fn missing_data_characteristic_is_an_error() {
        let services = vec![service(
            SERVICE_UPGRADE_V1,
            vec![characteristic(
                SERVICE_UPGRADE_V1,
                CHARACTERISTIC_CONTROL_POINT_V1,
            )],
        )];
        assert!(matches!(
            resolve_gatt(services),
            Err(TransportError::MissingCharacteristic(OtaTarget::Data))
        ));
    }
}
