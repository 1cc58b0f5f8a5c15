use uuid::Uuid;

use wisp_proto::ble::{is_ota_characteristic, DeviceKind};

/// Where an incoming GATT callback should go while the host also runs a
/// mesh stack over the same radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Deliver to the upgrade session.
    pub to_session: bool,
    /// Let the ordinary mesh stack see it too.
    pub to_mesh: bool,
}

/// Routes GATT traffic between an active upgrade session and the mesh
/// stack. While a non-mesh upgrade runs, the session owns the radio link
/// outright and everything else is suppressed; a mesh upgrade shares the
/// proxy link, so mesh traffic keeps flowing alongside it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    active: Option<DeviceKind>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    /// Mark an upgrade session as active for a device of the given kind.
    pub fn session_started(&mut self, kind: DeviceKind) {
        self.active = Some(kind);
    }

    pub fn session_ended(&mut self) {
        self.active = None;
    }

    pub fn is_session_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn route(&self, characteristic: Uuid) -> Route {
        let Some(kind) = self.active else {
            return Route {
                to_session: false,
                to_mesh: true,
            };
        };
        Route {
            to_session: is_ota_characteristic(characteristic),
            to_mesh: kind == DeviceKind::Mesh,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wisp_proto::ble::{CHARACTERISTIC_CONTROL_POINT_V2, CHARACTERISTIC_DATA_V1};

    const MESH_PROXY_DATA_OUT: Uuid = uuid::uuid!("00002ade-0000-1000-8000-00805f9b34fb");

    #[test]
    fn idle_dispatcher_passes_everything_to_mesh() {
        let d = Dispatcher::new();
        let r = d.route(CHARACTERISTIC_CONTROL_POINT_V2);
        assert!(!r.to_session);
        assert!(r.to_mesh);
    }

    #[test]
    fn ble_session_owns_the_link() {
        let mut d = Dispatcher::new();
        d.session_started(DeviceKind::Ble);
        assert_eq!(
            d.route(CHARACTERISTIC_DATA_V1),
            Route { to_session: true, to_mesh: false }
        );
        // unrelated traffic is suppressed entirely
        assert_eq!(
            d.route(MESH_PROXY_DATA_OUT),
            Route { to_session: false, to_mesh: false }
        );
    }

    #[test]
    fn mesh_session_shares_the_proxy_link() {
        let mut d = Dispatcher::new();
        d.session_started(DeviceKind::Mesh);
        assert_eq!(
            d.route(CHARACTERISTIC_CONTROL_POINT_V2),
            Route { to_session: true, to_mesh: true }
        );
        assert_eq!(
            d.route(MESH_PROXY_DATA_OUT),
            Route { to_session: false, to_mesh: true }
        );
        d.session_ended();
        assert!(d.route(MESH_PROXY_DATA_OUT).to_mesh);
    }
}
