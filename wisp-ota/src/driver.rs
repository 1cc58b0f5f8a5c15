use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use crate::config::OtaConfig;
use crate::device::{OtaDevice, OtaTarget, TransportError, TransportEvent};
use crate::dfu::{DfuContext, DistributionMonitor};
use crate::error::{ErrorCode, OtaError};
use crate::event::{Action, MeshOp, OtaEvent, OtaProgress};
use crate::lock::UpgradeLock;
use crate::session::OtaSession;

/// Lets another task cancel a running upgrade. Stopping is cooperative:
/// the session unwinds through its abort phase rather than dropping the
/// link on the floor.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

/// Entry point for upgrades. Owns the configuration, the busy lock and
/// the progress channel; each call drives one session to completion.
pub struct OtaUpgrader {
    config: OtaConfig,
    lock: UpgradeLock,
    progress: mpsc::UnboundedSender<OtaProgress>,
    stop: Arc<Notify>,
}

impl OtaUpgrader {
    pub fn new(config: OtaConfig) -> (OtaUpgrader, mpsc::UnboundedReceiver<OtaProgress>) {
        let (progress, rx) = mpsc::unbounded_channel();
        (
            OtaUpgrader {
                config,
                lock: UpgradeLock::global().clone(),
                progress,
                stop: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Use a private lock instead of the process-wide one.
    pub fn with_lock(mut self, lock: UpgradeLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Upload and activate a firmware image on a single device.
    pub async fn upgrade(
        &self,
        device: &mut OtaDevice,
        firmware: Vec<u8>,
    ) -> Result<(), OtaError> {
        self.run(device, firmware, DfuContext::direct()).await
    }

    /// Run a distribution command (start, apply, status query) against a
    /// mesh distributor.
    pub async fn distribute(
        &self,
        device: &mut OtaDevice,
        dfu: DfuContext,
    ) -> Result<(), OtaError> {
        self.run(device, Vec::new(), dfu).await
    }

    /// Connect and interrogate the device without transferring anything.
    /// The returned session keeps the device claimed; pass it to
    /// [`resume`](Self::resume) to upgrade over the same link.
    pub async fn prepare(&self, device: &mut OtaDevice) -> Result<OtaSession, OtaError> {
        let token = self.lock.acquire()?;
        let mut session = OtaSession::new(token, device.profile(), self.config.clone());
        let actions = session.begin_prepare();
        let (session, result) = run_session(
            session,
            actions,
            device,
            &self.progress,
            Arc::clone(&self.stop),
        )
        .await;
        result.map(|_| session)
    }

    /// Continue a prepared session with the actual upgrade.
    pub async fn resume(
        &self,
        mut session: OtaSession,
        device: &mut OtaDevice,
        firmware: Vec<u8>,
        dfu: DfuContext,
    ) -> Result<(), OtaError> {
        if !session.profile().same_device(&device.profile()) {
            return Err(OtaError::new(
                session.state(),
                ErrorCode::InvalidParameters,
                "session was prepared for a different device",
            ));
        }
        let actions = session.begin_upgrade(firmware, dfu)?;
        run_session(
            session,
            actions,
            device,
            &self.progress,
            Arc::clone(&self.stop),
        )
        .await
        .1
    }

    /// A monitor that polls the distributor after a fire-and-forget
    /// distribution start. `None` for plain BLE devices.
    pub fn distribution_monitor(&self, device: &OtaDevice) -> Option<DistributionMonitor> {
        device
            .mesh_client()
            .map(|mesh| DistributionMonitor::new(mesh, device.name(), &self.config))
    }

    async fn run(
        &self,
        device: &mut OtaDevice,
        firmware: Vec<u8>,
        dfu: DfuContext,
    ) -> Result<(), OtaError> {
        let token = self.lock.acquire()?;
        let mut session = OtaSession::new(token, device.profile(), self.config.clone());
        let actions = session.begin_upgrade(firmware, dfu)?;
        run_session(
            session,
            actions,
            device,
            &self.progress,
            Arc::clone(&self.stop),
        )
        .await
        .1
    }
}

enum Outcome<T> {
    Done(T),
    TimedOut,
    Stopped,
}

async fn bounded<T>(
    stop: &Notify,
    limit: Duration,
    fut: impl Future<Output = T>,
) -> Outcome<T> {
    tokio::select! {
        // check for a pending stop first so cancellation is deterministic
        // even when the operation below is already ready
        biased;
        _ = stop.notified() => Outcome::Stopped,
        done = tokio::time::timeout(limit, fut) => match done {
            Ok(value) => Outcome::Done(value),
            Err(_) => Outcome::TimedOut,
        },
    }
}

/// Write a command to the control point and wait for the device to answer
/// through the response notification.
async fn command_exchange(device: &mut OtaDevice, bytes: &[u8]) -> OtaEvent {
    if let Err(e) = device.write(OtaTarget::ControlPoint, bytes).await {
        return OtaEvent::WriteCompleted {
            error: Some(e.to_string()),
        };
    }
    loop {
        match device.next_event().await {
            Some(Ok(TransportEvent::Notified {
                target: OtaTarget::ControlPoint,
                value,
            })) => {
                return OtaEvent::ValueUpdated {
                    target: OtaTarget::ControlPoint,
                    value: Some(value),
                    error: None,
                }
            }
            Some(Ok(TransportEvent::Notified { target, .. })) => {
                log::debug!("ignoring notification on {target:?} while a response is pending");
            }
            Some(Ok(TransportEvent::Disconnected)) | None => {
                return OtaEvent::ConnectionChanged {
                    connected: false,
                    error: None,
                }
            }
            Some(Err(e)) => {
                return OtaEvent::ValueUpdated {
                    target: OtaTarget::ControlPoint,
                    value: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Execute the session's actions one at a time, feeding results back in
/// until it completes. Commands are never pipelined.
pub(crate) async fn run_session(
    mut session: OtaSession,
    initial: Vec<Action>,
    device: &mut OtaDevice,
    progress: &mpsc::UnboundedSender<OtaProgress>,
    stop: Arc<Notify>,
) -> (OtaSession, Result<(), OtaError>) {
    let mut queue: VecDeque<Action> = initial.into();
    loop {
        let Some(action) = queue.pop_front() else {
            // the state machine always ends with a Complete action; an
            // empty queue before that is a driver bug
            let err = OtaError::new(session.state(), ErrorCode::Failed, "session stalled");
            return (session, Err(err));
        };
        log::trace!("executing {action:?}");
        let limit = session.phase_timeout();
        let outcome = match action {
            Action::Notify(update) => {
                let _ = progress.send(update);
                continue;
            }
            Action::Complete { error } => {
                let result = match error {
                    None => Ok(()),
                    Some(e) => Err(e),
                };
                return (session, result);
            }
            Action::Connect => {
                bounded(&stop, limit, async {
                    match device.connect().await {
                        Ok(()) => OtaEvent::ConnectionChanged {
                            connected: true,
                            error: None,
                        },
                        Err(e) => OtaEvent::ConnectionChanged {
                            connected: false,
                            error: Some(e.to_string()),
                        },
                    }
                })
                .await
            }
            Action::DiscoverService => {
                bounded(&stop, limit, async {
                    match device.discover().await {
                        Ok(gatt) => OtaEvent::ServiceDiscovered {
                            gatt: Some(gatt),
                            error: None,
                        },
                        Err(TransportError::NoUpgradeService) => OtaEvent::ServiceDiscovered {
                            gatt: None,
                            error: None,
                        },
                        Err(e) => OtaEvent::ServiceDiscovered {
                            gatt: None,
                            error: Some(e.to_string()),
                        },
                    }
                })
                .await
            }
            Action::SetNotifyEnabled(enabled) => {
                bounded(&stop, limit, async {
                    match device.set_notify(enabled).await {
                        Ok(()) => OtaEvent::NotificationChanged {
                            enabled,
                            error: None,
                        },
                        Err(e) => OtaEvent::NotificationChanged {
                            enabled: false,
                            error: Some(e.to_string()),
                        },
                    }
                })
                .await
            }
            Action::WriteCommand(bytes) => {
                bounded(&stop, limit, command_exchange(device, &bytes)).await
            }
            Action::WriteData(chunk) => {
                bounded(&stop, limit, async {
                    OtaEvent::WriteCompleted {
                        error: device
                            .write(OtaTarget::Data, &chunk)
                            .await
                            .err()
                            .map(|e| e.to_string()),
                    }
                })
                .await
            }
            Action::ReadAppInfo => {
                bounded(&stop, limit, async {
                    match device.read(OtaTarget::AppInfo).await {
                        Ok(value) => OtaEvent::ValueUpdated {
                            target: OtaTarget::AppInfo,
                            value,
                            error: None,
                        },
                        Err(e) => OtaEvent::ValueUpdated {
                            target: OtaTarget::AppInfo,
                            value: None,
                            error: Some(e.to_string()),
                        },
                    }
                })
                .await
            }
            Action::QueryComponentInfo => {
                let component = device.name().to_string();
                match device.mesh_client() {
                    None => Outcome::Done(OtaEvent::ComponentInfo { info: None }),
                    Some(mesh) => {
                        bounded(&stop, limit, async {
                            let info = match mesh.component_info(&component).await {
                                Ok(info) => info,
                                Err(e) => {
                                    log::warn!("component info lookup failed: {e}");
                                    None
                                }
                            };
                            OtaEvent::ComponentInfo { info }
                        })
                        .await
                    }
                }
            }
            Action::DfuStart {
                dfu_type,
                component,
                firmware_id,
                validation_data,
            } => match device.mesh_client() {
                None => Outcome::Done(OtaEvent::MeshResult {
                    op: MeshOp::DfuStart,
                    error: Some("not a mesh device".to_string()),
                }),
                Some(mesh) => {
                    bounded(&stop, limit, async {
                        OtaEvent::MeshResult {
                            op: MeshOp::DfuStart,
                            error: mesh
                                .dfu_start(dfu_type, &component, &firmware_id, &validation_data)
                                .await
                                .err()
                                .map(|e| e.to_string()),
                        }
                    })
                    .await
                }
            },
            Action::DfuStop => match device.mesh_client() {
                None => continue,
                Some(mesh) => {
                    // best effort while unwinding; never let it stall the abort
                    bounded(&stop, limit, async {
                        OtaEvent::MeshResult {
                            op: MeshOp::DfuStop,
                            error: mesh.dfu_stop().await.err().map(|e| e.to_string()),
                        }
                    })
                    .await
                }
            },
            Action::DfuGetStatus { component } => match device.mesh_client() {
                None => Outcome::Done(OtaEvent::MeshResult {
                    op: MeshOp::DfuGetStatus,
                    error: Some("not a mesh device".to_string()),
                }),
                Some(mesh) => {
                    bounded(&stop, limit, async {
                        OtaEvent::MeshResult {
                            op: MeshOp::DfuGetStatus,
                            error: mesh
                                .dfu_get_status(&component)
                                .await
                                .err()
                                .map(|e| e.to_string()),
                        }
                    })
                    .await
                }
            },
        };

        let event = match outcome {
            Outcome::Done(event) => event,
            Outcome::TimedOut => OtaEvent::TimerFired,
            Outcome::Stopped => {
                log::info!("stop requested, aborting the upgrade");
                queue.extend(session.request_stop());
                continue;
            }
        };
        queue.extend(session.advance(event));
    }
}
