use serde::{Deserialize, Serialize};

use wisp_proto::ble::{max_chunk_size, DeviceKind, OtaVersion};
use wisp_proto::{AppInfo, ImageCrc, OtaCommand, OtaStatus};

use crate::config::OtaConfig;
use crate::device::{DeviceProfile, OtaGatt, OtaTarget};
use crate::dfu::{DfuCommand, DfuContext, DfuType};
use crate::error::{ErrorCode, OtaError};
use crate::event::{Action, MeshOp, OtaEvent, OtaProgress};
use crate::lock::UpgradeToken;

/// Phases of an upgrade session, in the order a full direct upgrade walks
/// through them. The ordering is meaningful: a disconnect after
/// `EnableNotification` means the device may hold a half-written image and
/// the session unwinds through `Abort`; before or at it, the device was
/// never touched and the session completes directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OtaState {
    Idle,
    Connect,
    ServiceDiscover,
    ReadAppInfo,
    EnableNotification,
    PrepareDownload,
    StartDownload,
    DataTransfer,
    Verify,
    Apply,
    DfuStart,
    Abort,
    Complete,
}

impl OtaState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for OtaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OtaState::Idle => "idle",
            OtaState::Connect => "connect",
            OtaState::ServiceDiscover => "service_discover",
            OtaState::ReadAppInfo => "read_app_info",
            OtaState::EnableNotification => "enable_notification",
            OtaState::PrepareDownload => "prepare_download",
            OtaState::StartDownload => "start_download",
            OtaState::DataTransfer => "data_transfer",
            OtaState::Verify => "verify",
            OtaState::Apply => "apply",
            OtaState::DfuStart => "dfu_start",
            OtaState::Abort => "abort",
            OtaState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// The upgrade state machine. It performs no I/O itself: the driver feeds
/// it [`OtaEvent`]s and executes the [`Action`]s it returns, strictly in
/// order. One command or transfer is in flight at a time.
pub struct OtaSession {
    token: Option<UpgradeToken>,
    config: OtaConfig,
    profile: DeviceProfile,
    state: OtaState,

    prepare_only: bool,
    prepare_ready: bool,
    connected: bool,
    gatt: Option<OtaGatt>,

    firmware: Vec<u8>,
    chunk_size: usize,
    offset: usize,
    transferring: usize,
    crc: Option<ImageCrc>,
    image_crc: Option<u32>,

    dfu: DfuContext,
    distribution_started: bool,
    component_query_issued: bool,

    pending_error: Option<OtaError>,
    timer_armed: bool,
}

impl OtaSession {
    pub fn new(token: UpgradeToken, profile: DeviceProfile, config: OtaConfig) -> OtaSession {
        // the transport reports what the link negotiated; the config can
        // only cap it further
        let chunk_size = max_chunk_size(profile.mtu.min(config.mtu), profile.kind);
        OtaSession {
            token: Some(token),
            config,
            profile,
            state: OtaState::Idle,
            prepare_only: false,
            prepare_ready: false,
            connected: false,
            gatt: None,
            firmware: Vec::new(),
            chunk_size,
            offset: 0,
            transferring: 0,
            crc: None,
            image_crc: None,
            dfu: DfuContext::direct(),
            distribution_started: false,
            component_query_issued: false,
            pending_error: None,
            timer_armed: false,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn error(&self) -> Option<&OtaError> {
        self.pending_error.as_ref()
    }

    /// True once a prepare pass finished and the link is still up, so a
    /// follow-up upgrade can skip connect and discovery.
    pub fn is_prepared(&self) -> bool {
        self.prepare_ready && self.connected
    }

    pub fn is_complete(&self) -> bool {
        self.state == OtaState::Complete
    }

    pub fn distribution_started(&self) -> bool {
        self.distribution_started
    }

    /// How long the driver should wait for the response to the phase that
    /// is currently in flight.
    pub fn phase_timeout(&self) -> std::time::Duration {
        match self.state {
            OtaState::Connect => self.config.connect_timeout(),
            OtaState::ServiceDiscover => self.config.discover_timeout(),
            OtaState::Verify => self.config.verify_timeout(),
            _ => self.config.command_timeout(),
        }
    }

    /// Connect and interrogate the device without transferring anything,
    /// leaving the link up for a later [`begin_upgrade`](Self::begin_upgrade).
    pub fn begin_prepare(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state != OtaState::Idle {
            log::warn!("prepare requested in state {}", self.state);
            return out;
        }
        self.prepare_only = true;
        self.enter(OtaState::Connect, &mut out);
        out
    }

    /// Start an upgrade. On a fresh session this connects from scratch; on
    /// a prepared session it picks up the existing link.
    pub fn begin_upgrade(
        &mut self,
        firmware: Vec<u8>,
        dfu: DfuContext,
    ) -> Result<Vec<Action>, OtaError> {
        let needs_image =
            dfu.dfu_type == DfuType::AppOtaToDevice && dfu.command == DfuCommand::None;
        if needs_image && firmware.is_empty() {
            return Err(OtaError::new(
                self.state,
                ErrorCode::InvalidFirmware,
                "firmware image is empty",
            ));
        }

        let mut out = Vec::new();
        match self.state {
            OtaState::Idle => {
                self.firmware = firmware;
                self.dfu = dfu;
                self.enter(OtaState::Connect, &mut out);
            }
            OtaState::Complete if self.is_prepared() => {
                self.prepare_only = false;
                self.pending_error = None;
                self.firmware = firmware;
                self.dfu = dfu;
                self.offset = 0;
                if self.dfu.dfu_type == DfuType::AppOtaToDevice {
                    self.enter(OtaState::EnableNotification, &mut out);
                } else {
                    self.enter(OtaState::DfuStart, &mut out);
                }
            }
            _ => {
                return Err(OtaError::new(
                    self.state,
                    ErrorCode::Failed,
                    "session was already used",
                ));
            }
        }
        Ok(out)
    }

    /// Cancel the upgrade. The session unwinds through `Abort` using the
    /// normal event flow; callers keep feeding events until completion.
    pub fn request_stop(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        if matches!(
            self.state,
            OtaState::Idle | OtaState::Abort | OtaState::Complete
        ) {
            return out;
        }
        self.fail(ErrorCode::Aborted, "stopped by the caller", &mut out);
        self.enter(OtaState::Abort, &mut out);
        out
    }

    /// Feed one event in, get the next side effects out.
    pub fn advance(&mut self, event: OtaEvent) -> Vec<Action> {
        let mut out = Vec::new();
        if matches!(self.state, OtaState::Idle | OtaState::Complete) {
            log::debug!("ignoring {event:?} in state {}", self.state);
            return out;
        }
        match event {
            OtaEvent::ConnectionChanged { connected, error } => {
                self.on_connection_changed(connected, error, &mut out)
            }
            OtaEvent::ServiceDiscovered { gatt, error } => {
                self.on_service_discovered(gatt, error, &mut out)
            }
            OtaEvent::NotificationChanged { enabled, error } => {
                self.on_notification_changed(enabled, error, &mut out)
            }
            OtaEvent::ValueUpdated {
                target,
                value,
                error,
            } => self.on_value_updated(target, value, error, &mut out),
            OtaEvent::WriteCompleted { error } => self.on_write_completed(error, &mut out),
            OtaEvent::ComponentInfo { info } => self.on_component_info(info, &mut out),
            OtaEvent::MeshResult { op, error } => self.on_mesh_result(op, error, &mut out),
            OtaEvent::TimerFired => self.on_timer_fired(&mut out),
        }
        out
    }

    fn on_connection_changed(
        &mut self,
        connected: bool,
        error: Option<String>,
        out: &mut Vec<Action>,
    ) {
        // some firmware reboots into the new image instead of answering
        // the verify command; treat the drop as the missing success
        if self.state == OtaState::Verify
            && self.timer_armed
            && !connected
            && error.is_none()
            && self.profile.quirks.verify_by_disconnect
        {
            log::info!("device disconnected while verify pending, assuming success");
            self.timer_armed = false;
            self.connected = false;
            self.push_ok(out);
            self.enter(OtaState::Apply, out);
            return;
        }

        self.timer_armed = false;
        if connected && error.is_none() {
            self.connected = true;
            self.push_ok(out);
            if self.prepare_only || self.dfu.dfu_type == DfuType::AppOtaToDevice {
                self.enter(OtaState::ServiceDiscover, out);
            } else {
                self.enter(OtaState::DfuStart, out);
            }
            return;
        }

        self.connected = false;
        if self.pending_error.is_none() {
            let (code, what) = if self.state <= OtaState::Connect {
                (ErrorCode::DeviceConnect, "failed to connect to the device")
            } else {
                (ErrorCode::DeviceDisconnect, "device disconnected")
            };
            let description = match error {
                Some(e) => format!("{what}: {e}"),
                None => what.to_string(),
            };
            self.fail(code, description, out);
        }
        if self.state > OtaState::EnableNotification && self.state != OtaState::Abort {
            self.enter(OtaState::Abort, out);
        } else {
            self.enter(OtaState::Complete, out);
        }
    }

    fn on_service_discovered(
        &mut self,
        gatt: Option<OtaGatt>,
        error: Option<String>,
        out: &mut Vec<Action>,
    ) {
        if self.state != OtaState::ServiceDiscover {
            log::debug!("discovery result ignored in state {}", self.state);
            return;
        }
        self.timer_armed = false;
        match (gatt, error) {
            (Some(gatt), None) => {
                self.gatt = Some(gatt);
                self.push_ok(out);
                self.enter(OtaState::ReadAppInfo, out);
            }
            (None, None) => {
                self.fail(
                    ErrorCode::OtaNotSupported,
                    "device has no OTA upgrade service",
                    out,
                );
                self.enter(OtaState::Complete, out);
            }
            (_, Some(e)) => {
                self.fail(
                    ErrorCode::DiscoverService,
                    format!("service discovery failed: {e}"),
                    out,
                );
                self.enter(OtaState::Complete, out);
            }
        }
    }

    fn on_notification_changed(
        &mut self,
        enabled: bool,
        error: Option<String>,
        out: &mut Vec<Action>,
    ) {
        if self.state != OtaState::EnableNotification {
            return;
        }
        self.timer_armed = false;
        if let Some(e) = error {
            self.fail(
                ErrorCode::NotificationUpdate,
                format!("failed to enable notifications: {e}"),
                out,
            );
            self.enter(OtaState::Complete, out);
            return;
        }
        if !enabled {
            self.fail(
                ErrorCode::NotificationUpdate,
                "control point notifications were not enabled",
                out,
            );
            self.enter(OtaState::Complete, out);
            return;
        }
        self.push_ok(out);
        if self.dfu.command == DfuCommand::Apply {
            self.enter(OtaState::Apply, out);
        } else {
            self.enter(OtaState::PrepareDownload, out);
        }
    }

    fn on_value_updated(
        &mut self,
        target: OtaTarget,
        value: Option<Vec<u8>>,
        error: Option<String>,
        out: &mut Vec<Action>,
    ) {
        match target {
            OtaTarget::AppInfo => self.on_app_info(value, error, out),
            OtaTarget::ControlPoint => self.on_command_response(value, error, out),
            OtaTarget::Data => log::debug!("unexpected value on the data characteristic"),
        }
    }

    fn on_app_info(
        &mut self,
        value: Option<Vec<u8>>,
        error: Option<String>,
        out: &mut Vec<Action>,
    ) {
        if self.state != OtaState::ReadAppInfo {
            return;
        }
        self.timer_armed = false;
        if let Some(e) = error {
            // app info is informational only, carry on without it
            log::warn!("app info read failed: {e}");
        }
        match value {
            Some(data) => {
                match AppInfo::parse(&data) {
                    Some(info) => self.push_info(info.to_string(), out),
                    None => log::warn!("unrecognized app info payload, {} bytes", data.len()),
                }
                self.finish_read_app_info(out);
            }
            None => {
                if self.profile.kind == DeviceKind::Mesh && !self.component_query_issued {
                    self.component_query_issued = true;
                    self.arm(Action::QueryComponentInfo, out);
                } else {
                    self.finish_read_app_info(out);
                }
            }
        }
    }

    fn on_component_info(&mut self, info: Option<String>, out: &mut Vec<Action>) {
        if self.state != OtaState::ReadAppInfo {
            return;
        }
        self.timer_armed = false;
        if let Some(info) = info {
            self.push_info(info, out);
        }
        self.finish_read_app_info(out);
    }

    fn finish_read_app_info(&mut self, out: &mut Vec<Action>) {
        self.prepare_ready = true;
        if self.prepare_only {
            self.enter(OtaState::Complete, out);
        } else {
            self.enter(OtaState::EnableNotification, out);
        }
    }

    fn on_command_response(
        &mut self,
        value: Option<Vec<u8>>,
        error: Option<String>,
        out: &mut Vec<Action>,
    ) {
        self.timer_armed = false;
        let status = OtaStatus::parse(value.as_deref().unwrap_or(&[]));
        match self.state {
            OtaState::PrepareDownload => {
                if let Some(e) = error {
                    self.fail(ErrorCode::Failed, format!("prepare for download failed: {e}"), out);
                    self.enter(OtaState::Complete, out);
                } else if status.is_success() {
                    self.push_ok(out);
                    self.enter(OtaState::StartDownload, out);
                } else {
                    // the device refused before anything was written, so
                    // there is nothing to abort
                    self.fail(
                        ErrorCode::InvalidResponse,
                        format!("prepare for download refused: {}", status.description()),
                        out,
                    );
                    self.enter(OtaState::Complete, out);
                }
            }
            OtaState::StartDownload => {
                if let Some(e) = error {
                    self.fail(ErrorCode::Failed, format!("start download failed: {e}"), out);
                    self.enter(OtaState::Abort, out);
                } else if status.is_success() {
                    self.push_ok(out);
                    self.enter(OtaState::DataTransfer, out);
                } else {
                    self.fail(
                        ErrorCode::InvalidResponse,
                        format!("start download refused: {}", status.description()),
                        out,
                    );
                    self.enter(OtaState::Abort, out);
                }
            }
            OtaState::Verify => {
                if let Some(e) = error {
                    self.fail(ErrorCode::Failed, format!("verify failed: {e}"), out);
                    self.enter(OtaState::Abort, out);
                } else if status.is_success() {
                    self.push_ok(out);
                    self.enter(OtaState::Apply, out);
                } else {
                    self.fail(
                        ErrorCode::VerificationFailed,
                        format!("device rejected the image: {}", status.description()),
                        out,
                    );
                    self.enter(OtaState::Abort, out);
                }
            }
            OtaState::Apply => {
                if let Some(e) = error {
                    self.fail(ErrorCode::Failed, format!("apply failed: {e}"), out);
                    self.enter(OtaState::Abort, out);
                } else if status.is_success() {
                    self.push_ok(out);
                    self.enter(OtaState::DfuStart, out);
                } else {
                    self.fail(
                        ErrorCode::ApplyFailed,
                        format!("apply refused: {}", status.description()),
                        out,
                    );
                    self.enter(OtaState::Abort, out);
                }
            }
            OtaState::Abort => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(OtaError::new(
                        self.state,
                        ErrorCode::Aborted,
                        "upgrade aborted",
                    ));
                }
                self.enter(OtaState::Complete, out);
            }
            _ => log::debug!("command response ignored in state {}", self.state),
        }
    }

    fn on_write_completed(&mut self, error: Option<String>, out: &mut Vec<Action>) {
        if self.state == OtaState::DataTransfer {
            self.timer_armed = false;
            if let Some(e) = error {
                self.fail(
                    ErrorCode::CharacteristicWrite,
                    format!("failed to write firmware data: {e}"),
                    out,
                );
                self.enter(OtaState::Abort, out);
                return;
            }
            self.offset += self.transferring;
            self.transferring = 0;
            self.push_ok(out);
            if self.offset >= self.firmware.len() {
                self.enter(OtaState::Verify, out);
            } else {
                self.send_next_chunk(out);
            }
            return;
        }

        // command writes only surface here on failure; success is reported
        // through the response notification
        let Some(e) = error else { return };
        self.timer_armed = false;
        self.fail(
            ErrorCode::CharacteristicWrite,
            format!("failed to write command: {e}"),
            out,
        );
        match self.state {
            OtaState::PrepareDownload | OtaState::Abort => self.enter(OtaState::Complete, out),
            _ => self.enter(OtaState::Abort, out),
        }
    }

    fn on_mesh_result(&mut self, op: MeshOp, error: Option<String>, out: &mut Vec<Action>) {
        match op {
            MeshOp::DfuStop => {
                // fire and forget during abort
                if let Some(e) = error {
                    log::warn!("distribution stop failed: {e}");
                }
            }
            MeshOp::DfuStart => {
                if self.state != OtaState::DfuStart {
                    return;
                }
                self.timer_armed = false;
                match error {
                    Some(e) => {
                        self.fail(
                            ErrorCode::Failed,
                            format!("failed to start distribution: {e}"),
                            out,
                        );
                    }
                    None => {
                        self.distribution_started = true;
                        self.push_ok(out);
                    }
                }
                self.enter(OtaState::Complete, out);
            }
            MeshOp::DfuGetStatus => {
                if self.state != OtaState::DfuStart {
                    return;
                }
                self.timer_armed = false;
                match error {
                    Some(e) => {
                        self.fail(
                            ErrorCode::Failed,
                            format!("failed to query distribution status: {e}"),
                            out,
                        );
                    }
                    None => self.push_ok(out),
                }
                self.enter(OtaState::Complete, out);
            }
        }
    }

    fn on_timer_fired(&mut self, out: &mut Vec<Action>) {
        if !self.timer_armed {
            return;
        }
        self.timer_armed = false;

        // devices without app info simply never answer; proceed without it
        if self.state == OtaState::ReadAppInfo {
            self.finish_read_app_info(out);
            return;
        }

        self.fail(
            ErrorCode::Timeout,
            format!("timed out waiting for {}", self.state),
            out,
        );
        match self.state {
            // nothing was written yet (or we are already unwinding), so
            // there is nothing left to abort on the device
            OtaState::Connect | OtaState::ServiceDiscover | OtaState::Abort => {
                self.enter(OtaState::Complete, out)
            }
            _ => self.enter(OtaState::Abort, out),
        }
    }

    fn enter(&mut self, state: OtaState, out: &mut Vec<Action>) {
        self.state = state;
        self.timer_armed = false;
        match state {
            OtaState::Idle => {}
            OtaState::Connect => {
                self.push_ok(out);
                self.arm(Action::Connect, out);
            }
            OtaState::ServiceDiscover => {
                self.push_ok(out);
                self.arm(Action::DiscoverService, out);
            }
            OtaState::ReadAppInfo => {
                self.push_ok(out);
                let has_app_info = self.gatt.map(|g| g.has_app_info).unwrap_or(false);
                if has_app_info {
                    self.arm(Action::ReadAppInfo, out);
                } else if self.profile.kind == DeviceKind::Mesh {
                    self.component_query_issued = true;
                    self.arm(Action::QueryComponentInfo, out);
                } else {
                    self.finish_read_app_info(out);
                }
            }
            OtaState::EnableNotification => {
                self.push_ok(out);
                self.arm(Action::SetNotifyEnabled(true), out);
            }
            OtaState::PrepareDownload => {
                self.push_ok(out);
                let command = match (&self.gatt, &self.dfu.metadata) {
                    (Some(gatt), Some(meta)) if gatt.version == OtaVersion::V2 => {
                        OtaCommand::PrepareDownloadV2 {
                            company_id: meta.company_id,
                            firmware_id: meta.firmware_id,
                        }
                    }
                    _ => OtaCommand::PrepareDownload,
                };
                self.arm(Action::WriteCommand(command.to_bytes()), out);
            }
            OtaState::StartDownload => {
                self.push_ok(out);
                let command = OtaCommand::StartDownload {
                    image_size: self.firmware.len() as u32,
                };
                self.arm(Action::WriteCommand(command.to_bytes()), out);
            }
            OtaState::DataTransfer => {
                self.push_ok(out);
                self.crc = Some(ImageCrc::new());
                self.image_crc = None;
                self.send_next_chunk(out);
            }
            OtaState::Verify => {
                self.push_ok(out);
                let command = OtaCommand::Verify {
                    crc32: self.image_crc.unwrap_or(0),
                };
                self.arm(Action::WriteCommand(command.to_bytes()), out);
            }
            OtaState::Apply => {
                if !self.connected || self.version() != OtaVersion::V2 {
                    // V1 devices apply on verify; nothing more to send
                    self.enter(OtaState::Complete, out);
                } else if self.dfu.dfu_type == DfuType::AppOtaToDevice
                    || self.dfu.command == DfuCommand::Apply
                {
                    self.push_ok(out);
                    self.arm(Action::WriteCommand(OtaCommand::Apply.to_bytes()), out);
                } else {
                    // distribution uploads hand over to the distributor
                    self.enter(OtaState::DfuStart, out);
                }
            }
            OtaState::DfuStart => {
                if self.dfu.command == DfuCommand::GetStatus {
                    self.push_ok(out);
                    self.arm(
                        Action::DfuGetStatus {
                            component: self.profile.name.clone(),
                        },
                        out,
                    );
                } else if self.dfu.dfu_type == DfuType::AppOtaToDevice
                    || self.dfu.command != DfuCommand::Start
                {
                    self.enter(OtaState::Complete, out);
                } else {
                    match self.dfu.metadata.clone() {
                        Some(meta) => {
                            self.push_ok(out);
                            self.arm(
                                Action::DfuStart {
                                    dfu_type: self.dfu.dfu_type,
                                    component: self.profile.name.clone(),
                                    firmware_id: meta.firmware_id,
                                    validation_data: meta.validation_data,
                                },
                                out,
                            );
                        }
                        None => {
                            self.fail(
                                ErrorCode::InvalidParameters,
                                "distribution requires firmware metadata",
                                out,
                            );
                            self.enter(OtaState::Complete, out);
                        }
                    }
                }
            }
            OtaState::Abort => {
                if self.dfu.dfu_type.is_distribution() {
                    out.push(Action::DfuStop);
                }
                if self.connected {
                    let command = OtaCommand::Abort {
                        image_size: self.firmware.len() as u32,
                    };
                    self.arm(Action::WriteCommand(command.to_bytes()), out);
                } else {
                    self.enter(OtaState::Complete, out);
                }
            }
            OtaState::Complete => {
                let error = self.pending_error.clone();
                out.push(Action::Notify(match &error {
                    Some(e) => OtaProgress::failed(
                        OtaState::Complete,
                        e,
                        self.firmware.len(),
                        self.offset,
                    ),
                    None => OtaProgress::ok(OtaState::Complete, self.firmware.len(), self.offset),
                }));
                if !self.prepare_only {
                    self.connected = false;
                    self.gatt = None;
                    self.token = None;
                }
                out.push(Action::Complete { error });
            }
        }
    }

    fn send_next_chunk(&mut self, out: &mut Vec<Action>) {
        let remaining = self.firmware.len() - self.offset;
        if remaining == 0 {
            self.enter(OtaState::Verify, out);
            return;
        }
        let n = remaining.min(self.chunk_size);
        let chunk = self.firmware[self.offset..self.offset + n].to_vec();
        if let Some(crc) = self.crc.as_mut() {
            crc.update(&chunk);
        }
        if self.offset + n >= self.firmware.len() {
            if let Some(crc) = self.crc.take() {
                self.image_crc = Some(crc.finalize());
            }
        }
        self.transferring = n;
        self.arm(Action::WriteData(chunk), out);
    }

    fn version(&self) -> OtaVersion {
        self.gatt.map(|g| g.version).unwrap_or_default()
    }

    fn arm(&mut self, action: Action, out: &mut Vec<Action>) {
        self.timer_armed = true;
        out.push(action);
    }

    fn push_ok(&mut self, out: &mut Vec<Action>) {
        out.push(Action::Notify(OtaProgress::ok(
            self.state,
            self.firmware.len(),
            self.offset,
        )));
    }

    fn push_info(&mut self, description: String, out: &mut Vec<Action>) {
        out.push(Action::Notify(OtaProgress {
            state: self.state,
            sub_state: self.state,
            error_code: 0,
            description,
            firmware_size: self.firmware.len(),
            transferred_size: self.offset,
        }));
    }

    fn fail(&mut self, code: ErrorCode, description: impl Into<String>, out: &mut Vec<Action>) {
        let error = OtaError::new(self.state, code, description);
        log::warn!("{error}");
        out.push(Action::Notify(OtaProgress::failed(
            self.state,
            &error,
            self.firmware.len(),
            self.offset,
        )));
        // the first failure is the one that matters; later ones (an abort
        // that also times out, say) are only notified
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceQuirks;
    use crate::dfu::DfuMetadata;
    use crate::lock::UpgradeLock;
    use wisp_proto::crc32;

    fn profile(kind: DeviceKind, mtu: usize) -> DeviceProfile {
        DeviceProfile {
            kind,
            name: "lamp".to_string(),
            id: "11:22:33:44:55:66".to_string(),
            mtu,
            quirks: DeviceQuirks::default(),
        }
    }

    fn session_with(profile: DeviceProfile) -> (OtaSession, UpgradeLock) {
        let lock = UpgradeLock::new();
        let token = lock.acquire().unwrap();
        (OtaSession::new(token, profile, OtaConfig::default()), lock)
    }

    fn ble_session(mtu: usize) -> (OtaSession, UpgradeLock) {
        session_with(profile(DeviceKind::Ble, mtu))
    }

    fn gatt(version: OtaVersion, has_app_info: bool) -> OtaGatt {
        OtaGatt {
            version,
            has_app_info,
        }
    }

    fn ok_response() -> OtaEvent {
        OtaEvent::ValueUpdated {
            target: OtaTarget::ControlPoint,
            value: Some(vec![0]),
            error: None,
        }
    }

    fn status_response(status: u8) -> OtaEvent {
        OtaEvent::ValueUpdated {
            target: OtaTarget::ControlPoint,
            value: Some(vec![status]),
            error: None,
        }
    }

    fn connected() -> OtaEvent {
        OtaEvent::ConnectionChanged {
            connected: true,
            error: None,
        }
    }

    fn disconnected() -> OtaEvent {
        OtaEvent::ConnectionChanged {
            connected: false,
            error: None,
        }
    }

    fn discovered(g: OtaGatt) -> OtaEvent {
        OtaEvent::ServiceDiscovered {
            gatt: Some(g),
            error: None,
        }
    }

    fn notifying() -> OtaEvent {
        OtaEvent::NotificationChanged {
            enabled: true,
            error: None,
        }
    }

    fn chunk_acked() -> OtaEvent {
        OtaEvent::WriteCompleted { error: None }
    }

    fn data_writes(actions: &[Action]) -> Vec<usize> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::WriteData(chunk) => Some(chunk.len()),
                _ => None,
            })
            .collect()
    }

    fn commands(actions: &[Action]) -> Vec<Vec<u8>> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::WriteCommand(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    fn completion(actions: &[Action]) -> Option<Option<OtaError>> {
        actions.iter().find_map(|a| match a {
            Action::Complete { error } => Some(error.clone()),
            _ => None,
        })
    }

    /// Drive a direct V1 upgrade up to the point where data transfer is
    /// about to begin, returning the actions of the start-download ack.
    fn drive_to_transfer(session: &mut OtaSession, firmware: Vec<u8>) -> Vec<Action> {
        session
            .begin_upgrade(firmware, DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V1, false)));
        session.advance(notifying());
        session.advance(ok_response()); // prepare for download
        session.advance(ok_response()) // start download -> first chunk
    }

    #[test]
    fn direct_v1_upgrade_walks_all_phases() {
        // mtu 43 gives 40 byte chunks: 100 bytes go out as 40/40/20
        let (mut session, lock) = ble_session(43);
        let firmware: Vec<u8> = (0..100u8).collect();
        let expected_crc = crc32(&firmware);

        let actions = session
            .begin_upgrade(firmware.clone(), DfuContext::direct())
            .unwrap();
        assert_eq!(actions.last(), Some(&Action::Connect));
        assert_eq!(session.state(), OtaState::Connect);

        let actions = session.advance(connected());
        assert_eq!(actions.last(), Some(&Action::DiscoverService));

        let actions = session.advance(discovered(gatt(OtaVersion::V1, false)));
        // no app info characteristic on a plain BLE device: straight to
        // enabling notifications
        assert_eq!(session.state(), OtaState::EnableNotification);
        assert_eq!(actions.last(), Some(&Action::SetNotifyEnabled(true)));

        let actions = session.advance(notifying());
        assert_eq!(commands(&actions), vec![vec![0x01]]);

        let actions = session.advance(ok_response());
        assert_eq!(commands(&actions), vec![vec![0x02, 100, 0, 0, 0]]);

        let actions = session.advance(ok_response());
        assert_eq!(data_writes(&actions), vec![40]);

        let actions = session.advance(chunk_acked());
        assert_eq!(data_writes(&actions), vec![40]);

        let actions = session.advance(chunk_acked());
        assert_eq!(data_writes(&actions), vec![20]);

        let actions = session.advance(chunk_acked());
        assert_eq!(session.state(), OtaState::Verify);
        let mut verify = vec![0x03];
        verify.extend_from_slice(&expected_crc.to_le_bytes());
        assert_eq!(commands(&actions), vec![verify]);

        let actions = session.advance(ok_response());
        // V1 applies on verify, so the session is done
        assert_eq!(session.state(), OtaState::Complete);
        assert_eq!(completion(&actions), Some(None));
        assert!(!lock.is_active(), "token must be released on completion");
    }

    #[test]
    fn progress_counts_transferred_bytes() {
        let (mut session, _lock) = ble_session(43);
        drive_to_transfer(&mut session, (0..100u8).collect());

        let mut seen = Vec::new();
        for _ in 0..3 {
            for action in session.advance(chunk_acked()) {
                if let Action::Notify(p) = action {
                    if p.state == OtaState::DataTransfer && !p.is_error() {
                        seen.push((p.transferred_size, p.firmware_size));
                    }
                }
            }
        }
        assert_eq!(seen, vec![(40, 100), (80, 100), (100, 100)]);
    }

    #[test]
    fn empty_firmware_is_rejected() {
        let (mut session, _lock) = ble_session(185);
        let err = session
            .begin_upgrade(Vec::new(), DfuContext::direct())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFirmware);
        assert_eq!(session.state(), OtaState::Idle);
    }

    #[test]
    fn prepare_then_upgrade_skips_connect() {
        let (mut session, lock) = ble_session(185);
        let actions = session.begin_prepare();
        assert_eq!(actions.last(), Some(&Action::Connect));

        session.advance(connected());
        let actions = session.advance(discovered(gatt(OtaVersion::V1, true)));
        assert_eq!(actions.last(), Some(&Action::ReadAppInfo));

        // 4 byte app info: version 1.2, active id 0x0305
        let actions = session.advance(OtaEvent::ValueUpdated {
            target: OtaTarget::AppInfo,
            value: Some(vec![0x05, 0x03, 1, 2]),
            error: None,
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Notify(p) if p.description.contains("1.2")
        )));
        assert_eq!(completion(&actions), Some(None));
        assert!(session.is_prepared());
        assert!(lock.is_active(), "prepared session keeps the device claimed");

        let actions = session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        assert_eq!(session.state(), OtaState::EnableNotification);
        assert_eq!(actions.last(), Some(&Action::SetNotifyEnabled(true)));
        assert!(!actions.contains(&Action::Connect));
    }

    #[test]
    fn missing_upgrade_service_completes_without_abort() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        let actions = session.advance(OtaEvent::ServiceDiscovered {
            gatt: None,
            error: None,
        });
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::OtaNotSupported);
        assert!(commands(&actions).is_empty());
    }

    #[test]
    fn prepare_download_refusal_completes_without_abort() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V1, false)));
        session.advance(notifying());

        // status 2 = illegal state
        let actions = session.advance(status_response(2));
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidResponse);
        assert_eq!(error.state, OtaState::PrepareDownload);
        assert!(commands(&actions).is_empty(), "no abort command expected");
    }

    #[test]
    fn start_download_refusal_aborts() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V1, false)));
        session.advance(notifying());
        session.advance(ok_response());

        let actions = session.advance(status_response(5));
        assert_eq!(session.state(), OtaState::Abort);
        // abort carries the image size
        assert_eq!(commands(&actions), vec![vec![0x07, 3, 0, 0, 0]]);

        let actions = session.advance(ok_response());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidResponse);
        assert_eq!(error.state, OtaState::StartDownload);
    }

    #[test]
    fn verify_refusal_aborts_with_verification_error() {
        let (mut session, _lock) = ble_session(43);
        let actions = drive_to_transfer(&mut session, vec![0u8; 10]);
        assert_eq!(data_writes(&actions), vec![10]);
        session.advance(chunk_acked());
        assert_eq!(session.state(), OtaState::Verify);

        session.advance(status_response(3));
        assert_eq!(session.state(), OtaState::Abort);
        let actions = session.advance(ok_response());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::VerificationFailed);
    }

    #[test]
    fn disconnect_during_transfer_aborts_and_completes() {
        let (mut session, lock) = ble_session(185);
        drive_to_transfer(&mut session, vec![0u8; 500]);
        assert_eq!(session.state(), OtaState::DataTransfer);

        let actions = session.advance(disconnected());
        // link is gone, so the abort command cannot be written
        assert!(commands(&actions).is_empty());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::DeviceDisconnect);
        assert_eq!(error.state, OtaState::DataTransfer);
        assert!(!lock.is_active());
    }

    #[test]
    fn disconnect_during_discovery_completes_directly() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        assert_eq!(session.state(), OtaState::ServiceDiscover);

        let actions = session.advance(disconnected());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::DeviceDisconnect);
        assert_eq!(session.state(), OtaState::Complete);
    }

    #[test]
    fn connect_failure_reports_connect_error() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        let actions = session.advance(OtaEvent::ConnectionChanged {
            connected: false,
            error: Some("le connection failed".to_string()),
        });
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::DeviceConnect);
        assert!(error.description.contains("le connection failed"));
    }

    #[test]
    fn timeout_while_connecting_completes() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        assert_eq!(session.phase_timeout(), std::time::Duration::from_secs(40));

        let actions = session.advance(OtaEvent::TimerFired);
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::Timeout);
        assert!(commands(&actions).is_empty());
    }

    #[test]
    fn timeout_during_verify_aborts_then_completes() {
        let (mut session, _lock) = ble_session(43);
        drive_to_transfer(&mut session, vec![0u8; 10]);
        session.advance(chunk_acked());
        assert_eq!(session.state(), OtaState::Verify);
        assert_eq!(session.phase_timeout(), std::time::Duration::from_secs(30));

        let actions = session.advance(OtaEvent::TimerFired);
        assert_eq!(session.state(), OtaState::Abort);
        assert_eq!(commands(&actions).len(), 1);

        // even the abort can time out; the session still finishes
        let actions = session.advance(OtaEvent::TimerFired);
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::Timeout);
        assert_eq!(error.state, OtaState::Verify);
    }

    #[test]
    fn app_info_timeout_is_not_fatal() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V2, true)));
        assert_eq!(session.state(), OtaState::ReadAppInfo);

        let actions = session.advance(OtaEvent::TimerFired);
        assert_eq!(session.state(), OtaState::EnableNotification);
        assert_eq!(actions.last(), Some(&Action::SetNotifyEnabled(true)));
    }

    #[test]
    fn verify_by_disconnect_quirk_counts_as_success() {
        let mut p = profile(DeviceKind::Ble, 43);
        p.quirks = DeviceQuirks {
            verify_by_disconnect: true,
        };
        let (mut session, _lock) = session_with(p);
        drive_to_transfer(&mut session, vec![0u8; 10]);
        session.advance(chunk_acked());
        assert_eq!(session.state(), OtaState::Verify);

        let actions = session.advance(disconnected());
        assert_eq!(completion(&actions), Some(None));
    }

    #[test]
    fn without_the_quirk_a_verify_disconnect_is_fatal() {
        let (mut session, _lock) = ble_session(43);
        drive_to_transfer(&mut session, vec![0u8; 10]);
        session.advance(chunk_acked());

        let actions = session.advance(disconnected());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::DeviceDisconnect);
    }

    #[test]
    fn stop_request_aborts_cleanly() {
        let (mut session, _lock) = ble_session(185);
        drive_to_transfer(&mut session, vec![0u8; 500]);

        let actions = session.request_stop();
        assert_eq!(session.state(), OtaState::Abort);
        assert_eq!(commands(&actions).len(), 1);

        let actions = session.advance(ok_response());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::Aborted);
    }

    #[test]
    fn stop_when_already_complete_is_a_no_op() {
        let (mut session, _lock) = ble_session(185);
        assert!(session.request_stop().is_empty());
    }

    #[test]
    fn v2_direct_upgrade_sends_apply() {
        let (mut session, _lock) = ble_session(43);
        session
            .begin_upgrade(vec![0u8; 10], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V2, false)));
        session.advance(notifying());
        session.advance(ok_response());
        session.advance(ok_response());
        session.advance(chunk_acked());
        assert_eq!(session.state(), OtaState::Verify);

        let actions = session.advance(ok_response());
        assert_eq!(session.state(), OtaState::Apply);
        assert_eq!(commands(&actions), vec![vec![0x08]]);

        let actions = session.advance(ok_response());
        assert_eq!(completion(&actions), Some(None));
    }

    fn metadata() -> DfuMetadata {
        DfuMetadata::parse("Firmware ID = 0x01313101311001000234\nValidation Data = 0xcafe")
            .unwrap()
    }

    #[test]
    fn v2_prepare_carries_company_and_firmware_id() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(
                vec![0u8; 10],
                DfuContext {
                    dfu_type: DfuType::AppOtaToDevice,
                    command: DfuCommand::None,
                    metadata: Some(metadata()),
                },
            )
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V2, false)));
        let actions = session.advance(notifying());
        let cmds = commands(&actions);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0][0], 0x01);
        // company id is big endian on the wire
        assert_eq!(&cmds[0][1..3], &[0x01, 0x31]);
        assert_eq!(cmds[0].len(), 1 + 2 + 8);
    }

    #[test]
    fn distribution_start_goes_straight_to_dfu() {
        let (mut session, _lock) = session_with(profile(DeviceKind::Mesh, 185));
        session
            .begin_upgrade(
                Vec::new(),
                DfuContext::distribution(DfuType::AppToAll, metadata()),
            )
            .unwrap();

        let actions = session.advance(connected());
        assert_eq!(session.state(), OtaState::DfuStart);
        let start = actions
            .iter()
            .find_map(|a| match a {
                Action::DfuStart {
                    dfu_type,
                    component,
                    firmware_id,
                    validation_data,
                } => Some((*dfu_type, component.clone(), *firmware_id, validation_data.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(start.0, DfuType::AppToAll);
        assert_eq!(start.1, "lamp");
        assert_eq!(start.2, metadata().firmware_id);
        assert_eq!(start.3, vec![0xca, 0xfe]);

        let actions = session.advance(OtaEvent::MeshResult {
            op: MeshOp::DfuStart,
            error: None,
        });
        assert_eq!(completion(&actions), Some(None));
        assert!(session.distribution_started());
    }

    #[test]
    fn distribution_start_without_metadata_fails_fast() {
        let (mut session, _lock) = session_with(profile(DeviceKind::Mesh, 185));
        session
            .begin_upgrade(
                Vec::new(),
                DfuContext {
                    dfu_type: DfuType::ProxyToAll,
                    command: DfuCommand::Start,
                    metadata: None,
                },
            )
            .unwrap();
        let actions = session.advance(connected());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::InvalidParameters);
    }

    #[test]
    fn distribution_status_query_round_trip() {
        let (mut session, _lock) = session_with(profile(DeviceKind::Mesh, 185));
        session
            .begin_upgrade(
                Vec::new(),
                DfuContext {
                    dfu_type: DfuType::AppToAll,
                    command: DfuCommand::GetStatus,
                    metadata: None,
                },
            )
            .unwrap();
        let actions = session.advance(connected());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::DfuGetStatus { component } if component == "lamp")));

        let actions = session.advance(OtaEvent::MeshResult {
            op: MeshOp::DfuGetStatus,
            error: None,
        });
        assert_eq!(completion(&actions), Some(None));
    }

    #[test]
    fn abort_during_distribution_stops_the_distributor() {
        let (mut session, _lock) = session_with(profile(DeviceKind::Mesh, 185));
        session
            .begin_upgrade(
                Vec::new(),
                DfuContext::distribution(DfuType::AppToAll, metadata()),
            )
            .unwrap();
        session.advance(connected());
        assert_eq!(session.state(), OtaState::DfuStart);

        let actions = session.advance(OtaEvent::TimerFired);
        assert!(actions.contains(&Action::DfuStop));
        let actions = session.advance(ok_response());
        let error = completion(&actions).flatten().unwrap();
        assert_eq!(error.code, ErrorCode::Timeout);
    }

    #[test]
    fn mesh_component_info_feeds_progress() {
        let (mut session, _lock) = session_with(profile(DeviceKind::Mesh, 185));
        session
            .begin_upgrade(vec![0u8; 400], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        let actions = session.advance(discovered(gatt(OtaVersion::V2, false)));
        // mesh components report firmware info through the network, not a
        // GATT characteristic
        assert_eq!(actions.last(), Some(&Action::QueryComponentInfo));

        let actions = session.advance(OtaEvent::ComponentInfo {
            info: Some("lamp fw 2.4".to_string()),
        });
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Notify(p) if p.description == "lamp fw 2.4"
        )));
        assert_eq!(session.state(), OtaState::EnableNotification);
    }

    #[test]
    fn mesh_chunks_leave_room_for_encryption_overhead() {
        let (mut session, _lock) = session_with(profile(DeviceKind::Mesh, 185));
        session
            .begin_upgrade(vec![0u8; 400], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V2, false)));
        session.advance(OtaEvent::ComponentInfo { info: None });
        session.advance(notifying());
        session.advance(ok_response());
        let actions = session.advance(ok_response());
        // 185 - 3 - 17
        assert_eq!(data_writes(&actions), vec![165]);
    }

    #[test]
    fn configured_mtu_caps_the_negotiated_one() {
        let lock = UpgradeLock::new();
        let token = lock.acquire().unwrap();
        let config = OtaConfig {
            mtu: 43,
            ..OtaConfig::default()
        };
        let mut session = OtaSession::new(token, profile(DeviceKind::Ble, 185), config);
        let actions = drive_to_transfer(&mut session, vec![0u8; 100]);
        assert_eq!(data_writes(&actions), vec![40]);
    }

    #[test]
    fn events_after_completion_are_ignored() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(disconnected());
        assert_eq!(session.state(), OtaState::Complete);
        assert!(session.advance(ok_response()).is_empty());
        assert!(session.advance(connected()).is_empty());
    }

    #[test]
    fn command_write_ack_is_not_a_response() {
        let (mut session, _lock) = ble_session(185);
        session
            .begin_upgrade(vec![1, 2, 3], DfuContext::direct())
            .unwrap();
        session.advance(connected());
        session.advance(discovered(gatt(OtaVersion::V1, false)));
        session.advance(notifying());
        assert_eq!(session.state(), OtaState::PrepareDownload);

        // success comes through the notification, not the write ack
        assert!(session.advance(chunk_acked()).is_empty());
        assert_eq!(session.state(), OtaState::PrepareDownload);
    }
}
