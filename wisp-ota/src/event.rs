use serde::{Deserialize, Serialize};

use crate::device::OtaTarget;
use crate::dfu::DfuType;
use crate::error::OtaError;
use crate::session::OtaState;

/// Everything that can happen to a running session. The driver translates
/// transport callbacks, command completions and elapsed timers into these
/// and feeds them to [`OtaSession::advance`](crate::session::OtaSession::advance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    /// The link to the device came up or went down.
    ConnectionChanged {
        connected: bool,
        error: Option<String>,
    },
    /// GATT discovery finished. `gatt` is `None` when no upgrade service
    /// was found on the device.
    ServiceDiscovered {
        gatt: Option<crate::device::OtaGatt>,
        error: Option<String>,
    },
    /// The control point notification subscription changed.
    NotificationChanged {
        enabled: bool,
        error: Option<String>,
    },
    /// A characteristic produced a value: a control point notification,
    /// or the result of an app info read (`value: None` for an empty read).
    ValueUpdated {
        target: OtaTarget,
        value: Option<Vec<u8>>,
        error: Option<String>,
    },
    /// A write finished. Only data chunk writes report success this way;
    /// command writes report success through the response notification.
    WriteCompleted { error: Option<String> },
    /// Component info lookup for a mesh device finished.
    ComponentInfo { info: Option<String> },
    /// A mesh distribution call finished.
    MeshResult {
        op: MeshOp,
        error: Option<String>,
    },
    /// The current phase ran out of time.
    TimerFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshOp {
    DfuStart,
    DfuStop,
    DfuGetStatus,
}

/// Side effects requested by the session. The driver executes them in
/// order; none of them may be reordered or run concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect,
    DiscoverService,
    SetNotifyEnabled(bool),
    /// Write an encoded command to the control point and wait for the
    /// response notification.
    WriteCommand(Vec<u8>),
    /// Write a firmware chunk to the data characteristic.
    WriteData(Vec<u8>),
    ReadAppInfo,
    QueryComponentInfo,
    DfuStart {
        dfu_type: DfuType,
        component: String,
        firmware_id: [u8; wisp_proto::FIRMWARE_ID_LEN],
        validation_data: Vec<u8>,
    },
    DfuStop,
    DfuGetStatus {
        component: String,
    },
    /// Publish a progress notification to observers.
    Notify(OtaProgress),
    /// The session is over; `error` is `None` on success.
    Complete { error: Option<OtaError> },
}

/// Progress notification published on every state transition and after
/// every transferred chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaProgress {
    pub state: OtaState,
    /// State the error was raised in; equals `state` on success updates.
    pub sub_state: OtaState,
    /// 0 on success, otherwise the stable error code.
    pub error_code: u16,
    pub description: String,
    pub firmware_size: usize,
    pub transferred_size: usize,
}

impl OtaProgress {
    pub fn ok(state: OtaState, firmware_size: usize, transferred_size: usize) -> Self {
        OtaProgress {
            state,
            sub_state: state,
            error_code: 0,
            description: String::new(),
            firmware_size,
            transferred_size,
        }
    }

    pub fn failed(state: OtaState, error: &OtaError, firmware_size: usize, transferred_size: usize) -> Self {
        OtaProgress {
            state,
            sub_state: error.state,
            error_code: error.code.code(),
            description: error.description.clone(),
            firmware_size,
            transferred_size,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn progress_serializes_with_state_names() {
        let p = OtaProgress::ok(OtaState::DataTransfer, 100, 40);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"data_transfer\""), "{json}");
        let back: OtaProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn failed_progress_keeps_the_failing_state() {
        let e = OtaError::new(OtaState::Verify, ErrorCode::VerificationFailed, "crc mismatch");
        let p = OtaProgress::failed(OtaState::Complete, &e, 100, 100);
        assert_eq!(p.state, OtaState::Complete);
        assert_eq!(p.sub_state, OtaState::Verify);
        assert_eq!(p.error_code, 54);
        assert!(p.is_error());
    }
}
