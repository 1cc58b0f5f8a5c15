use crate::session::OtaState;

/// Stable numeric error codes reported to callers and UIs.
///
/// The numeric values are part of the external contract (they end up in
/// progress notifications and logs), so they must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("another upgrade is already running")]
    Busy,
    #[error("operation failed")]
    Failed,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("invalid response from the device")]
    InvalidResponse,
    #[error("invalid firmware image")]
    InvalidFirmware,
    #[error("failed to discover the upgrade service")]
    DiscoverService,
    #[error("failed to update the notification state")]
    NotificationUpdate,
    #[error("failed to write characteristic value")]
    CharacteristicWrite,
    #[error("failed to connect to the device")]
    DeviceConnect,
    #[error("device disconnected unexpectedly")]
    DeviceDisconnect,
    #[error("device does not support OTA upgrade")]
    OtaNotSupported,
    #[error("payload encryption failed")]
    Encryption,
    #[error("payload decryption failed")]
    Decryption,
    #[error("upgrade aborted")]
    Aborted,
    #[error("firmware image verification failed")]
    VerificationFailed,
    #[error("apply command failed")]
    ApplyFailed,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Busy => 2,
            ErrorCode::Failed => 3,
            ErrorCode::Timeout => 4,
            ErrorCode::InvalidParameters => 5,
            ErrorCode::InvalidResponse => 7,
            ErrorCode::InvalidFirmware => 8,
            ErrorCode::DiscoverService => 30,
            ErrorCode::NotificationUpdate => 35,
            ErrorCode::CharacteristicWrite => 36,
            ErrorCode::DeviceConnect => 40,
            ErrorCode::DeviceDisconnect => 41,
            ErrorCode::OtaNotSupported => 42,
            ErrorCode::Encryption => 50,
            ErrorCode::Decryption => 51,
            ErrorCode::Aborted => 52,
            ErrorCode::VerificationFailed => 54,
            ErrorCode::ApplyFailed => 55,
        }
    }
}

/// An upgrade failure, carrying the state the session was in when it
/// happened and a human readable description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upgrade failed in state {state} (code {}): {description}", .code.code())]
pub struct OtaError {
    pub state: OtaState,
    pub code: ErrorCode,
    pub description: String,
}

impl OtaError {
    pub fn new(state: OtaState, code: ErrorCode, description: impl Into<String>) -> Self {
        OtaError {
            state,
            code,
            description: description.into(),
        }
    }
}
