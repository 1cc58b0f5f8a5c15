//! OTA wire protocol - control-point commands, response status codes and CRC32
//!
//! Every value exchanged with the remote device over the OTA control-point and
//! data characteristics is defined here. All types are stateless: commands are
//! built fresh per message and never mutated.

use crc::{Crc, CRC_32_ISO_HDLC};

pub mod ble;

pub use ble::{max_chunk_size, DeviceKind, OtaVersion, DEFAULT_MTU};

/// Length of the DFU firmware id field, in bytes.
pub const FIRMWARE_ID_LEN: usize = 8;

/// A control-point command together with its parameters.
///
/// Wire layout is one opcode byte followed by command-specific parameters;
/// multi-byte integers are little-endian except the V2 `company_id`, which the
/// device expects big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaCommand {
    /// Prepare for download, V1 devices: bare opcode.
    PrepareDownload,
    /// Prepare for download, V2 devices carrying DFU metadata.
    PrepareDownloadV2 {
        company_id: u16,
        firmware_id: [u8; FIRMWARE_ID_LEN],
    },
    /// Announce the full image size before the first data chunk.
    StartDownload { image_size: u32 },
    /// Ask the device to check the transferred image against our CRC32.
    Verify { crc32: u32 },
    Finish,
    /// Not used by the current flows, kept for wire completeness.
    GetStatus,
    /// Not used by the current flows, kept for wire completeness.
    ClearStatus,
    /// Abort the transfer; carries the last announced image size.
    Abort { image_size: u32 },
    /// Activate the downloaded image (V2 only).
    Apply,
}

impl OtaCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            OtaCommand::PrepareDownload | OtaCommand::PrepareDownloadV2 { .. } => 0x01,
            OtaCommand::StartDownload { .. } => 0x02,
            OtaCommand::Verify { .. } => 0x03,
            OtaCommand::Finish => 0x04,
            OtaCommand::GetStatus => 0x05,
            OtaCommand::ClearStatus => 0x06,
            OtaCommand::Abort { .. } => 0x07,
            OtaCommand::Apply => 0x08,
        }
    }

    /// Serialize into the fixed control-point layout.
    ///
    /// Encoding cannot fail; parameter sizes are fixed by construction.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            OtaCommand::PrepareDownload
            | OtaCommand::Finish
            | OtaCommand::GetStatus
            | OtaCommand::ClearStatus
            | OtaCommand::Apply => vec![self.opcode()],
            OtaCommand::PrepareDownloadV2 {
                company_id,
                firmware_id,
            } => {
                let mut buf = Vec::with_capacity(1 + 2 + FIRMWARE_ID_LEN);
                buf.push(self.opcode());
                // companyId goes out big-endian, unlike every other field.
                buf.extend_from_slice(&company_id.to_be_bytes());
                buf.extend_from_slice(&firmware_id);
                buf
            }
            OtaCommand::StartDownload { image_size: v }
            | OtaCommand::Verify { crc32: v }
            | OtaCommand::Abort { image_size: v } => {
                let mut buf = Vec::with_capacity(5);
                buf.push(self.opcode());
                buf.extend_from_slice(&v.to_le_bytes());
                buf
            }
        }
    }
}

/// Response status carried in the first byte of any control-point response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaStatus {
    Success = 0,
    Unsupported = 1,
    Illegal = 2,
    VerificationFailed = 3,
    InvalidImage = 4,
    InvalidImageSize = 5,
    MoreData = 6,
    InvalidAppId = 7,
    InvalidVersion = 8,
    Continue = 9,
    InvalidParameters = 10,
    SendCommandFailed = 11,
    Timeout = 12,
    CommandResponseError = 13,
}

impl OtaStatus {
    /// Decode the leading status byte of a response buffer.
    ///
    /// An empty buffer or an unrecognized byte decodes as [`OtaStatus::Unsupported`];
    /// malformed input never panics.
    pub fn parse(data: &[u8]) -> OtaStatus {
        match data.first() {
            Some(0) => OtaStatus::Success,
            Some(1) => OtaStatus::Unsupported,
            Some(2) => OtaStatus::Illegal,
            Some(3) => OtaStatus::VerificationFailed,
            Some(4) => OtaStatus::InvalidImage,
            Some(5) => OtaStatus::InvalidImageSize,
            Some(6) => OtaStatus::MoreData,
            Some(7) => OtaStatus::InvalidAppId,
            Some(8) => OtaStatus::InvalidVersion,
            Some(9) => OtaStatus::Continue,
            Some(10) => OtaStatus::InvalidParameters,
            Some(11) => OtaStatus::SendCommandFailed,
            Some(12) => OtaStatus::Timeout,
            Some(13) => OtaStatus::CommandResponseError,
            _ => OtaStatus::Unsupported,
        }
    }

    pub fn is_success(self) -> bool {
        self == OtaStatus::Success
    }

    pub fn description(self) -> &'static str {
        match self {
            OtaStatus::Success => "success",
            OtaStatus::Unsupported => "unsupported command",
            OtaStatus::Illegal => "illegal state",
            OtaStatus::VerificationFailed => "image verification failed",
            OtaStatus::InvalidImage => "invalid image",
            OtaStatus::InvalidImageSize => "invalid image size",
            OtaStatus::MoreData => "more data",
            OtaStatus::InvalidAppId => "invalid app id",
            OtaStatus::InvalidVersion => "invalid version",
            OtaStatus::Continue => "continue",
            OtaStatus::InvalidParameters => "invalid parameters",
            OtaStatus::SendCommandFailed => "failed to write command or data",
            OtaStatus::Timeout => "timeout",
            OtaStatus::CommandResponseError => "command response error",
        }
    }
}

/// Firmware identity reported by the optional app-info characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppInfo {
    pub app_id: u16,
    /// Present only in the 5-byte layout.
    pub version_prefix: Option<u8>,
    pub version_major: u8,
    pub version_minor: u8,
}

impl AppInfo {
    /// Parse a 4-byte (`app_id, major, minor`) or 5-byte
    /// (`app_id, prefix, major, minor`) app-info value.
    ///
    /// Any other length returns `None`; per the protocol that is not an
    /// error, callers log and move on.
    pub fn parse(data: &[u8]) -> Option<AppInfo> {
        match data.len() {
            4 => Some(AppInfo {
                app_id: u16::from_le_bytes([data[0], data[1]]),
                version_prefix: None,
                version_major: data[2],
                version_minor: data[3],
            }),
            5 => Some(AppInfo {
                app_id: u16::from_le_bytes([data[0], data[1]]),
                version_prefix: Some(data[2]),
                version_major: data[3],
                version_minor: data[4],
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version_prefix {
            Some(prefix) => write!(
                f,
                "AppId: 0x{:04X}, AppVersion: {}.{}.{}",
                self.app_id, prefix, self.version_major, self.version_minor
            ),
            None => write!(
                f,
                "AppId: 0x{:04X}, AppVersion: {}.{}",
                self.app_id, self.version_major, self.version_minor
            ),
        }
    }
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Incremental CRC32 over the firmware image, fed one transfer chunk at a
/// time. The final value (xor-out applied) is what the `verify` command
/// carries; it equals the one-shot CRC32 of the whole image.
pub struct ImageCrc {
    digest: crc::Digest<'static, u32>,
}

impl ImageCrc {
    pub fn new() -> ImageCrc {
        // The Crc tables are const; promoting to 'static keeps the digest
        // storable without a lifetime parameter.
        static TABLE: Crc<u32> = CRC32;
        ImageCrc {
            digest: TABLE.digest(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.digest.update(chunk);
    }

    /// Apply the final xor-out. Call exactly once, on the last chunk.
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for ImageCrc {
    fn default() -> Self {
        ImageCrc::new()
    }
}

/// One-shot CRC32 of a whole buffer, for checks against the incremental form.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Mesh-wide firmware distribution phase, distinct from the single-device
/// OTA state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DistributionPhase {
    /// Distribution is not active.
    Idle = 0x00,
    /// Firmware transfer in progress.
    TransferActive = 0x01,
    /// Transfer complete and updating nodes verified the firmware.
    TransferSuccess = 0x02,
    /// Firmware applying in progress.
    ApplyActive = 0x03,
    /// At least one updating node was updated successfully.
    Completed = 0x04,
    /// No updating nodes were updated successfully.
    Failed = 0x05,
}

impl DistributionPhase {
    pub fn from_u8(value: u8) -> Option<DistributionPhase> {
        match value {
            0x00 => Some(DistributionPhase::Idle),
            0x01 => Some(DistributionPhase::TransferActive),
            0x02 => Some(DistributionPhase::TransferSuccess),
            0x03 => Some(DistributionPhase::ApplyActive),
            0x04 => Some(DistributionPhase::Completed),
            0x05 => Some(DistributionPhase::Failed),
            _ => None,
        }
    }

    /// True once the distribution can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DistributionPhase::Completed | DistributionPhase::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_commands_encode_to_single_opcode() {
        assert_eq!(OtaCommand::PrepareDownload.to_bytes(), vec![0x01]);
        assert_eq!(OtaCommand::Finish.to_bytes(), vec![0x04]);
        assert_eq!(OtaCommand::GetStatus.to_bytes(), vec![0x05]);
        assert_eq!(OtaCommand::ClearStatus.to_bytes(), vec![0x06]);
        assert_eq!(OtaCommand::Apply.to_bytes(), vec![0x08]);
    }

    #[test]
    fn prepare_download_v2_layout() {
        let cmd = OtaCommand::PrepareDownloadV2 {
            company_id: 0x0131,
            firmware_id: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        // opcode, companyId big-endian, 8 firmware id bytes.
        assert_eq!(cmd.to_bytes(), vec![0x01, 0x01, 0x31, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn u32_parameters_are_little_endian() {
        assert_eq!(
            OtaCommand::StartDownload { image_size: 0x0102_0304 }.to_bytes(),
            vec![0x02, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(
            OtaCommand::Verify { crc32: 0xDEAD_BEEF }.to_bytes(),
            vec![0x03, 0xEF, 0xBE, 0xAD, 0xDE]
        );
        assert_eq!(
            OtaCommand::Abort { image_size: 100 }.to_bytes(),
            vec![0x07, 100, 0, 0, 0]
        );
    }

    #[test]
    fn status_parse_never_panics_on_malformed_input() {
        assert_eq!(OtaStatus::parse(&[]), OtaStatus::Unsupported);
        assert_eq!(OtaStatus::parse(&[0xFF]), OtaStatus::Unsupported);
        assert_eq!(OtaStatus::parse(&[14]), OtaStatus::Unsupported);
        assert_eq!(OtaStatus::parse(&[0]), OtaStatus::Success);
        assert_eq!(OtaStatus::parse(&[3, 0xAA]), OtaStatus::VerificationFailed);
        assert_eq!(OtaStatus::parse(&[13]), OtaStatus::CommandResponseError);
    }

    #[test]
    fn app_info_four_and_five_byte_layouts() {
        let four = AppInfo::parse(&[0x34, 0x12, 2, 7]).unwrap();
        assert_eq!(four.app_id, 0x1234);
        assert_eq!(four.version_prefix, None);
        assert_eq!((four.version_major, four.version_minor), (2, 7));
        assert_eq!(four.to_string(), "AppId: 0x1234, AppVersion: 2.7");

        let five = AppInfo::parse(&[0x34, 0x12, 1, 2, 7]).unwrap();
        assert_eq!(five.version_prefix, Some(1));
        assert_eq!(five.to_string(), "AppId: 0x1234, AppVersion: 1.2.7");
    }

    #[test]
    fn app_info_other_lengths_are_ignored() {
        assert_eq!(AppInfo::parse(&[]), None);
        assert_eq!(AppInfo::parse(&[1, 2, 3]), None);
        assert_eq!(AppInfo::parse(&[0; 6]), None);
    }

    #[test]
    fn incremental_crc_matches_one_shot() {
        let image: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let mut acc = ImageCrc::new();
        for chunk in image.chunks(40) {
            acc.update(chunk);
        }
        assert_eq!(acc.finalize(), crc32(&image));
    }

    #[test]
    fn crc_known_vector() {
        // Standard CRC-32/ISO-HDLC check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn distribution_phase_round_trip() {
        for raw in 0..=5u8 {
            let phase = DistributionPhase::from_u8(raw).unwrap();
            assert_eq!(phase as u8, raw);
        }
        assert_eq!(DistributionPhase::from_u8(6), None);
        assert!(DistributionPhase::Completed.is_terminal());
        assert!(DistributionPhase::Failed.is_terminal());
        assert!(!DistributionPhase::TransferActive.is_terminal());
    }
}
