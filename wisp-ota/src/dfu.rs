use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use wisp_proto::{DistributionPhase, FIRMWARE_ID_LEN};

use crate::config::OtaConfig;
use crate::device::MeshClient;

/// How a firmware image is distributed through the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DfuType {
    /// The proxy node distributes to every matching node.
    ProxyToAll,
    /// This host uploads to the distributor, which then floods the mesh.
    AppToAll,
    /// Direct OTA to a single device, no distribution.
    AppOtaToDevice,
}

impl DfuType {
    pub fn is_distribution(self) -> bool {
        !matches!(self, DfuType::AppOtaToDevice)
    }
}

/// Which distribution operation the caller asked for. `None` is a plain
/// firmware upload with no distributor involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DfuCommand {
    #[default]
    None,
    Start,
    Apply,
    Stop,
    GetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata line {0} is not valid hex")]
    BadHex(usize),
    #[error("firmware id must be {expected} bytes, got {got}")]
    BadFirmwareIdLength { expected: usize, got: usize },
    #[error("metadata is missing the firmware id")]
    MissingFirmwareId,
    #[error("metadata is missing the validation data")]
    MissingValidationData,
}

/// Firmware metadata shipped next to the image file, needed to start a
/// mesh distribution. Parsed from the vendor's text format:
///
/// ```text
/// Firmware ID = 0x013101311001000234
/// Validation Data = 0x7b9e...
/// ```
///
/// The older two-line variant (`CID=0x...` / `FWID=0x...`) is accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DfuMetadata {
    pub company_id: u16,
    pub firmware_id: [u8; FIRMWARE_ID_LEN],
    pub product_id: u16,
    pub hw_version: u16,
    pub version: FirmwareVersion,
    pub validation_data: Vec<u8>,
}

impl DfuMetadata {
    pub fn parse(text: &str) -> Result<DfuMetadata, MetadataError> {
        let mut company_id = None;
        let mut firmware_id: Option<[u8; FIRMWARE_ID_LEN]> = None;
        let mut validation_data = None;

        for (n, line) in text.lines().enumerate() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            let value = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .unwrap_or(value);
            match key.as_str() {
                // combined form: company id (2 bytes) followed by the 8 byte id
                "firmware id" => {
                    let bytes = decode_hex(value).ok_or(MetadataError::BadHex(n))?;
                    if bytes.len() != FIRMWARE_ID_LEN + 2 {
                        return Err(MetadataError::BadFirmwareIdLength {
                            expected: FIRMWARE_ID_LEN + 2,
                            got: bytes.len(),
                        });
                    }
                    company_id = Some(u16::from_be_bytes([bytes[0], bytes[1]]));
                    let mut id = [0u8; FIRMWARE_ID_LEN];
                    id.copy_from_slice(&bytes[2..]);
                    firmware_id = Some(id);
                }
                "cid" => {
                    company_id = Some(
                        u16::from_str_radix(value, 16).map_err(|_| MetadataError::BadHex(n))?,
                    );
                }
                "fwid" => {
                    let bytes = decode_hex(value).ok_or(MetadataError::BadHex(n))?;
                    let id: [u8; FIRMWARE_ID_LEN] = bytes.try_into().map_err(
                        |bytes: Vec<u8>| MetadataError::BadFirmwareIdLength {
                            expected: FIRMWARE_ID_LEN,
                            got: bytes.len(),
                        },
                    )?;
                    firmware_id = Some(id);
                }
                "validation data" => {
                    validation_data =
                        Some(decode_hex(value).ok_or(MetadataError::BadHex(n))?);
                }
                _ => {}
            }
        }

        let firmware_id = firmware_id.ok_or(MetadataError::MissingFirmwareId)?;
        let validation_data = validation_data.ok_or(MetadataError::MissingValidationData)?;
        Ok(DfuMetadata {
            company_id: company_id.unwrap_or(0),
            firmware_id,
            product_id: u16::from_be_bytes([firmware_id[0], firmware_id[1]]),
            hw_version: u16::from_be_bytes([firmware_id[2], firmware_id[3]]),
            version: FirmwareVersion {
                major: firmware_id[4],
                minor: firmware_id[5],
                revision: u16::from_be_bytes([firmware_id[6], firmware_id[7]]),
            },
            validation_data,
        })
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    // chunk by bytes, not chars, so multi-byte text fails cleanly instead
    // of tripping a char boundary
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// Distribution parameters attached to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuContext {
    pub dfu_type: DfuType,
    pub command: DfuCommand,
    pub metadata: Option<DfuMetadata>,
}

impl DfuContext {
    pub fn direct() -> Self {
        DfuContext {
            dfu_type: DfuType::AppOtaToDevice,
            command: DfuCommand::None,
            metadata: None,
        }
    }

    pub fn distribution(dfu_type: DfuType, metadata: DfuMetadata) -> Self {
        DfuContext {
            dfu_type,
            command: DfuCommand::Start,
            metadata: Some(metadata),
        }
    }
}

/// A distributor status sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionStatus {
    pub phase: DistributionPhase,
    /// Percentage of nodes the distributor has finished transferring to.
    pub progress: u8,
}

/// Polls the distributor after a fire-and-forget distribution start and
/// forwards status samples until the distribution reaches a terminal
/// phase (or nobody is listening any more).
pub struct DistributionMonitor {
    mesh: Arc<dyn MeshClient>,
    component: String,
    interval: std::time::Duration,
}

impl DistributionMonitor {
    pub fn new(mesh: Arc<dyn MeshClient>, component: impl Into<String>, config: &OtaConfig) -> Self {
        DistributionMonitor {
            mesh,
            component: component.into(),
            interval: config.dfu_status_interval(),
        }
    }

    pub async fn run(self, status: mpsc::UnboundedSender<DistributionStatus>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the distributor has
        // one interval to get going before we ask
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sample = match self.mesh.dfu_get_status(&self.component).await {
                Ok(sample) => sample,
                Err(e) => {
                    log::warn!("distribution status poll failed: {e}");
                    continue;
                }
            };
            log::debug!(
                "distribution phase {:?}, progress {}%",
                sample.phase,
                sample.progress
            );
            if status.send(sample).is_err() {
                return;
            }
            if sample.is_finished() {
                return;
            }
        }
    }
}

impl DistributionStatus {
    /// Polling can stop: the distributor reached a terminal phase, or an
    /// active phase reports all nodes done (some distributors never move
    /// past it on their own).
    pub fn is_finished(&self) -> bool {
        if self.phase.is_terminal() {
            return true;
        }
        self.progress >= 100
            && matches!(
                self.phase,
                DistributionPhase::TransferActive | DistributionPhase::ApplyActive
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_firmware_id_format() {
        let text = "Firmware ID = 0x01313101311001000234\nValidation Data = 0xdeadbeef\n";
        let m = DfuMetadata::parse(text).unwrap();
        assert_eq!(m.company_id, 0x0131);
        assert_eq!(m.firmware_id, [0x31, 0x01, 0x31, 0x10, 0x01, 0x00, 0x02, 0x34]);
        assert_eq!(m.product_id, 0x3101);
        assert_eq!(m.hw_version, 0x3110);
        assert_eq!(m.version.to_string(), "1.0.564");
        assert_eq!(m.validation_data, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn parses_legacy_cid_fwid_format() {
        let text = "CID=0x131\nFWID=0x3101311001000234\nValidation Data=0x00";
        let m = DfuMetadata::parse(text).unwrap();
        assert_eq!(m.company_id, 0x131);
        assert_eq!(m.firmware_id[0], 0x31);
        assert_eq!(m.validation_data, vec![0x00]);
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert_eq!(
            DfuMetadata::parse("Validation Data = 0x00"),
            Err(MetadataError::MissingFirmwareId)
        );
        assert_eq!(
            DfuMetadata::parse("FWID=0x3101311001000234"),
            Err(MetadataError::MissingValidationData)
        );
    }

    #[test]
    fn wrong_firmware_id_length_is_rejected() {
        let err = DfuMetadata::parse("FWID=0x31013110\nValidation Data=0x00").unwrap_err();
        assert_eq!(
            err,
            MetadataError::BadFirmwareIdLength { expected: 8, got: 4 }
        );
    }

    #[test]
    fn garbage_hex_is_rejected() {
        assert!(matches!(
            DfuMetadata::parse("FWID=0xzz01311001000234"),
            Err(MetadataError::BadHex(0))
        ));
    }

    #[test]
    fn multibyte_text_in_hex_fields_is_rejected() {
        assert!(matches!(
            DfuMetadata::parse("FWID=0x\u{20ac}\u{20ac}\nValidation Data=0x00"),
            Err(MetadataError::BadHex(0))
        ));
        assert!(matches!(
            DfuMetadata::parse("FWID=0x3101311001000234\nValidation Data=0x\u{e9}\u{e9}"),
            Err(MetadataError::BadHex(1))
        ));
    }

    #[test]
    fn monitor_stop_conditions() {
        let done = |phase, progress| DistributionStatus { phase, progress }.is_finished();
        assert!(done(DistributionPhase::Completed, 0));
        assert!(done(DistributionPhase::Failed, 40));
        assert!(done(DistributionPhase::TransferActive, 100));
        assert!(done(DistributionPhase::ApplyActive, 100));
        assert!(!done(DistributionPhase::TransferActive, 99));
        assert!(!done(DistributionPhase::Idle, 100));
        assert!(!done(DistributionPhase::TransferSuccess, 0));
    }

    #[test]
    fn only_direct_type_skips_distribution() {
        assert!(!DfuType::AppOtaToDevice.is_distribution());
        assert!(DfuType::ProxyToAll.is_distribution());
        assert!(DfuType::AppToAll.is_distribution());
    }

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::device::TransportError;

    /// Hands out a scripted sequence of status poll results.
    struct ScriptedDistributor {
        script: Mutex<VecDeque<Result<DistributionStatus, TransportError>>>,
    }

    #[async_trait::async_trait]
    impl MeshClient for ScriptedDistributor {
        async fn connect_component(&self, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn component_info(&self, _: &str) -> Result<Option<String>, TransportError> {
            Ok(None)
        }
        async fn dfu_start(
            &self,
            _: DfuType,
            _: &str,
            _: &[u8; FIRMWARE_ID_LEN],
            _: &[u8],
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn dfu_stop(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn dfu_get_status(&self, _: &str) -> Result<DistributionStatus, TransportError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .expect("polled after the terminal status")
        }
        fn is_network_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_polls_until_terminal_phase() {
        let active = DistributionStatus {
            phase: DistributionPhase::TransferActive,
            progress: 40,
        };
        let done = DistributionStatus {
            phase: DistributionPhase::Completed,
            progress: 100,
        };
        let mesh = Arc::new(ScriptedDistributor {
            script: Mutex::new(VecDeque::from([
                Err(TransportError::NotConnected),
                Ok(active),
                Ok(done),
            ])),
        });
        let config = OtaConfig::default();
        let monitor = DistributionMonitor::new(mesh as Arc<dyn MeshClient>, "node", &config);

        let started = tokio::time::Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.run(tx).await;

        // one interval per poll, the immediate first tick is skipped, and
        // the failed poll is retried on the next tick
        assert_eq!(started.elapsed(), config.dfu_status_interval() * 3);
        assert_eq!(rx.recv().await, Some(active));
        assert_eq!(rx.recv().await, Some(done));
        assert_eq!(rx.recv().await, None);
    }
}
