use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ErrorCode, OtaError};
use crate::session::OtaState;

/// Guards against two upgrade sessions running at once. A session holds an
/// [`UpgradeToken`] for its whole lifetime; the flag clears when the token
/// drops, so completion (or a panic unwinding the driver) always releases it.
#[derive(Debug, Clone, Default)]
pub struct UpgradeLock {
    active: Arc<AtomicBool>,
}

impl UpgradeLock {
    pub fn new() -> Self {
        UpgradeLock::default()
    }

    /// The process-wide lock used by the driver entry points.
    pub fn global() -> &'static UpgradeLock {
        use std::sync::OnceLock;
        static GLOBAL: OnceLock<UpgradeLock> = OnceLock::new();
        GLOBAL.get_or_init(UpgradeLock::new)
    }

    pub fn acquire(&self) -> Result<UpgradeToken, OtaError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(UpgradeToken {
                active: Arc::clone(&self.active),
            })
        } else {
            Err(OtaError::new(
                OtaState::Idle,
                ErrorCode::Busy,
                "an OTA upgrade is already in progress",
            ))
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct UpgradeToken {
    active: Arc<AtomicBool>,
}

impl Drop for UpgradeToken {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy() {
        let lock = UpgradeLock::new();
        let token = lock.acquire().unwrap();
        let err = lock.acquire().unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);
        drop(token);
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn drop_releases() {
        let lock = UpgradeLock::new();
        {
            let _token = lock.acquire().unwrap();
            assert!(lock.is_active());
        }
        assert!(!lock.is_active());
    }
}
