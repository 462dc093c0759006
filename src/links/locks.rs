//! Per-driver mutual exclusion
//!
//! Reconciliation and user review both write `UserDriverLink` rows. All writes
//! for links of one driver identity are serialized through a keyed async mutex;
//! unrelated drivers proceed in parallel. Entries are dropped once unused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type Registry = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Keyed lock registry shared by the reconciler and the lifecycle service
#[derive(Debug, Clone, Default)]
pub struct DriverLocks {
    registry: Registry,
}

impl DriverLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to links of `driver_id`.
    pub async fn lock(&self, driver_id: &str) -> DriverLockGuard {
        let mutex = {
            let mut map = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(driver_id.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        DriverLockGuard {
            guard: Some(guard),
            driver_id: driver_id.to_string(),
            registry: self.registry.clone(),
        }
    }

    /// Number of drivers currently locked or awaited
    pub fn active(&self) -> usize {
        self.registry.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held while a driver's links are being written
#[derive(Debug)]
pub struct DriverLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    driver_id: String,
    registry: Registry,
}

impl Drop for DriverLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get(&self.driver_id) {
            if Arc::strong_count(entry) == 1 {
                map.remove(&self.driver_id);
            }
        }
    }
}
