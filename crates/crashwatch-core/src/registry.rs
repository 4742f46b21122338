//! Per-device crash counters shared by every analysis session of a process.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Prefix of synthetic post-condition steps minted for discovered crashes.
pub const CRASH_STEP_PREFIX: &str = "s-ca_";

/// Prefix of the post-condition step reported when the backend never started.
pub const FAILURE_STEP_PREFIX: &str = "ca_fail_";

type TestCaseCounts = Arc<Mutex<HashMap<String, u64>>>;

/// Counts crashes already attributed per (device, test case).
///
/// Reservations for one device are serialized by that device's lock;
/// different devices never contend beyond the map shard lookup.
#[derive(Debug, Default)]
pub struct CrashCountRegistry {
    devices: DashMap<String, TestCaseCounts>,
    failures: AtomicU64,
}

impl CrashCountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the count for the key and return the count before the add.
    pub fn reserve(&self, device_id: &str, test_case_id: &str, n: u64) -> u64 {
        let slot = self.device_slot(device_id);
        let mut counts = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(test_case_id.to_string()).or_insert(0);
        let prior = *count;
        *count = prior + n;
        prior
    }

    pub fn count(&self, device_id: &str, test_case_id: &str) -> u64 {
        self.devices
            .get(device_id)
            .map(|slot| {
                let counts = slot.lock().unwrap_or_else(PoisonError::into_inner);
                counts.get(test_case_id).copied().unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Next process-unique failure step id (`ca_fail_1`, `ca_fail_2`, ...).
    pub fn next_failure_step(&self) -> String {
        let ordinal = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}", FAILURE_STEP_PREFIX, ordinal)
    }

    fn device_slot(&self, device_id: &str) -> TestCaseCounts {
        self.devices
            .entry(device_id.to_string())
            .or_default()
            .value()
            .clone()
    }
}

/// Step ids `s-ca_<prior+1> ..= s-ca_<prior+n>`.
pub fn synthetic_step_ids(prior: u64, n: u64) -> Vec<String> {
    (prior + 1..=prior + n)
        .map(|ordinal| format!("{}{}", CRASH_STEP_PREFIX, ordinal))
        .collect()
}
