// profiler.rs - Slow-operation profiling
//
// Each Database owns one Profiler. Settings are atomics so the level can be
// changed while other threads are running queries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const PROFILE_CAPACITY: usize = 256;

/// Profiling levels (0 = off, 1 = slow operations only, 2 = everything)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProfilingLevel {
    #[serde(rename = "off")]
    Off = 0,
    #[serde(rename = "slow")]
    SlowOnly = 1,
    #[serde(rename = "all")]
    All = 2,
}

impl ProfilingLevel {
    /// Parse from a name or the numeric shell level (case-insensitive)
    pub fn from_str(s: &str) -> Option<ProfilingLevel> {
        match s.to_lowercase().as_str() {
            "off" | "0" => Some(ProfilingLevel::Off),
            "slow" | "1" => Some(ProfilingLevel::SlowOnly),
            "all" | "2" => Some(ProfilingLevel::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfilingLevel::Off => "off",
            ProfilingLevel::SlowOnly => "slow",
            ProfilingLevel::All => "all",
        }
    }

    fn from_u8(level: u8) -> ProfilingLevel {
        match level {
            0 => ProfilingLevel::Off,
            2 => ProfilingLevel::All,
            _ => ProfilingLevel::SlowOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProfilingStatus {
    pub level: ProfilingLevel,
    pub slow_ms: u64,
}

/// One profiled operation, shaped like a `system.profile` entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEntry {
    pub op: String,
    pub ns: String,
    pub millis: u64,
    pub docs_examined: u64,
    pub keys_examined: u64,
    pub n_returned: u64,
    pub plan_summary: String,
    pub ts: String,
}

#[derive(Debug)]
pub struct Profiler {
    level: AtomicU8,
    slow_ms: AtomicU64,
    entries: Mutex<VecDeque<ProfileEntry>>,
}

impl Profiler {
    pub fn new(level: ProfilingLevel, slow_ms: u64) -> Self {
        Profiler {
            level: AtomicU8::new(level as u8),
            slow_ms: AtomicU64::new(slow_ms),
            entries: Mutex::new(VecDeque::with_capacity(PROFILE_CAPACITY)),
        }
    }

    pub fn status(&self) -> ProfilingStatus {
        ProfilingStatus {
            level: ProfilingLevel::from_u8(self.level.load(Ordering::Relaxed)),
            slow_ms: self.slow_ms.load(Ordering::Relaxed),
        }
    }

    /// Change settings, returning the previous ones
    pub fn set(&self, level: ProfilingLevel, slow_ms: Option<u64>) -> ProfilingStatus {
        let previous = self.status();
        self.level.store(level as u8, Ordering::Relaxed);
        if let Some(ms) = slow_ms {
            self.slow_ms.store(ms, Ordering::Relaxed);
        }
        previous
    }

    /// Record a finished operation. Returns true when it was kept.
    pub fn record(&self, mut entry: ProfileEntry, elapsed: Duration) -> bool {
        let status = self.status();
        entry.millis = elapsed.as_millis() as u64;
        let slow = entry.millis >= status.slow_ms;

        if slow {
            warn!(
                op = %entry.op,
                ns = %entry.ns,
                millis = entry.millis,
                docs_examined = entry.docs_examined,
                plan = %entry.plan_summary,
                "slow operation"
            );
        }

        let keep = match status.level {
            ProfilingLevel::Off => false,
            ProfilingLevel::SlowOnly => slow,
            ProfilingLevel::All => {
                debug!(op = %entry.op, ns = %entry.ns, millis = entry.millis, "operation");
                true
            }
        };

        if keep {
            let mut entries = self.entries.lock();
            if entries.len() == PROFILE_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
        keep
    }

    /// Kept entries, oldest first
    pub fn entries(&self) -> Vec<ProfileEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
