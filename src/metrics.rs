use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

/// Counter and gauge names shared between the engine, the queue, the
/// filter and the reporter.
pub mod keys {
    pub const PAGES: &str = "response_received_count";
    pub const ITEMS: &str = "item_scraped_count";
    pub const REQUEST_BYTES: &str = "downloader/request_bytes";
    pub const RESPONSE_BYTES: &str = "downloader/response_bytes";

    pub const FILTER_CHECKS: &str = "dupefilter/checks";
    pub const FILTER_SHARED: &str = "dupefilter/shared";
    pub const FILTER_FILTERED: &str = "dupefilter/filtered";

    pub const LOCAL_ENQUEUED: &str = "scheduler/enqueued/local";
    pub const LOCAL_DEQUEUED: &str = "scheduler/dequeued/local";
    pub const REMOTE_ENQUEUED: &str = "scheduler/enqueued/remote";
    pub const REMOTE_DEQUEUED: &str = "scheduler/dequeued/remote";

    /// Smoothed pages per tick, written by the reporter, read by the
    /// rebalancer.
    pub const TPS_PAGE: &str = "tps_page";
}

#[derive(Default)]
struct StatsInner {
    counters: FxHashMap<&'static str, u64>,
    gauges: FxHashMap<&'static str, f64>,
    started_at: Option<Instant>,
}

/// Cloneable handle onto one node's counters. All clones see the same
/// values.
#[derive(Clone, Default)]
pub struct CrawlStats {
    inner: Arc<Mutex<StatsInner>>,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clone_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    // A poisoned stats lock only means a panicking thread held it; the
    // counters are still usable.
    fn with<T>(&self, f: impl FnOnce(&mut StatsInner) -> T) -> T {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    pub fn inc_value(&self, key: &'static str, by: u64) {
        self.with(|inner| *inner.counters.entry(key).or_insert(0) += by);
    }

    pub fn get_value(&self, key: &'static str) -> u64 {
        self.with(|inner| inner.counters.get(key).copied().unwrap_or(0))
    }

    pub fn set_gauge(&self, key: &'static str, value: f64) {
        self.with(|inner| {
            inner.gauges.insert(key, value);
        });
    }

    pub fn gauge(&self, key: &'static str) -> Option<f64> {
        self.with(|inner| inner.gauges.get(key).copied())
    }

    /// First call wins; later calls are no-ops.
    pub fn mark_started(&self) {
        self.with(|inner| {
            if inner.started_at.is_none() {
                inner.started_at = Some(Instant::now());
            }
        });
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.with(|inner| inner.started_at.map(|t| t.elapsed()))
    }

    /// Pages per second of wall-clock time since work was first scheduled.
    pub fn session_throughput(&self) -> Option<f64> {
        let elapsed = self.elapsed()?.as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.get_value(keys::PAGES) as f64 / elapsed)
    }
}

/// What a node publishes about itself each reporting cycle. Serialized as a
/// flat JSON object with exactly these keys; readers tolerate missing keys
/// so fields can be added without breaking older observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSnapshot {
    pub count_pages: u64,
    pub count_items: u64,
    pub tps_page: f64,
    /// KB transferred during the last tick.
    pub tps_download: f64,
    pub localload: f64,
    /// MB resident.
    pub memoryusage: f64,
    pub optimize_filter: f64,
    pub optimize_queue: f64,
}

impl StatusSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Share of `total` operations that did not need `expensive` ones.
pub fn saved_ratio(total: u64, expensive: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (total as f64 - expensive as f64) / total as f64
}

/// Resident memory of this process.
pub struct MemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_process(pid);
        self.system.process(pid).map(|p| p.memory())
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}
