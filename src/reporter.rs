use crate::membership::MembershipTracker;
use crate::metrics::{keys, saved_ratio, CrawlStats, MemoryProbe, StatusSnapshot};
use crate::periodic::PeriodicTask;
use crate::queue::WorkQueue;
use crate::rate_tracker::RateTracker;
use crate::CrawlError;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

struct ReporterState {
    stats: CrawlStats,
    queue: Arc<dyn WorkQueue>,
    membership: Arc<MembershipTracker>,
    previous: FxHashMap<&'static str, u64>,
    smoothing: FxHashMap<&'static str, RateTracker>,
    empty_window: RateTracker,
    probe: MemoryProbe,
    ticks_per_minute: f64,
}

impl ReporterState {
    /// Current value of `key` and its change since the last call.
    fn discrepancy(&mut self, key: &'static str) -> (u64, u64) {
        let current = self.stats.get_value(key);
        let previous = self.previous.insert(key, current).unwrap_or(0);
        (current, current.saturating_sub(previous))
    }

    fn smoothed(&mut self, key: &'static str, delta: u64) -> Option<f64> {
        let empty = &self.empty_window;
        let tracker = self.smoothing.entry(key).or_insert_with(|| empty.clone());
        tracker.add(delta as f64);
        tracker.mean()
    }

    fn sample(&mut self) -> Result<StatusSnapshot, CrawlError> {
        let (items, item_rate) = self.discrepancy(keys::ITEMS);
        let (pages, page_rate) = self.discrepancy(keys::PAGES);
        let (_, request_bytes) = self.discrepancy(keys::REQUEST_BYTES);
        let (_, response_bytes) = self.discrepancy(keys::RESPONSE_BYTES);

        let tps_page = self.smoothed(keys::PAGES, page_rate);
        if let Some(tps) = tps_page {
            self.stats.set_gauge(keys::TPS_PAGE, tps);
        }
        let tps_page = tps_page.unwrap_or(0.0);

        let queued = self.queue.len()?;
        let localload = if tps_page > 0.0 { queued as f64 / tps_page } else { 0.0 };

        let local_ops = self.stats.get_value(keys::LOCAL_ENQUEUED) + self.stats.get_value(keys::LOCAL_DEQUEUED);
        let remote_ops = self.stats.get_value(keys::REMOTE_ENQUEUED) + self.stats.get_value(keys::REMOTE_DEQUEUED);

        let snapshot = StatusSnapshot {
            count_pages: pages,
            count_items: items,
            tps_page,
            tps_download: ((request_bytes + response_bytes) / BYTES_PER_KB) as f64,
            localload,
            memoryusage: self.probe.resident_bytes().unwrap_or(0) as f64 / BYTES_PER_MB,
            optimize_filter: saved_ratio(
                self.stats.get_value(keys::FILTER_CHECKS),
                self.stats.get_value(keys::FILTER_SHARED),
            ),
            optimize_queue: saved_ratio(local_ops, remote_ops),
        };

        info!(
            "Crawled {} pages (at {} pages/s), scraped {} items (at {} items/min)",
            pages,
            page_rate,
            items,
            (item_rate as f64 * self.ticks_per_minute) as u64
        );
        Ok(snapshot)
    }
}

/// Turns the node's monotonic counters into a [`StatusSnapshot`] once per
/// tick and publishes it through the membership slot.
pub struct MetricsReporter {
    state: Arc<Mutex<ReporterState>>,
    interval: Duration,
    task: Mutex<Option<PeriodicTask>>,
}

impl MetricsReporter {
    pub fn new(
        stats: CrawlStats,
        queue: Arc<dyn WorkQueue>,
        membership: Arc<MembershipTracker>,
        interval: Duration,
        window: usize,
    ) -> Result<Self, CrawlError> {
        let empty_window = RateTracker::new(window)?;
        let ticks_per_minute = 60.0 / interval.as_secs_f64().max(f64::EPSILON);
        Ok(Self {
            state: Arc::new(Mutex::new(ReporterState {
                stats,
                queue,
                membership,
                previous: FxHashMap::default(),
                smoothing: FxHashMap::default(),
                empty_window,
                probe: MemoryProbe::new(),
                ticks_per_minute,
            })),
            interval,
            task: Mutex::new(None),
        })
    }

    /// Computes this tick's snapshot without publishing it.
    pub fn sample(&self) -> Result<StatusSnapshot, CrawlError> {
        self.state
            .lock()
            .map_err(|_| CrawlError::poisoned("reporter"))?
            .sample()
    }

    /// One full reporting cycle: sample, then publish.
    pub fn tick(&self) -> Result<StatusSnapshot, CrawlError> {
        Self::tick_state(&self.state)
    }

    fn tick_state(state: &Mutex<ReporterState>) -> Result<StatusSnapshot, CrawlError> {
        let mut state = state.lock().map_err(|_| CrawlError::poisoned("reporter"))?;
        let snapshot = state.sample()?;
        state.membership.submit_status(&snapshot)?;
        Ok(snapshot)
    }

    pub fn start(&self) -> Result<(), CrawlError> {
        let mut task = self.task.lock().map_err(|_| CrawlError::poisoned("reporter task"))?;
        if task.is_some() {
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        *task = Some(PeriodicTask::spawn("metrics-reporter", self.interval, move || {
            if let Err(e) = Self::tick_state(&state) {
                error!(error = %e, "status report failed");
            }
        })?);
        Ok(())
    }

    /// Stops ticking and returns the whole-session throughput, if any work
    /// was ever scheduled.
    pub fn stop(&self) -> Result<Option<f64>, CrawlError> {
        let task = self
            .task
            .lock()
            .map_err(|_| CrawlError::poisoned("reporter task"))?
            .take();
        if let Some(task) = task {
            task.stop();
        }
        Ok(self.session_summary())
    }

    pub fn session_summary(&self) -> Option<f64> {
        let stats = match self.state.lock() {
            Ok(state) => state.stats.clone_handle(),
            Err(poisoned) => poisoned.into_inner().stats.clone_handle(),
        };
        let throughput = stats.session_throughput();
        if let Some(tps) = throughput {
            info!(tps, "The TPS is: {:.2}", tps);
        }
        throughput
    }
}
