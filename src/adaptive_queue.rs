//! Two-tier work queue.
//!
//! The engine only ever touches the local buffer, a stack behind one mutex.
//! A background cycle compares how long the local backlog would take to
//! drain against how long the shared backlog would take the whole fleet,
//! and moves a bounded batch in whichever direction evens them out.

use crate::config::CrawlConfig;
use crate::item::WorkItem;
use crate::membership::ClusterView;
use crate::metrics::{keys, CrawlStats};
use crate::periodic::PeriodicTask;
use crate::queue::{QueueLenLike, RemoteQueue, WorkQueue};
use crate::store::SharedStore;
use crate::CrawlError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceSettings {
    pub interval: Duration,
    pub transfer_cap: f64,
    pub concurrent_requests: usize,
    /// Scale remote throughput by the number of peers. A tunable
    /// heuristic; turn it off to treat the fleet as one remote consumer.
    pub fleet_scaling: bool,
}

impl BalanceSettings {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            interval: config.rebalance_interval,
            transfer_cap: config.transfer_cap,
            concurrent_requests: config.concurrent_requests,
            fleet_scaling: config.fleet_scaling,
        }
    }
}

/// Everything one rebalancing decision looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadInputs {
    pub local_len: usize,
    pub remote_len: usize,
    /// Smoothed pages per tick, if the reporter has produced one yet.
    pub local_tps: Option<f64>,
    pub fleet_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadPlan {
    pub local_load: f64,
    pub remote_load: f64,
    /// `local_load - remote_load`.
    pub differential: f64,
    /// Items to move: positive pushes local -> remote, negative pulls.
    pub amount: i64,
}

impl LoadPlan {
    pub fn compute(inputs: &LoadInputs, settings: &BalanceSettings) -> Self {
        let concurrency = settings.concurrent_requests.max(1) as f64;
        let fleet = inputs.fleet_size.max(1);
        let known_tps = inputs.local_tps.filter(|t| t.is_finite() && *t > 0.0);

        let local_load = match known_tps {
            Some(tps) => inputs.local_len as f64 / tps,
            None => 0.0,
        };
        let remote_load = inputs.remote_len as f64 / (concurrency * fleet as f64);
        let differential = local_load - remote_load;

        let local_tps = known_tps.unwrap_or(concurrency);
        let mut remote_tps = concurrency;
        if settings.fleet_scaling && fleet > 1 {
            remote_tps += local_tps * (fleet - 1) as f64;
        }
        let raw = local_tps * remote_tps * differential / (local_tps + remote_tps);
        let cap = settings.transfer_cap.abs();
        let amount = if raw.is_finite() {
            raw.clamp(-cap, cap).trunc() as i64
        } else {
            0
        };

        Self {
            local_load,
            remote_load,
            differential,
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceOutcome {
    /// Another cycle was still running.
    Skipped,
    Idle(LoadPlan),
    Pushed { plan: LoadPlan, count: usize },
    Pulled { plan: LoadPlan, requested: usize, received: usize },
}

struct AdaptiveInner {
    local: Mutex<Vec<WorkItem>>,
    remote: RemoteQueue,
    view: Arc<ClusterView>,
    stats: CrawlStats,
    settings: BalanceSettings,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AdaptiveInner {
    fn local(&self) -> Result<MutexGuard<'_, Vec<WorkItem>>, CrawlError> {
        self.local.lock().map_err(|_| CrawlError::poisoned("local buffer"))
    }

    fn inputs(&self) -> Result<LoadInputs, CrawlError> {
        // The guard must be gone before the remote round trip.
        let local_len = self.local()?.len();
        let remote_len = self.remote.len()?;
        Ok(LoadInputs {
            local_len,
            remote_len,
            local_tps: self.stats.gauge(keys::TPS_PAGE),
            fleet_size: self.view.fleet_size(),
        })
    }

    fn rebalance_once(&self) -> Result<RebalanceOutcome, CrawlError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(key = %self.remote.key(), "rebalance already in flight, skipping tick");
            return Ok(RebalanceOutcome::Skipped);
        }
        let _guard = InFlight(&self.in_flight);

        let plan = LoadPlan::compute(&self.inputs()?, &self.settings);
        info!(
            local_load = plan.local_load,
            remote_load = plan.remote_load,
            differential = plan.differential,
            amount = plan.amount,
            "auto balance"
        );

        match plan.amount {
            0 => Ok(RebalanceOutcome::Idle(plan)),
            n if n > 0 => self.push_to_remote(plan, n as usize),
            n => self.pull_from_remote(plan, n.unsigned_abs() as usize),
        }
    }

    fn push_to_remote(&self, plan: LoadPlan, wanted: usize) -> Result<RebalanceOutcome, CrawlError> {
        // Top of the stack, oldest first. The lock is released before the
        // network write.
        let batch = {
            let mut local = self.local()?;
            let take = wanted.min(local.len());
            let start = local.len() - take;
            local.split_off(start)
        };
        if batch.is_empty() {
            return Ok(RebalanceOutcome::Idle(plan));
        }

        match self.remote.push_batch(&batch) {
            Ok(count) => Ok(RebalanceOutcome::Pushed { plan, count }),
            Err(e) => {
                let count = batch.len();
                match self.local.lock() {
                    Ok(mut local) => local.extend(batch),
                    Err(poisoned) => poisoned.into_inner().extend(batch),
                }
                error!(count, error = %e, "push to remote failed, items returned to local buffer");
                Err(e)
            }
        }
    }

    fn pull_from_remote(&self, plan: LoadPlan, wanted: usize) -> Result<RebalanceOutcome, CrawlError> {
        let items = self.remote.pop_batch(wanted)?;
        let received = items.len();
        match self.local.lock() {
            Ok(mut local) => local.extend(items),
            Err(_) => {
                error!(count = received, "local buffer unusable, returning pulled items to remote");
                self.remote.push_batch(&items)?;
                return Err(CrawlError::poisoned("local buffer"));
            }
        }
        Ok(RebalanceOutcome::Pulled {
            plan,
            requested: wanted,
            received,
        })
    }
}

/// Local stack in front of the shared FIFO, with an owned rebalancing
/// task started by [`WorkQueue::start`].
pub struct AdaptiveQueue {
    inner: Arc<AdaptiveInner>,
    task: Mutex<Option<PeriodicTask>>,
}

impl AdaptiveQueue {
    pub fn new(
        remote: RemoteQueue,
        view: Arc<ClusterView>,
        stats: CrawlStats,
        settings: BalanceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(AdaptiveInner {
                local: Mutex::new(Vec::new()),
                remote,
                view,
                stats,
                settings,
                in_flight: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &CrawlConfig,
        store: Arc<dyn SharedStore>,
        view: Arc<ClusterView>,
        stats: CrawlStats,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let remote = RemoteQueue::new(store, &config.queue_key(), stats.clone_handle());
        Ok(Self::new(remote, view, stats, BalanceSettings::from_config(config)))
    }

    /// Runs one cycle now. Overlapping calls return
    /// [`RebalanceOutcome::Skipped`].
    pub fn rebalance_once(&self) -> Result<RebalanceOutcome, CrawlError> {
        self.inner.rebalance_once()
    }

    pub fn plan(&self) -> Result<LoadPlan, CrawlError> {
        Ok(LoadPlan::compute(&self.inner.inputs()?, &self.inner.settings))
    }

    pub fn remote(&self) -> &RemoteQueue {
        &self.inner.remote
    }

    pub fn remote_len(&self) -> Result<usize, CrawlError> {
        self.inner.remote.len()
    }

    pub fn settings(&self) -> BalanceSettings {
        self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }
}

impl QueueLenLike for AdaptiveQueue {
    /// Local buffer only; the scheduler uses it to decide whether it is idle.
    fn len(&self) -> Result<usize, CrawlError> {
        Ok(self.inner.local()?.len())
    }
}

impl WorkQueue for AdaptiveQueue {
    fn push(&self, items: Vec<WorkItem>) -> Result<(), CrawlError> {
        self.inner.local()?.extend(items);
        self.inner.stats.inc_value(keys::LOCAL_ENQUEUED, 1);
        Ok(())
    }

    fn pop(&self, count: usize) -> Result<Vec<WorkItem>, CrawlError> {
        let mut popped = {
            let mut local = self.inner.local()?;
            let take = count.min(local.len());
            let start = local.len() - take;
            local.split_off(start)
        };
        popped.reverse();
        if !popped.is_empty() {
            self.inner.stats.inc_value(keys::LOCAL_DEQUEUED, 1);
        }
        Ok(popped)
    }

    fn clear(&self) -> Result<(), CrawlError> {
        self.inner.local()?.clear();
        self.inner.remote.clear()
    }

    fn start(&self) -> Result<(), CrawlError> {
        let mut task = self.task.lock().map_err(|_| CrawlError::poisoned("rebalance task"))?;
        if task.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let name = format!("rebalance-{}", self.inner.remote.key());
        *task = Some(PeriodicTask::spawn(&name, self.inner.settings.interval, move || {
            if let Err(e) = inner.rebalance_once() {
                error!(error = %e, "rebalance cycle failed, retrying next tick");
            }
        })?);
        Ok(())
    }

    fn stop(&self) -> Result<(), CrawlError> {
        let task = self
            .task
            .lock()
            .map_err(|_| CrawlError::poisoned("rebalance task"))?
            .take();
        if let Some(task) = task {
            task.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BalanceSettings {
        BalanceSettings {
            interval: Duration::from_secs(2),
            transfer_cap: 200.0,
            concurrent_requests: 16,
            fleet_scaling: true,
        }
    }

    fn inputs(local_len: usize, remote_len: usize, local_tps: Option<f64>, fleet_size: usize) -> LoadInputs {
        LoadInputs {
            local_len,
            remote_len,
            local_tps,
            fleet_size,
        }
    }

    #[test]
    fn test_idle_node_moves_nothing() {
        let plan = LoadPlan::compute(&inputs(0, 0, None, 1), &settings());
        assert_eq!(plan.local_load, 0.0);
        assert_eq!(plan.amount, 0);
    }

    #[test]
    fn test_unknown_throughput_means_zero_local_load() {
        let plan = LoadPlan::compute(&inputs(500, 0, None, 1), &settings());
        assert_eq!(plan.local_load, 0.0);
        assert_eq!(plan.amount, 0);
    }

    #[test]
    fn test_single_node_follows_harmonic_share() {
        // local_load 40, remote_load 0, lt 2, rt 16: 2*16*40/18
        let plan = LoadPlan::compute(&inputs(80, 0, Some(2.0), 1), &settings());
        assert_eq!(plan.local_load, 40.0);
        assert_eq!(plan.amount, 71);
    }

    #[test]
    fn test_starved_node_pulls() {
        // remote_load 320 / (16*2) = 10, lt 4, rt 16 + 4
        let plan = LoadPlan::compute(&inputs(0, 320, Some(4.0), 2), &settings());
        assert_eq!(plan.remote_load, 10.0);
        assert_eq!(plan.amount, -33);
    }

    #[test]
    fn test_fleet_scaling_can_be_turned_off() {
        let on = LoadPlan::compute(&inputs(0, 320, Some(4.0), 2), &settings());
        let off = LoadPlan::compute(
            &inputs(0, 320, Some(4.0), 2),
            &BalanceSettings {
                fleet_scaling: false,
                ..settings()
            },
        );
        assert_eq!(on.differential, off.differential);
        assert_eq!(off.amount, -32);
    }

    #[test]
    fn test_amount_is_clamped_both_ways() {
        let big = LoadPlan::compute(&inputs(1_000_000, 0, Some(1.0), 1), &settings());
        assert_eq!(big.amount, 200);
        let small = LoadPlan::compute(&inputs(0, 1_000_000, Some(1.0), 1), &settings());
        assert_eq!(small.amount, -200);
    }
}
