use crate::adaptive_queue::AdaptiveQueue;
use crate::config::{CrawlConfig, QueueKind};
use crate::item::WorkItem;
use crate::membership::ClusterView;
use crate::metrics::{keys, CrawlStats};
use crate::store::SharedStore;
use crate::CrawlError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error};

pub trait QueueLenLike {
    fn len(&self) -> Result<usize, CrawlError>;
    fn is_empty(&self) -> Result<bool, CrawlError> {
        Ok(self.len()? == 0)
    }
}

/// What the engine's scheduler sees. All methods take `&self` so one queue
/// can be shared between the engine thread and background tasks.
pub trait WorkQueue: QueueLenLike + Send + Sync {
    fn push(&self, items: Vec<WorkItem>) -> Result<(), CrawlError>;
    /// Up to `count` items; empty when nothing is available. Never waits.
    fn pop(&self, count: usize) -> Result<Vec<WorkItem>, CrawlError>;
    fn clear(&self) -> Result<(), CrawlError>;

    fn start(&self) -> Result<(), CrawlError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), CrawlError> {
        Ok(())
    }
}

/// Resolve the configured queue once at startup.
pub fn build_queue(
    config: &CrawlConfig,
    store: Arc<dyn SharedStore>,
    view: Arc<ClusterView>,
    stats: CrawlStats,
) -> Result<Arc<dyn WorkQueue>, CrawlError> {
    config.validate()?;
    Ok(match config.queue_kind {
        QueueKind::Local => Arc::new(LocalQueue::new(stats)),
        QueueKind::Remote => Arc::new(RemoteQueue::new(store, &config.queue_key(), stats)),
        QueueKind::Adaptive => Arc::new(AdaptiveQueue::from_config(config, store, view, stats)?),
    })
}

/// In-process stack: the newest item is popped first.
pub struct LocalQueue {
    items: Mutex<Vec<WorkItem>>,
    stats: CrawlStats,
}

impl LocalQueue {
    pub fn new(stats: CrawlStats) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            stats,
        }
    }
}

impl QueueLenLike for LocalQueue {
    fn len(&self) -> Result<usize, CrawlError> {
        Ok(self.items.lock().map_err(|_| CrawlError::poisoned("local queue"))?.len())
    }
}

impl WorkQueue for LocalQueue {
    fn push(&self, items: Vec<WorkItem>) -> Result<(), CrawlError> {
        self.items
            .lock()
            .map_err(|_| CrawlError::poisoned("local queue"))?
            .extend(items);
        self.stats.inc_value(keys::LOCAL_ENQUEUED, 1);
        Ok(())
    }

    fn pop(&self, count: usize) -> Result<Vec<WorkItem>, CrawlError> {
        let mut items = self.items.lock().map_err(|_| CrawlError::poisoned("local queue"))?;
        let take = count.min(items.len());
        let start = items.len() - take;
        let mut popped = items.split_off(start);
        popped.reverse();
        drop(items);
        if !popped.is_empty() {
            self.stats.inc_value(keys::LOCAL_DEQUEUED, 1);
        }
        Ok(popped)
    }

    fn clear(&self) -> Result<(), CrawlError> {
        self.items
            .lock()
            .map_err(|_| CrawlError::poisoned("local queue"))?
            .clear();
        Ok(())
    }
}

#[derive(Default)]
struct Delays {
    push: Option<f64>,
    pop: Option<f64>,
}

fn smooth(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(prev) => (prev + sample) / 2.0,
        None => sample,
    }
}

/// FIFO list in the shared store, one key per spider. Every call is a
/// single round trip.
pub struct RemoteQueue {
    store: Arc<dyn SharedStore>,
    key: String,
    stats: CrawlStats,
    delays: Mutex<Delays>,
}

impl RemoteQueue {
    pub fn new(store: Arc<dyn SharedStore>, key: &str, stats: CrawlStats) -> Self {
        Self {
            store,
            key: key.to_string(),
            stats,
            delays: Mutex::new(Delays::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Smoothed round-trip time: the mean of whichever directions have been
    /// measured, one second before any call has completed.
    pub fn delay(&self) -> Duration {
        let delays = match self.delays.lock() {
            Ok(d) => d,
            Err(poisoned) => poisoned.into_inner(),
        };
        let secs = match (delays.push, delays.pop) {
            (Some(a), Some(b)) => (a + b) / 2.0,
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => 1.0,
        };
        Duration::from_secs_f64(secs)
    }

    fn record_delay(&self, started: Instant, push: bool) {
        let sample = started.elapsed().as_secs_f64();
        if let Ok(mut delays) = self.delays.lock() {
            let slot = if push { &mut delays.push } else { &mut delays.pop };
            *slot = Some(smooth(*slot, sample));
        }
    }

    /// Appends `items` in one write. Nothing is sent if any item fails to
    /// encode.
    pub fn push_batch(&self, items: &[WorkItem]) -> Result<usize, CrawlError> {
        if items.is_empty() {
            return Ok(0);
        }
        let encoded = items.iter().map(WorkItem::encode).collect::<Result<Vec<_>, _>>()?;
        let started = Instant::now();
        self.store.push_many(&self.key, encoded)?;
        self.record_delay(started, true);
        self.stats.inc_value(keys::REMOTE_ENQUEUED, 1);
        debug!(key = %self.key, count = items.len(), "pushed to remote queue");
        Ok(items.len())
    }

    /// Removes up to `count` of the oldest items in one round trip. If some
    /// popped entries cannot be decoded, the decodable ones go back to the
    /// list before the error is returned. If that write fails too, they are
    /// returned as a normal result instead.
    pub fn pop_batch(&self, count: usize) -> Result<Vec<WorkItem>, CrawlError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let raw = self.store.pop_many(&self.key, count)?;
        self.record_delay(started, false);
        self.stats.inc_value(keys::REMOTE_DEQUEUED, 1);

        let mut items = Vec::with_capacity(raw.len());
        let mut intact = Vec::with_capacity(raw.len());
        let mut first_error = None;
        for bytes in raw {
            match WorkItem::decode(&bytes) {
                Ok(item) => {
                    items.push(item);
                    intact.push(bytes);
                }
                Err(e) => {
                    error!(key = %self.key, error = %e, "dropping undecodable remote entry");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            let returned = intact.len();
            match self.store.push_many(&self.key, intact) {
                Ok(_) => return Err(e),
                Err(push_err) => {
                    // Off the list and not back on it: the caller owns them now.
                    error!(
                        key = %self.key,
                        count = returned,
                        error = %push_err,
                        "failed to return popped items, handing them to the caller"
                    );
                }
            }
        }
        debug!(key = %self.key, count = items.len(), "popped from remote queue");
        Ok(items)
    }
}

impl QueueLenLike for RemoteQueue {
    fn len(&self) -> Result<usize, CrawlError> {
        self.store.list_len(&self.key)
    }
}

impl WorkQueue for RemoteQueue {
    fn push(&self, items: Vec<WorkItem>) -> Result<(), CrawlError> {
        self.push_batch(&items).map(|_| ())
    }

    fn pop(&self, count: usize) -> Result<Vec<WorkItem>, CrawlError> {
        self.pop_batch(count)
    }

    fn clear(&self) -> Result<(), CrawlError> {
        self.store.delete(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};

    fn item(n: usize) -> WorkItem {
        WorkItem::get(&format!("http://example.com/{}", n))
    }

    #[test]
    fn test_local_queue_is_a_stack() {
        let queue = LocalQueue::new(CrawlStats::new());
        queue.push(vec![item(1), item(2)]).unwrap();
        queue.push(vec![item(3)]).unwrap();
        assert_eq!(queue.len().unwrap(), 3);
        assert_eq!(queue.pop(2).unwrap(), vec![item(3), item(2)]);
        assert_eq!(queue.pop(5).unwrap(), vec![item(1)]);
        assert!(queue.pop(1).unwrap().is_empty());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_remote_queue_is_fifo() {
        let store = Arc::new(MemoryStore::new());
        let stats = CrawlStats::new();
        let queue = RemoteQueue::new(store, "s:requests", stats.clone());
        queue.push(vec![item(1), item(2), item(3)]).unwrap();
        assert_eq!(queue.len().unwrap(), 3);
        assert_eq!(queue.pop(2).unwrap(), vec![item(1), item(2)]);
        assert_eq!(stats.get_value(keys::REMOTE_ENQUEUED), 1, "counted per batch");
        assert_eq!(stats.get_value(keys::REMOTE_DEQUEUED), 1);
    }

    #[test]
    fn test_remote_pop_of_empty_list_is_not_an_error() {
        let queue = RemoteQueue::new(Arc::new(MemoryStore::new()), "s:requests", CrawlStats::new());
        assert!(queue.pop(10).unwrap().is_empty());
    }

    #[test]
    fn test_remote_failure_is_retryable() {
        let store = Arc::new(MemoryStore::new());
        let queue = RemoteQueue::new(store.clone(), "s:requests", CrawlStats::new());
        store.fail_next(StoreOp::Push, 1);
        let err = queue.push(vec![item(1)]).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn test_undecodable_entry_returns_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let queue = RemoteQueue::new(store.clone(), "s:requests", CrawlStats::new());
        queue.push(vec![item(1)]).unwrap();
        store.push_many("s:requests", vec![vec![0xff, 0xff, 0xff]]).unwrap();
        queue.push(vec![item(2)]).unwrap();

        assert!(queue.pop(3).is_err());
        assert_eq!(queue.len().unwrap(), 2, "decodable items go back");
    }

    #[test]
    fn test_undecodable_entry_with_failed_return_hands_items_over() {
        let store = Arc::new(MemoryStore::new());
        let queue = RemoteQueue::new(store.clone(), "s:requests", CrawlStats::new());
        store.push_many("s:requests", vec![vec![0xff, 0xff, 0xff]]).unwrap();
        queue.push(vec![item(1), item(2)]).unwrap();

        store.fail_next(StoreOp::Push, 1);
        assert_eq!(queue.pop(3).unwrap(), vec![item(1), item(2)]);
        assert_eq!(queue.len().unwrap(), 0);
    }

    #[test]
    fn test_empty_local_pop_is_not_counted() {
        let stats = CrawlStats::new();
        let queue = LocalQueue::new(stats.clone());
        assert!(queue.pop(4).unwrap().is_empty());
        assert_eq!(stats.get_value(keys::LOCAL_DEQUEUED), 0);
        queue.push(vec![item(1)]).unwrap();
        queue.pop(4).unwrap();
        assert_eq!(stats.get_value(keys::LOCAL_DEQUEUED), 1);
    }

    #[test]
    fn test_delay_defaults_then_tracks() {
        let queue = RemoteQueue::new(Arc::new(MemoryStore::new()), "s:requests", CrawlStats::new());
        assert_eq!(queue.delay(), Duration::from_secs(1));
        queue.push(vec![item(1)]).unwrap();
        assert!(queue.delay() < Duration::from_secs(1));
    }

    #[test]
    fn test_smooth_is_running_average() {
        assert_eq!(smooth(None, 4.0), 4.0);
        assert_eq!(smooth(Some(4.0), 2.0), 3.0);
    }
}
