use crate::config::CrawlConfig;
use crate::dupefilter::{build_filter, DuplicateFilter};
use crate::item::WorkItem;
use crate::membership::{Coordinator, MembershipTracker, NodeId};
use crate::metrics::{keys, CrawlStats, StatusSnapshot};
use crate::queue::{build_queue, WorkQueue};
use crate::reporter::MetricsReporter;
use crate::store::SharedStore;
use crate::CrawlError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// One worker process: duplicate filter, work queue, membership and
/// reporting wired together around a shared store and a coordination
/// session.
///
/// The host drives the lifecycle with [`CrawlNode::start`] and
/// [`CrawlNode::stop`]; between the two it feeds work through
/// [`CrawlNode::enqueue`] and drains it with [`CrawlNode::next_requests`].
pub struct CrawlNode {
    config: CrawlConfig,
    stats: CrawlStats,
    filter: Mutex<Box<dyn DuplicateFilter>>,
    queue: Arc<dyn WorkQueue>,
    membership: Arc<MembershipTracker>,
    reporter: MetricsReporter,
    duplicate_logged: AtomicBool,
}

impl CrawlNode {
    pub fn new(
        config: CrawlConfig,
        store: Arc<dyn SharedStore>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self, CrawlError> {
        config.validate()?;
        let stats = CrawlStats::new();
        let membership = Arc::new(MembershipTracker::new(coordinator, &config.membership_root));
        let filter = build_filter(&config, Arc::clone(&store), stats.clone_handle())?;
        let queue = build_queue(&config, store, membership.view(), stats.clone_handle())?;
        let reporter = MetricsReporter::new(
            stats.clone_handle(),
            Arc::clone(&queue),
            Arc::clone(&membership),
            config.report_interval,
            config.rate_window,
        )?;
        Ok(Self {
            config,
            stats,
            filter: Mutex::new(filter),
            queue,
            membership,
            reporter,
            duplicate_logged: AtomicBool::new(false),
        })
    }

    pub fn start(&self) -> Result<(), CrawlError> {
        self.membership.start()?;
        self.queue.start()?;
        self.reporter.start()?;
        info!(
            node = %self.membership.node_id(),
            spider = %self.config.spider,
            queue = ?self.config.queue_kind,
            filter = ?self.config.filter_kind,
            "node started"
        );
        Ok(())
    }

    /// Stops the background tasks, drops shared state unless it is meant
    /// to persist, and leaves the fleet. Returns the session throughput.
    pub fn stop(&self) -> Result<Option<f64>, CrawlError> {
        self.queue.stop()?;
        let throughput = self.reporter.stop()?;
        if !self.config.persist {
            self.filter
                .lock()
                .map_err(|_| CrawlError::poisoned("duplicate filter"))?
                .clear()?;
            self.queue.clear()?;
        }
        self.membership.stop()?;
        Ok(throughput)
    }

    /// Ok(false) if the item was filtered as a duplicate. Errors from the
    /// shared store are returned as-is; the caller decides whether to
    /// retry.
    pub fn enqueue(&self, item: WorkItem) -> Result<bool, CrawlError> {
        if !item.dont_filter {
            let seen = self
                .filter
                .lock()
                .map_err(|_| CrawlError::poisoned("duplicate filter"))?
                .request_seen(&item)?;
            if seen {
                self.stats.inc_value(keys::FILTER_FILTERED, 1);
                self.log_duplicate(&item);
                return Ok(false);
            }
        }
        self.queue.push(vec![item])?;
        self.stats.mark_started();
        Ok(true)
    }

    fn log_duplicate(&self, item: &WorkItem) {
        if self.config.debug_dupes {
            debug!(url = %item.url, "filtered duplicate request");
        } else if !self.duplicate_logged.swap(true, Ordering::Relaxed) {
            debug!(
                url = %item.url,
                "filtered duplicate request - no more duplicates will be shown (see debug_dupes)"
            );
        }
    }

    pub fn next_requests(&self, count: usize) -> Result<Vec<WorkItem>, CrawlError> {
        self.queue.pop(count)
    }

    pub fn pending(&self) -> Result<usize, CrawlError> {
        self.queue.len()
    }

    pub fn report_now(&self) -> Result<StatusSnapshot, CrawlError> {
        self.reporter.tick()
    }

    pub fn node_id(&self) -> &NodeId {
        self.membership.node_id()
    }

    pub fn fleet_size(&self) -> usize {
        self.membership.fleet_size()
    }

    /// Handle the engine uses to count pages, items and bytes.
    pub fn stats(&self) -> CrawlStats {
        self.stats.clone_handle()
    }

    pub fn membership(&self) -> &Arc<MembershipTracker> {
        &self.membership
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterKind, QueueKind};
    use crate::membership::MemoryEnsemble;
    use crate::store::MemoryStore;

    fn node(kind: QueueKind, persist: bool) -> (Arc<MemoryStore>, CrawlNode) {
        let store = Arc::new(MemoryStore::new());
        let ensemble = MemoryEnsemble::new();
        let config = CrawlConfig {
            queue_kind: kind,
            filter_kind: FilterKind::Bloom,
            filter_bits: 1 << 20,
            persist,
            ..CrawlConfig::for_spider("node-test")
        };
        let node = CrawlNode::new(config, store.clone(), Arc::new(ensemble.session())).unwrap();
        (store, node)
    }

    #[test]
    fn test_duplicates_are_not_queued() {
        let (_store, node) = node(QueueKind::Local, true);
        assert!(node.enqueue(WorkItem::get("http://a.com/1")).unwrap());
        assert!(!node.enqueue(WorkItem::get("http://a.com/1")).unwrap());
        assert_eq!(node.pending().unwrap(), 1);
        assert_eq!(node.stats().get_value(keys::FILTER_FILTERED), 1);
    }

    #[test]
    fn test_dont_filter_bypasses_the_filter() {
        let (_store, node) = node(QueueKind::Local, true);
        let item = WorkItem::get("http://a.com/1").unfiltered();
        assert!(node.enqueue(item.clone()).unwrap());
        assert!(node.enqueue(item).unwrap());
        assert_eq!(node.pending().unwrap(), 2);
    }

    #[test]
    fn test_enqueue_starts_the_session_clock() {
        let (_store, node) = node(QueueKind::Local, true);
        assert_eq!(node.stats().elapsed(), None);
        node.enqueue(WorkItem::get("http://a.com/1")).unwrap();
        assert!(node.stats().elapsed().is_some());
    }

    #[test]
    fn test_lifecycle_registers_and_leaves() {
        let (_store, node) = node(QueueKind::Adaptive, true);
        node.start().unwrap();
        assert_eq!(node.fleet_size(), 1);
        node.report_now().unwrap();
        node.stop().unwrap();
        assert!(node.report_now().is_err(), "slot is gone after stop");
    }

    #[test]
    fn test_non_persistent_stop_clears_shared_state() {
        let (store, node) = node(QueueKind::Remote, false);
        node.start().unwrap();
        node.enqueue(WorkItem::get("http://a.com/1")).unwrap();
        assert!(store.exists("node-test:requests").unwrap());
        node.stop().unwrap();
        assert!(!store.exists("node-test:requests").unwrap());
        assert!(!store.exists("node-test:dupefilter0").unwrap());
    }
}
