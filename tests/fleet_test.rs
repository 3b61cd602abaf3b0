use crawlfleet::config::{CrawlConfig, FilterKind, QueueKind};
use crawlfleet::item::WorkItem;
use crawlfleet::membership::MemoryEnsemble;
use crawlfleet::metrics::keys;
use crawlfleet::node::CrawlNode;
use crawlfleet::store::{MemoryStore, SharedStore};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn fleet_config() -> CrawlConfig {
    CrawlConfig {
        queue_kind: QueueKind::Adaptive,
        filter_kind: FilterKind::Bloom,
        filter_bits: 1 << 20,
        rebalance_interval: Duration::from_millis(20),
        report_interval: Duration::from_millis(20),
        ..CrawlConfig::for_spider("fleet")
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn test_work_seeded_on_one_node_reaches_its_peer() {
    let store = Arc::new(MemoryStore::new());
    let ensemble = MemoryEnsemble::new();
    let busy = CrawlNode::new(fleet_config(), store.clone(), Arc::new(ensemble.session())).unwrap();
    let idle = CrawlNode::new(fleet_config(), store.clone(), Arc::new(ensemble.session())).unwrap();
    busy.start().unwrap();
    idle.start().unwrap();
    assert_eq!(busy.fleet_size(), 2);

    for n in 0..300 {
        assert!(busy.enqueue(WorkItem::get(&format!("http://site.local/{}", n))).unwrap());
    }
    // The busy node drains one page per tick.
    busy.stats().set_gauge(keys::TPS_PAGE, 1.0);

    assert!(
        wait_until(Duration::from_secs(5), || idle.pending().unwrap() > 0),
        "idle node never received work"
    );

    assert!(
        !idle.enqueue(WorkItem::get("http://site.local/0")).unwrap(),
        "peer filters what the seeding node already saw"
    );

    busy.stop().unwrap();
    idle.stop().unwrap();
    let total = busy.pending().unwrap() + idle.pending().unwrap() + store.list_len("fleet:requests").unwrap();
    assert_eq!(total, 300, "rebalancing neither loses nor duplicates work");
}

#[test]
fn test_every_node_publishes_status() {
    let store = Arc::new(MemoryStore::new());
    let ensemble = MemoryEnsemble::new();
    let nodes: Vec<CrawlNode> = (0..3)
        .map(|_| CrawlNode::new(fleet_config(), store.clone(), Arc::new(ensemble.session())).unwrap())
        .collect();
    for node in &nodes {
        node.start().unwrap();
    }
    nodes[1].stats().inc_value(keys::PAGES, 42);

    assert!(wait_until(Duration::from_secs(5), || {
        nodes[0]
            .membership()
            .fleet_status()
            .map(|fleet| fleet.iter().all(|(_, status)| status.is_some()))
            .unwrap_or(false)
    }));
    let fleet = nodes[0].membership().fleet_status().unwrap();
    assert_eq!(fleet.len(), 3);
    let reported = nodes[0]
        .membership()
        .read_status(nodes[1].node_id())
        .unwrap()
        .unwrap();
    assert_eq!(reported.count_pages, 42);

    for node in &nodes {
        node.stop().unwrap();
    }
    assert!(nodes[0].membership().fleet_status().unwrap().is_empty());
}
