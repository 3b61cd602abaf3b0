use clap::Parser;
use crawlfleet::config::{CrawlConfig, FilterKind, QueueKind};
use crawlfleet::item::WorkItem;
use crawlfleet::membership::MemoryEnsemble;
use crawlfleet::metrics::keys;
use crawlfleet::node::CrawlNode;
use crawlfleet::store::MemoryStore;
use crawlfleet::CrawlError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Runs several crawl nodes in one process against an in-memory store and
/// coordination service. Work is seeded on the first node only; the
/// rebalancers spread it across the fleet.
#[derive(Parser, Debug)]
#[command(name = "fleet_sim")]
struct Args {
    #[arg(long, default_value_t = 3)]
    nodes: usize,
    /// Size of the synthetic site.
    #[arg(long, default_value_t = 2000)]
    pages: u64,
    /// Outgoing links per page.
    #[arg(long, default_value_t = 3)]
    links: u64,
    #[arg(long, default_value_t = 2)]
    fetch_ms: u64,
    #[arg(long, default_value_t = 15)]
    seconds: u64,
    #[arg(long, default_value_t = 500)]
    rebalance_ms: u64,
    #[arg(long, default_value_t = 250)]
    report_ms: u64,
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
    #[arg(long, default_value = "sim")]
    spider: String,
}

fn page_url(id: u64) -> String {
    format!("http://sim.local/page/{}", id)
}

fn page_id(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.parse().ok()
}

/// Children of a page in a `links`-ary tree, plus a link back to the
/// parent so the duplicate filter has something to do.
fn outlinks(id: u64, links: u64, pages: u64) -> Vec<WorkItem> {
    let mut out: Vec<WorkItem> = (1..=links)
        .map(|i| id * links + i)
        .filter(|&child| child < pages)
        .map(|child| WorkItem::get(&page_url(child)))
        .collect();
    if id > 0 {
        out.push(WorkItem::get(&page_url((id - 1) / links)));
    }
    out
}

fn run_engine(node: Arc<CrawlNode>, args: Arc<Args>, deadline: Instant) {
    let stats = node.stats();
    while Instant::now() < deadline {
        let batch = match node.next_requests(args.concurrency) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "pop failed");
                thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        if batch.is_empty() {
            thread::sleep(Duration::from_millis(20));
            continue;
        }
        for item in batch {
            thread::sleep(Duration::from_millis(args.fetch_ms));
            stats.inc_value(keys::PAGES, 1);
            stats.inc_value(keys::ITEMS, 1);
            stats.inc_value(keys::REQUEST_BYTES, 256);
            stats.inc_value(keys::RESPONSE_BYTES, 8 * 1024);

            let Some(id) = page_id(&item.url) else {
                continue;
            };
            for link in outlinks(id, args.links, args.pages) {
                if let Err(e) = node.enqueue(link) {
                    warn!(error = %e, "enqueue failed, dropping link");
                }
            }
        }
    }
}

fn main() -> Result<(), CrawlError> {
    crawlfleet::init_tracing("fleet_sim");
    let args = Arc::new(Args::parse());

    let store = Arc::new(MemoryStore::new());
    let ensemble = MemoryEnsemble::new();
    let config = CrawlConfig {
        queue_kind: QueueKind::Adaptive,
        filter_kind: FilterKind::Bloom,
        filter_bits: 1 << 24,
        concurrent_requests: args.concurrency,
        rebalance_interval: Duration::from_millis(args.rebalance_ms),
        report_interval: Duration::from_millis(args.report_ms),
        ..CrawlConfig::for_spider(&args.spider)
    };

    let mut nodes = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes.max(1) {
        let node = Arc::new(CrawlNode::new(config.clone(), store.clone(), Arc::new(ensemble.session()))?);
        node.start()?;
        nodes.push(node);
    }
    info!(nodes = nodes.len(), "fleet started");

    nodes[0].enqueue(WorkItem::get(&page_url(0)))?;

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let engines: Vec<_> = nodes
        .iter()
        .map(|node| {
            let node = Arc::clone(node);
            let args = Arc::clone(&args);
            thread::spawn(move || run_engine(node, args, deadline))
        })
        .collect();
    for engine in engines {
        if engine.join().is_err() {
            warn!("engine thread panicked");
        }
    }

    for node in &nodes {
        node.report_now()?;
    }
    let fleet = nodes[0].membership().fleet_status()?;

    println!(
        "{:<38} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9}",
        "node", "pages", "items", "tps_page", "localload", "opt_filt", "opt_queue"
    );
    for (node_id, status) in fleet {
        let status = status.unwrap_or_default();
        println!(
            "{:<38} {:>8} {:>8} {:>9.2} {:>9.2} {:>9.3} {:>9.3}",
            node_id.as_str(),
            status.count_pages,
            status.count_items,
            status.tps_page,
            status.localload,
            status.optimize_filter,
            status.optimize_queue
        );
    }

    for node in &nodes {
        if let Some(tps) = node.stop()? {
            println!("{} session throughput: {:.2} pages/s", node.node_id(), tps);
        }
    }
    Ok(())
}
