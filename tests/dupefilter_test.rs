use crawlfleet::bloom::{BloomFilter, HashFamily, LocalBloom};
use crawlfleet::config::{CrawlConfig, FilterKind, HashScheme, DEFAULT_SEEDS};
use crawlfleet::dupefilter::{build_filter, BloomDupeFilter, DuplicateFilter};
use crawlfleet::item::{Fingerprint, WorkItem};
use crawlfleet::metrics::CrawlStats;
use crawlfleet::recency_cache::RecencyCache;
use crawlfleet::store::{MemoryStore, StoreOp};
use std::sync::Arc;

fn fp(prefix: &str, n: usize) -> Fingerprint {
    WorkItem::get(&format!("http://{}.example.com/item/{}", prefix, n)).fingerprint()
}

fn config(recency: usize, bits: u64) -> CrawlConfig {
    CrawlConfig {
        filter_kind: FilterKind::Bloom,
        recency_capacity: recency,
        filter_bits: bits,
        ..CrawlConfig::for_spider("dupe-test")
    }
}

#[test]
fn test_first_check_new_second_seen() {
    let store = Arc::new(MemoryStore::new());
    let mut filter = build_filter(&config(100, 1 << 20), store, CrawlStats::new()).unwrap();
    for n in 0..200 {
        let f = fp("a", n);
        assert_eq!(
            (filter.seen_or_record(&f).unwrap(), filter.seen_or_record(&f).unwrap()),
            (false, true),
            "fingerprint {}",
            n
        );
    }
}

#[test]
fn test_recency_cache_stays_bounded() {
    let store = Arc::new(MemoryStore::new());
    let mut filter = build_filter(&config(16, 1 << 20), store, CrawlStats::new()).unwrap();
    for n in 0..500 {
        filter.seen_or_record(&fp("b", n)).unwrap();
        assert!(filter.recency_len() <= 16);
    }
    assert_eq!(filter.recency_len(), 16);
}

#[test]
fn test_recency_eviction_order() {
    let mut cache = RecencyCache::new(2).unwrap();
    let (a, b, c) = (fp("x", 1), fp("x", 2), fp("x", 3));
    let results: Vec<bool> = [&a, &b, &a, &c].iter().map(|f| cache.check_and_record(f)).collect();
    assert_eq!(results, vec![false, false, true, false]);
    assert!(cache.contains(&a));
    assert!(cache.contains(&c));
    assert!(!cache.contains(&b));
}

#[test]
fn test_filters_share_state_through_the_store() {
    let store = Arc::new(MemoryStore::new());
    let cfg = config(100, 1 << 20);
    let mut node_a = build_filter(&cfg, store.clone(), CrawlStats::new()).unwrap();
    let mut node_b = build_filter(&cfg, store, CrawlStats::new()).unwrap();

    assert!(!node_a.seen_or_record(&fp("c", 1)).unwrap());
    assert!(node_b.seen_or_record(&fp("c", 1)).unwrap(), "peer sees the same bits");
}

#[test]
fn test_no_false_negatives() {
    let store = Arc::new(MemoryStore::new());
    let family = HashFamily::new(1 << 16, &DEFAULT_SEEDS, HashScheme::Xxh3).unwrap();
    let bloom = BloomFilter::new(store, "nofn", 1, family).unwrap();
    let inserted: Vec<Fingerprint> = (0..3000).map(|n| fp("d", n)).collect();
    for f in &inserted {
        bloom.insert_and_check(f).unwrap();
    }
    for f in &inserted {
        assert!(bloom.insert_and_check(f).unwrap(), "inserted fingerprint reported new");
    }
}

fn measured_false_positive_rate(scheme: HashScheme, bits: u64) -> (f64, f64) {
    let family = HashFamily::new(bits, &DEFAULT_SEEDS, scheme).unwrap();
    let n = family.capacity() * 9 / 10;
    let expected = family.expected_false_positive_rate(n);
    let store = Arc::new(MemoryStore::new());
    let bloom = BloomFilter::new(store, "fpr", 1, family).unwrap();

    for i in 0..n as usize {
        bloom.insert_and_check(&fp("in", i)).unwrap();
    }
    let probes = 20_000;
    let false_positives = (0..probes)
        .filter(|&i| bloom.contains(&fp("out", i)).unwrap())
        .count();
    (false_positives as f64 / probes as f64, expected)
}

#[test]
fn test_false_positive_rate_within_twice_theory() {
    let (measured, expected) = measured_false_positive_rate(HashScheme::Xxh3, 1 << 18);
    assert!(
        measured <= 2.0 * expected,
        "measured {} exceeds 2x the bound {}",
        measured,
        expected
    );
}

#[test]
fn test_local_reference_filter_agrees_on_membership() {
    let family = HashFamily::new(1 << 18, &DEFAULT_SEEDS, HashScheme::Xxh3).unwrap();
    let mut local = LocalBloom::new(family.clone());
    let store = Arc::new(MemoryStore::new());
    let shared = BloomFilter::new(store, "agree", 1, family).unwrap();
    for n in 0..1000 {
        let f = fp("e", n);
        assert_eq!(local.insert_and_check(&f), shared.insert_and_check(&f).unwrap());
    }
    assert!(local.ones() > 0);
}

#[test]
fn test_unavailable_store_is_an_error_not_an_answer() {
    let store = Arc::new(MemoryStore::new());
    let mut filter = build_filter(&config(100, 1 << 20), store.clone(), CrawlStats::new()).unwrap();
    filter.seen_or_record(&fp("f", 1)).unwrap();

    store.set_offline(true);
    assert!(filter.seen_or_record(&fp("f", 1)).unwrap(), "recency hit needs no store");
    let err = filter.seen_or_record(&fp("f", 2)).unwrap_err();
    assert!(err.is_retryable());

    store.set_offline(false);
    assert!(!filter.seen_or_record(&fp("f", 2)).unwrap());
}

#[test]
fn test_failed_round_trips_are_retried_from_scratch() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(StoreOp::SetBits, 2);
    let recency = RecencyCache::new(4).unwrap();
    let family = HashFamily::new(1 << 12, &DEFAULT_SEEDS, HashScheme::Polynomial).unwrap();
    let bloom = BloomFilter::new(store, "partial", 1, family).unwrap();
    let mut filter = BloomDupeFilter::new(recency, bloom, CrawlStats::new());
    assert!(filter.seen_or_record(&fp("g", 1)).is_err());
    assert!(filter.seen_or_record(&fp("g", 1)).is_err());
    assert!(!filter.seen_or_record(&fp("g", 1)).unwrap());
}

#[test]
fn test_sharded_filter_spreads_keys() {
    let store = Arc::new(MemoryStore::new());
    let cfg = CrawlConfig {
        filter_shards: 4,
        ..config(1, 1 << 16)
    };
    let mut filter = build_filter(&cfg, store.clone(), CrawlStats::new()).unwrap();
    for n in 0..400 {
        filter.seen_or_record(&fp("h", n)).unwrap();
    }
    for shard in 0..4 {
        assert!(store.bits_set(&format!("dupe-test:dupefilter{}", shard)) > 0, "shard {} unused", shard);
    }
}
