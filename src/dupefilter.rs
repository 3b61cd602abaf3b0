use crate::bloom::{BloomFilter, HashFamily, LocalBloom};
use crate::config::{CrawlConfig, FilterKind};
use crate::item::{Fingerprint, WorkItem};
use crate::metrics::{keys, CrawlStats};
use crate::recency_cache::RecencyCache;
use crate::store::SharedStore;
use crate::CrawlError;
use std::sync::Arc;
use tracing::debug;

pub trait DuplicateFilter: Send {
    /// True if `fp` was recorded before (exactly or probably); false if it
    /// is new and has now been recorded. A store failure is an error,
    /// never an answer.
    fn seen_or_record(&mut self, fp: &Fingerprint) -> Result<bool, CrawlError>;

    fn request_seen(&mut self, item: &WorkItem) -> Result<bool, CrawlError> {
        self.seen_or_record(&item.fingerprint())
    }

    /// Forgets everything, locally and in the shared store.
    fn clear(&mut self) -> Result<(), CrawlError>;

    fn recency_len(&self) -> usize;
}

/// Resolve the configured filter once at startup.
pub fn build_filter(
    config: &CrawlConfig,
    store: Arc<dyn SharedStore>,
    stats: CrawlStats,
) -> Result<Box<dyn DuplicateFilter>, CrawlError> {
    config.validate()?;
    let recency = RecencyCache::new(config.recency_capacity)?;
    Ok(match config.filter_kind {
        FilterKind::Bloom => Box::new(BloomDupeFilter::new(
            recency,
            BloomFilter::from_config(store, config)?,
            stats,
        )),
        FilterKind::Local => Box::new(LocalDupeFilter::new(
            recency,
            LocalBloom::new(HashFamily::from_config(config)?),
            stats,
        )),
    })
}

/// Recency cache in front of the shared bit array.
///
/// A recency hit answers "seen" with no round trip. A miss consults the
/// shared filter and, once it has answered, records the fingerprint in the
/// recency cache whatever the answer was. A failed round trip records
/// nothing, so the retry asks the shared filter again.
pub struct BloomDupeFilter {
    recency: RecencyCache,
    bloom: BloomFilter,
    stats: CrawlStats,
}

impl BloomDupeFilter {
    pub fn new(recency: RecencyCache, bloom: BloomFilter, stats: CrawlStats) -> Self {
        Self {
            recency,
            bloom,
            stats,
        }
    }

    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    pub fn recency(&self) -> &RecencyCache {
        &self.recency
    }
}

impl DuplicateFilter for BloomDupeFilter {
    fn seen_or_record(&mut self, fp: &Fingerprint) -> Result<bool, CrawlError> {
        self.stats.inc_value(keys::FILTER_CHECKS, 1);
        if self.recency.touch(fp) {
            return Ok(true);
        }

        self.stats.inc_value(keys::FILTER_SHARED, 1);
        let seen = self.bloom.insert_and_check(fp)?;
        self.recency.record(fp.clone());
        if seen {
            debug!(fingerprint = %fp, "shared filter reports fingerprint as seen");
        }
        Ok(seen)
    }

    fn clear(&mut self) -> Result<(), CrawlError> {
        self.recency.clear();
        self.bloom.clear()
    }

    fn recency_len(&self) -> usize {
        self.recency.len()
    }
}

/// Same two-level shape over an in-process bit array. Nothing leaves the
/// process, so it never fails.
pub struct LocalDupeFilter {
    recency: RecencyCache,
    bloom: LocalBloom,
    stats: CrawlStats,
}

impl LocalDupeFilter {
    pub fn new(recency: RecencyCache, bloom: LocalBloom, stats: CrawlStats) -> Self {
        Self {
            recency,
            bloom,
            stats,
        }
    }
}

impl DuplicateFilter for LocalDupeFilter {
    fn seen_or_record(&mut self, fp: &Fingerprint) -> Result<bool, CrawlError> {
        self.stats.inc_value(keys::FILTER_CHECKS, 1);
        if self.recency.touch(fp) {
            return Ok(true);
        }
        self.stats.inc_value(keys::FILTER_SHARED, 1);
        let seen = self.bloom.insert_and_check(fp);
        self.recency.record(fp.clone());
        Ok(seen)
    }

    fn clear(&mut self) -> Result<(), CrawlError> {
        self.recency.clear();
        self.bloom.clear();
        Ok(())
    }

    fn recency_len(&self) -> usize {
        self.recency.len()
    }
}
