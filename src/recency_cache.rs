use crate::item::Fingerprint;
use crate::CrawlError;
use lru::LruCache;
use std::num::NonZeroUsize;

/// Bounded presence cache with least-recently-touched eviction. Answers
/// "seen very recently" without a round trip to the shared filter.
pub struct RecencyCache {
    cache: LruCache<Fingerprint, ()>,
}

impl RecencyCache {
    pub fn new(capacity: usize) -> Result<Self, CrawlError> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| CrawlError::Config("recency cache capacity must be at least 1".into()))?;
        Ok(Self {
            cache: LruCache::new(capacity),
        })
    }

    /// True and refreshed if present; false otherwise. Never inserts.
    pub fn touch(&mut self, fp: &Fingerprint) -> bool {
        self.cache.get(fp).is_some()
    }

    /// Records `fp` as most recently touched, evicting the oldest entry
    /// when full. Returns whether it was already present.
    pub fn record(&mut self, fp: Fingerprint) -> bool {
        self.cache.put(fp, ()).is_some()
    }

    /// Touch-or-record in one step.
    pub fn check_and_record(&mut self, fp: &Fingerprint) -> bool {
        if self.touch(fp) {
            return true;
        }
        self.record(fp.clone());
        false
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.cache.contains(fp)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(hex: &str) -> Fingerprint {
        Fingerprint::from_hex(hex).unwrap()
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(RecencyCache::new(0), Err(CrawlError::Config(_))));
    }

    #[test]
    fn test_refreshed_entry_survives_eviction() {
        let mut cache = RecencyCache::new(2).unwrap();
        let (a, b, c) = (fp("aa"), fp("bb"), fp("cc"));

        let results: Vec<bool> = [&a, &b, &a, &c]
            .iter()
            .map(|f| cache.check_and_record(f))
            .collect();

        assert_eq!(results, vec![false, false, true, false]);
        assert!(cache.contains(&a));
        assert!(cache.contains(&c));
        assert!(!cache.contains(&b), "b was least recently touched");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut cache = RecencyCache::new(16).unwrap();
        for i in 0..500u32 {
            cache.check_and_record(&fp(&format!("{:04x}", i % 97)));
            assert!(cache.len() <= cache.capacity());
        }
    }

    #[test]
    fn test_touch_does_not_insert() {
        let mut cache = RecencyCache::new(4).unwrap();
        assert!(!cache.touch(&fp("ab")));
        assert!(cache.is_empty());
    }
}
