use crate::CrawlError;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Mutex;

/// The shared key-value/queue store every node talks to.
///
/// Each call is one round trip. Batched variants exist so that a whole
/// filter probe or queue transfer costs a single network hop.
pub trait SharedStore: Send + Sync {
    /// Sets every offset in the bit array at `key` and returns the value
    /// each bit held before, in the order given.
    fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, CrawlError>;
    fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, CrawlError>;
    /// Appends to the tail of the list at `key`; returns the new length.
    fn push_many(&self, key: &str, values: Vec<Vec<u8>>) -> Result<usize, CrawlError>;
    /// Removes up to `count` values from the head of the list at `key`.
    fn pop_many(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, CrawlError>;
    fn list_len(&self, key: &str) -> Result<usize, CrawlError>;
    fn delete(&self, key: &str) -> Result<(), CrawlError>;
    fn exists(&self, key: &str) -> Result<bool, CrawlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    SetBits,
    GetBits,
    Push,
    Pop,
    Len,
    Delete,
    Exists,
}

#[derive(Default)]
struct MemoryInner {
    bits: FxHashMap<String, FxHashSet<u64>>,
    lists: FxHashMap<String, VecDeque<Vec<u8>>>,
    failures: FxHashMap<StoreOp, usize>,
    offline: bool,
    round_trips: usize,
}

/// In-process store shared by every simulated node. Bit arrays are sparse
/// so a full-width filter costs only the bits actually set.
///
/// Failures can be injected per operation to exercise the compensating
/// paths without a real network.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` calls of `op` fail with a retryable error.
    pub fn fail_next(&self, op: StoreOp, times: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.failures.entry(op).or_insert(0) += times;
        }
    }

    /// While offline every call fails.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.offline = offline;
        }
    }

    /// Number of calls that reached the store, failed or not.
    pub fn round_trips(&self) -> usize {
        self.inner.lock().map(|inner| inner.round_trips).unwrap_or(0)
    }

    pub fn bits_set(&self, key: &str) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.bits.get(key).map(|b| b.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn begin(&self, op: StoreOp) -> Result<std::sync::MutexGuard<'_, MemoryInner>, CrawlError> {
        let mut inner = self.inner.lock().map_err(|_| CrawlError::poisoned("memory store"))?;
        inner.round_trips += 1;
        if inner.offline {
            return Err(CrawlError::Store("store unavailable".to_string()));
        }
        if let Some(remaining) = inner.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CrawlError::Store(format!("injected {:?} failure", op)));
            }
        }
        Ok(inner)
    }
}

impl SharedStore for MemoryStore {
    fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, CrawlError> {
        let mut inner = self.begin(StoreOp::SetBits)?;
        let bits = inner.bits.entry(key.to_string()).or_default();
        Ok(offsets.iter().map(|&offset| !bits.insert(offset)).collect())
    }

    fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, CrawlError> {
        let inner = self.begin(StoreOp::GetBits)?;
        Ok(match inner.bits.get(key) {
            Some(bits) => offsets.iter().map(|offset| bits.contains(offset)).collect(),
            None => vec![false; offsets.len()],
        })
    }

    fn push_many(&self, key: &str, values: Vec<Vec<u8>>) -> Result<usize, CrawlError> {
        let mut inner = self.begin(StoreOp::Push)?;
        let list = inner.lists.entry(key.to_string()).or_default();
        list.extend(values);
        Ok(list.len())
    }

    fn pop_many(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, CrawlError> {
        let mut inner = self.begin(StoreOp::Pop)?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = count.min(list.len());
        let popped: Vec<Vec<u8>> = list.drain(..take).collect();
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(popped)
    }

    fn list_len(&self, key: &str) -> Result<usize, CrawlError> {
        let inner = self.begin(StoreOp::Len)?;
        Ok(inner.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    fn delete(&self, key: &str) -> Result<(), CrawlError> {
        let mut inner = self.begin(StoreOp::Delete)?;
        inner.bits.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, CrawlError> {
        let inner = self.begin(StoreOp::Exists)?;
        Ok(inner.bits.get(key).map(|b| !b.is_empty()).unwrap_or(false)
            || inner.lists.contains_key(key))
    }
}
