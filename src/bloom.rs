use crate::config::{CrawlConfig, HashScheme};
use crate::item::Fingerprint;
use crate::store::SharedStore;
use crate::CrawlError;
use fixedbitset::FixedBitSet;
use smallvec::SmallVec;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub type Positions = SmallVec<[u64; 8]>;

/// One member of the seeded hash family, masked to a power-of-two width.
#[derive(Debug, Clone, Copy)]
pub struct SeededHash {
    mask: u64,
    seed: u64,
    scheme: HashScheme,
}

impl SeededHash {
    pub fn new(bits: u64, seed: u64, scheme: HashScheme) -> Self {
        Self {
            mask: bits - 1,
            seed,
            scheme,
        }
    }

    pub fn hash(&self, value: &[u8]) -> u64 {
        let raw = match self.scheme {
            HashScheme::Xxh3 => xxh3_64_with_seed(value, self.seed),
            HashScheme::Polynomial => value.iter().fold(0u64, |ret, &byte| {
                ret.wrapping_add(self.seed.wrapping_mul(ret)).wrapping_add(byte as u64)
            }),
        };
        raw & self.mask
    }
}

/// k seeded hashes over an m-bit array.
#[derive(Debug, Clone)]
pub struct HashFamily {
    bits: u64,
    hashes: Vec<SeededHash>,
}

impl HashFamily {
    pub fn new(bits: u64, seeds: &[u64], scheme: HashScheme) -> Result<Self, CrawlError> {
        if !bits.is_power_of_two() {
            return Err(CrawlError::Config(format!("filter width {} is not a power of two", bits)));
        }
        if seeds.is_empty() {
            return Err(CrawlError::Config("hash family needs at least one seed".into()));
        }
        Ok(Self {
            bits,
            hashes: seeds.iter().map(|&seed| SeededHash::new(bits, seed, scheme)).collect(),
        })
    }

    pub fn from_config(config: &CrawlConfig) -> Result<Self, CrawlError> {
        Self::new(config.filter_bits, &config.filter_seeds, config.hash_scheme)
    }

    pub fn positions(&self, fp: &Fingerprint) -> Positions {
        self.hashes.iter().map(|h| h.hash(fp.as_bytes())).collect()
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn k(&self) -> usize {
        self.hashes.len()
    }

    /// `(1 - e^{-kn/m})^k` after `inserted` distinct insertions.
    pub fn expected_false_positive_rate(&self, inserted: u64) -> f64 {
        let k = self.k() as f64;
        let exponent = -k * inserted as f64 / self.bits as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    /// Insertions at which k is optimal for this width: `m ln 2 / k`.
    pub fn capacity(&self) -> u64 {
        (self.bits as f64 * std::f64::consts::LN_2 / self.k() as f64) as u64
    }
}

/// The shared filter. Bits live in the store, split across shard keys
/// chosen from the fingerprint prefix so that no single value outgrows
/// the store's size limit. Bits are only ever set, never cleared, except
/// by [`BloomFilter::clear`].
pub struct BloomFilter {
    store: Arc<dyn SharedStore>,
    key: String,
    shards: u32,
    family: HashFamily,
}

impl BloomFilter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        key: &str,
        shards: u32,
        family: HashFamily,
    ) -> Result<Self, CrawlError> {
        if shards == 0 {
            return Err(CrawlError::Config("bloom filter needs at least one shard".into()));
        }
        Ok(Self {
            store,
            key: key.to_string(),
            shards,
            family,
        })
    }

    pub fn from_config(store: Arc<dyn SharedStore>, config: &CrawlConfig) -> Result<Self, CrawlError> {
        Self::new(
            store,
            &config.dupefilter_key(),
            config.filter_shards,
            HashFamily::from_config(config)?,
        )
    }

    pub fn shard_key(&self, fp: &Fingerprint) -> String {
        format!("{}{}", self.key, fp.prefix() % self.shards)
    }

    pub fn shard_keys(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.shards).map(move |i| format!("{}{}", self.key, i))
    }

    /// Sets all k bits in one round trip and reports whether every one of
    /// them was already set, i.e. whether `fp` was (probably) seen before.
    pub fn insert_and_check(&self, fp: &Fingerprint) -> Result<bool, CrawlError> {
        let positions = self.family.positions(fp);
        let previous = self.store.set_bits(&self.shard_key(fp), &positions)?;
        if previous.len() != positions.len() {
            return Err(CrawlError::Store(format!(
                "expected {} bit replies, got {}",
                positions.len(),
                previous.len()
            )));
        }
        Ok(previous.iter().all(|&bit| bit))
    }

    /// Read-only probe; records nothing.
    pub fn contains(&self, fp: &Fingerprint) -> Result<bool, CrawlError> {
        let positions = self.family.positions(fp);
        let bits = self.store.get_bits(&self.shard_key(fp), &positions)?;
        Ok(!bits.is_empty() && bits.iter().all(|&bit| bit))
    }

    pub fn clear(&self) -> Result<(), CrawlError> {
        for key in self.shard_keys() {
            self.store.delete(&key)?;
        }
        Ok(())
    }

    pub fn family(&self) -> &HashFamily {
        &self.family
    }
}

/// In-process filter over the same hash family: check, then insert, with
/// no batching. The reference implementation for exercising the hash
/// scheme in isolation, and the backing array of single-node runs.
pub struct LocalBloom {
    bits: FixedBitSet,
    family: HashFamily,
}

impl LocalBloom {
    pub fn new(family: HashFamily) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(family.bits() as usize),
            family,
        }
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.family
            .positions(fp)
            .iter()
            .all(|&p| self.bits.contains(p as usize))
    }

    pub fn insert(&mut self, fp: &Fingerprint) {
        for p in self.family.positions(fp) {
            self.bits.insert(p as usize);
        }
    }

    /// Same contract as [`BloomFilter::insert_and_check`].
    pub fn insert_and_check(&mut self, fp: &Fingerprint) -> bool {
        if self.contains(fp) {
            return true;
        }
        self.insert(fp);
        false
    }

    pub fn ones(&self) -> usize {
        self.bits.count_ones(..)
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn family(&self) -> &HashFamily {
        &self.family
    }
}
