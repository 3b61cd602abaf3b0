use crate::CrawlError;
use std::time::Duration;

pub const DEFAULT_SEEDS: [u64; 7] = [5, 7, 11, 13, 31, 37, 61];

/// Bit-array size used when a node switches to [`FilterKind::Local`]. The
/// shared default of 2^31 bits would allocate 256 MiB in every process.
pub const LOCAL_FILTER_BITS: u64 = 1 << 24;

/// Which work queue the node schedules through. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Node-local stack only; nothing is shared with the fleet.
    Local,
    /// Shared FIFO only; every push and pop is a round trip.
    Remote,
    /// Local stack plus shared FIFO with a background rebalancer.
    Adaptive,
}

/// Which duplicate filter guards the queue. Resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Recency cache in front of the shared bit array.
    Bloom,
    /// Recency cache in front of an in-process bit array of `filter_bits`
    /// bits, allocated up front. See [`CrawlConfig::with_filter_kind`].
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashScheme {
    Xxh3,
    /// `ret += seed * ret + byte`, bit-compatible with filters written by
    /// older fleet members.
    Polynomial,
}

impl std::str::FromStr for QueueKind {
    type Err = CrawlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(QueueKind::Local),
            "remote" => Ok(QueueKind::Remote),
            "adaptive" => Ok(QueueKind::Adaptive),
            other => Err(CrawlError::Config(format!("unknown queue kind '{}'", other))),
        }
    }
}

impl std::str::FromStr for FilterKind {
    type Err = CrawlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bloom" => Ok(FilterKind::Bloom),
            "local" => Ok(FilterKind::Local),
            other => Err(CrawlError::Config(format!("unknown filter kind '{}'", other))),
        }
    }
}

impl std::str::FromStr for HashScheme {
    type Err = CrawlError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xxh3" => Ok(HashScheme::Xxh3),
            "polynomial" => Ok(HashScheme::Polynomial),
            other => Err(CrawlError::Config(format!("unknown hash scheme '{}'", other))),
        }
    }
}

/// Every tunable of a crawl node, with the documented defaults.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub spider: String,
    /// `{spider}` is replaced with the spider name.
    pub queue_key: String,
    /// `{spider}` is replaced with the spider name; the shard index is appended.
    pub dupefilter_key: String,
    pub queue_kind: QueueKind,
    pub filter_kind: FilterKind,
    pub rate_window: usize,
    pub rebalance_interval: Duration,
    pub transfer_cap: f64,
    pub concurrent_requests: usize,
    /// Scale the remote throughput term by `(fleet_size - 1)`. A heuristic,
    /// not a law; switch off to compare.
    pub fleet_scaling: bool,
    pub report_interval: Duration,
    pub filter_bits: u64,
    pub filter_seeds: Vec<u64>,
    pub filter_shards: u32,
    pub hash_scheme: HashScheme,
    pub recency_capacity: usize,
    pub membership_root: String,
    pub persist: bool,
    pub debug_dupes: bool,
    pub store_url: String,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            spider: "default".to_string(),
            queue_key: "{spider}:requests".to_string(),
            dupefilter_key: "{spider}:dupefilter".to_string(),
            queue_kind: QueueKind::Adaptive,
            filter_kind: FilterKind::Bloom,
            rate_window: 20,
            rebalance_interval: Duration::from_secs(2),
            transfer_cap: 200.0,
            concurrent_requests: 16,
            fleet_scaling: true,
            report_interval: Duration::from_secs(1),
            filter_bits: 1 << 31,
            filter_seeds: DEFAULT_SEEDS.to_vec(),
            filter_shards: 1,
            hash_scheme: HashScheme::Xxh3,
            recency_capacity: 1000,
            membership_root: "/node/host".to_string(),
            persist: true,
            debug_dupes: false,
            store_url: "redis://127.0.0.1/".to_string(),
        }
    }
}

impl CrawlConfig {
    pub fn for_spider(spider: &str) -> Self {
        Self {
            spider: spider.to_string(),
            ..Self::default()
        }
    }

    /// Switches the filter kind. Moving to [`FilterKind::Local`] also shrinks
    /// `filter_bits` to [`LOCAL_FILTER_BITS`]; an explicit size set afterwards
    /// still wins.
    pub fn with_filter_kind(self, kind: FilterKind) -> Self {
        let filter_bits = match kind {
            FilterKind::Local => self.filter_bits.min(LOCAL_FILTER_BITS),
            FilterKind::Bloom => self.filter_bits,
        };
        Self {
            filter_kind: kind,
            filter_bits,
            ..self
        }
    }

    /// Defaults overlaid with `CRAWL_*` environment variables.
    pub fn from_env() -> Result<Self, CrawlError> {
        let mut config = Self::default();

        if let Some(spider) = env_string("CRAWL_SPIDER") {
            config.spider = spider;
        }
        if let Some(key) = env_string("CRAWL_QUEUE_KEY") {
            config.queue_key = key;
        }
        if let Some(key) = env_string("CRAWL_DUPEFILTER_KEY") {
            config.dupefilter_key = key;
        }
        if let Some(kind) = env_string("CRAWL_QUEUE_KIND") {
            config.queue_kind = kind.parse()?;
        }
        if let Some(kind) = env_string("CRAWL_FILTER_KIND") {
            config = config.with_filter_kind(kind.parse()?);
        }
        if let Some(scheme) = env_string("CRAWL_HASH_SCHEME") {
            config.hash_scheme = scheme.parse()?;
        }
        if let Some(window) = env_parse("CRAWL_RATE_WINDOW")? {
            config.rate_window = window;
        }
        if let Some(ms) = env_parse::<u64>("CRAWL_REBALANCE_INTERVAL_MS")? {
            config.rebalance_interval = Duration::from_millis(ms);
        }
        if let Some(cap) = env_parse("CRAWL_TRANSFER_CAP")? {
            config.transfer_cap = cap;
        }
        if let Some(limit) = env_parse("CRAWL_CONCURRENT_REQUESTS")? {
            config.concurrent_requests = limit;
        }
        if let Some(scaling) = env_parse("CRAWL_FLEET_SCALING")? {
            config.fleet_scaling = scaling;
        }
        if let Some(ms) = env_parse::<u64>("CRAWL_REPORT_INTERVAL_MS")? {
            config.report_interval = Duration::from_millis(ms);
        }
        if let Some(bits) = env_parse("CRAWL_FILTER_BITS")? {
            config.filter_bits = bits;
        }
        if let Some(seeds) = env_string("CRAWL_FILTER_SEEDS") {
            config.filter_seeds = seeds
                .split(',')
                .map(|s| {
                    s.trim()
                        .parse::<u64>()
                        .map_err(|e| CrawlError::Config(format!("CRAWL_FILTER_SEEDS: {}", e)))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(shards) = env_parse("CRAWL_FILTER_SHARDS")? {
            config.filter_shards = shards;
        }
        if let Some(capacity) = env_parse("CRAWL_RECENCY_CAPACITY")? {
            config.recency_capacity = capacity;
        }
        if let Some(root) = env_string("CRAWL_MEMBERSHIP_ROOT") {
            config.membership_root = root;
        }
        if let Some(persist) = env_parse("CRAWL_PERSIST")? {
            config.persist = persist;
        }
        if let Some(debug) = env_parse("CRAWL_DEBUG_DUPES")? {
            config.debug_dupes = debug;
        }
        if let Some(url) = env_string("CRAWL_STORE_URL") {
            config.store_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.spider.is_empty() {
            return Err(CrawlError::Config("spider name must not be empty".into()));
        }
        if self.rate_window == 0 {
            return Err(CrawlError::Config("rate_window must be at least 1".into()));
        }
        if self.recency_capacity == 0 {
            return Err(CrawlError::Config("recency_capacity must be at least 1".into()));
        }
        if self.concurrent_requests == 0 {
            return Err(CrawlError::Config("concurrent_requests must be at least 1".into()));
        }
        if !(self.transfer_cap > 0.0) {
            return Err(CrawlError::Config("transfer_cap must be positive".into()));
        }
        if self.filter_seeds.is_empty() {
            return Err(CrawlError::Config("at least one filter seed is required".into()));
        }
        if self.filter_shards == 0 {
            return Err(CrawlError::Config("filter_shards must be at least 1".into()));
        }
        if !self.filter_bits.is_power_of_two() || self.filter_bits < 8 {
            return Err(CrawlError::Config(format!(
                "filter_bits must be a power of two >= 8, got {}",
                self.filter_bits
            )));
        }
        if self.rebalance_interval.is_zero() || self.report_interval.is_zero() {
            return Err(CrawlError::Config("task intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn queue_key(&self) -> String {
        self.queue_key.replace("{spider}", &self.spider)
    }

    pub fn dupefilter_key(&self) -> String {
        self.dupefilter_key.replace("{spider}", &self.spider)
    }
}

fn env_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, CrawlError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CrawlError::Config(format!("{}: {}", name, e))),
        None => Ok(None),
    }
}
