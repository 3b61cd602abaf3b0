pub mod adaptive_queue;
pub mod bloom;
pub mod config;
pub mod dupefilter;
pub mod error;
pub mod item;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod periodic;
pub mod queue;
pub mod rate_tracker;
pub mod recency_cache;
#[cfg(feature = "distributed")]
pub mod redis_store;
pub mod reporter;
pub mod store;

pub use error::*;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber for a binary. `RUST_LOG` overrides the
/// default `info` level. Safe to call more than once.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
    if installed.is_ok() {
        tracing::debug!(service, "tracing initialized");
    }
}
