use crate::CrawlError;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

/// A fetch request as it travels between tiers.
#[derive(PartialEq, Eq, Debug, Clone, Encode, Decode, Serialize, Deserialize)]
pub struct WorkItem {
    pub url: String,
    pub method: String,
    pub body: Vec<u8>,
    pub priority: i32,
    /// Skip the duplicate filter on enqueue.
    pub dont_filter: bool,
}

impl WorkItem {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            body: Vec::new(),
            priority: 0,
            dont_filter: false,
        }
    }

    pub fn post(url: &str, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            body,
            ..Self::get(url)
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn unfiltered(mut self) -> Self {
        self.dont_filter = true;
        self
    }

    /// SHA-256 over method, canonical URL and body. Priority and the
    /// filter flag do not contribute.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.method.to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(canonicalize_url(&self.url).as_bytes());
        hasher.update(b"\n");
        hasher.update(&self.body);
        let digest = hasher.finalize();

        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(&mut out, "{byte:02x}");
        }
        Fingerprint(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrawlError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrawlError> {
        let (item, _): (WorkItem, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(item)
    }
}

/// Drops the fragment and sorts query arguments so that equivalent URLs
/// share a fingerprint.
pub fn canonicalize_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    match without_fragment.split_once('?') {
        Some((base, query)) => {
            let mut args: Vec<&str> = query.split('&').filter(|a| !a.is_empty()).collect();
            if args.is_empty() {
                return base.to_string();
            }
            args.sort_unstable();
            format!("{}?{}", base, args.join("&"))
        }
        None => without_fragment.to_string(),
    }
}

/// Lowercase hex digest identifying a work item. The only thing the
/// duplicate filter ever stores.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Accepts any non-empty hex string of at least two characters.
    pub fn from_hex(hex: &str) -> Result<Self, CrawlError> {
        if hex.len() < 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CrawlError::Other(format!("'{}' is not a hex fingerprint", hex)));
        }
        Ok(Fingerprint(hex.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Value of the two leading hex characters, used to pick a filter shard.
    pub fn prefix(&self) -> u32 {
        u32::from_str_radix(&self.0[..2], 16).unwrap_or(0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
