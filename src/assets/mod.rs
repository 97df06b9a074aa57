//! Discovery & ingestion: a bounded, paginated stream of candidate relay
//! assets from an external internet-asset search API, abstracted behind
//! [`AssetSource`] so the Scheduler never depends on a concrete search
//! provider. Ported from `fofa/fofa.go`'s channel-based pager.

pub mod fofa;

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use url::Url;

/// One search hit from the upstream asset-search API.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub ip: String,
    pub port: String,
    pub origin: Url,
    pub raw: HashMap<String, String>,
}

impl Asset {
    pub fn raw_field(&self, key: &str) -> &str {
        self.raw.get(key).map(String::as_str).unwrap_or_default()
    }
}

pub type AssetStream<'a> = Pin<Box<dyn Stream<Item = anyhow::Result<Asset>> + Send + 'a>>;

/// Exposes a bounded, paginated iteration over candidate assets for a given
/// query expression. `max_results` bounds the cumulative count across pages;
/// `None` means unbounded (drain until the upstream reports no more
/// results).
pub trait AssetSource: Send + Sync {
    fn query<'a>(&'a self, expr: &'a str, page_size: usize, max_results: Option<usize>) -> AssetStream<'a>;
}
