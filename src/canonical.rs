//! Canonical keys for deduplicating raw work items.

use std::sync::Arc;
use url::Url;

/// Normalizes a raw item into the canonical key used for deduplication.
///
/// Returning `None` marks the item malformed; it is dropped without being
/// admitted, counted as outstanding work, or retried.
pub type Canonicalizer<K> = Arc<dyn Fn(&K) -> Option<K> + Send + Sync>;

/// Canonicalizer that accepts every item unchanged.
pub fn identity<K: Clone>() -> Canonicalizer<K> {
    Arc::new(|raw: &K| Some(raw.clone()))
}

/// Canonical form of a crawl URL.
///
/// Only `http` and `https` URLs are accepted; the fragment is stripped so
/// `page#a` and `page#b` collapse to one key.
pub fn canonical_url(raw: &Url) -> Option<Url> {
    if raw.scheme() != "http" && raw.scheme() != "https" {
        return None;
    }
    let mut key = raw.clone();
    key.set_fragment(None);
    Some(key)
}

/// Ready-made [`Canonicalizer`] over URLs backed by [`canonical_url`].
pub fn url_canonicalizer() -> Canonicalizer<Url> {
    Arc::new(canonical_url)
}
