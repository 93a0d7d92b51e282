//! Pure decisions of the cache manager: request classification and eviction.

use super::{CacheConfig, CacheRequest, RequestMode};

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Page navigation: network, falling back to the offline document.
    Navigation,
    /// Allow-listed API read: network first, falling back to the API cache.
    CacheableApi,
    /// Everything else goes to the network uncached.
    Passthrough,
}

pub fn classify(config: &CacheConfig, request: &CacheRequest) -> RequestClass {
    if request.mode == RequestMode::Navigate {
        return RequestClass::Navigation;
    }
    if !request.method.eq_ignore_ascii_case("GET") {
        return RequestClass::Passthrough;
    }
    let path = request_path(&request.url);
    if config
        .api_prefixes
        .iter()
        .any(|prefix| path_has_prefix(&path, prefix))
    {
        RequestClass::CacheableApi
    } else {
        RequestClass::Passthrough
    }
}

/// Path component of a request URL, which may be absolute or origin-relative.
pub fn request_path(url: &str) -> String {
    let parsed = reqwest::Url::parse(url)
        .or_else(|_| reqwest::Url::parse("http://localhost/").and_then(|base| base.join(url)));
    match parsed {
        Ok(url) => url.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

/// `/api/runs` matches `/api/runs` and `/api/runs/42`, not `/api/runsheet`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Keys to delete so that at most `max` entries remain.
///
/// `keys` is in insertion order, oldest first. Eviction is strict FIFO:
/// reads never refresh a position. `max` is clamped to 1 so the newest
/// entry (the one whose insertion triggered the trim) always survives.
pub fn entries_to_evict<K: Clone>(keys: &[K], max: usize) -> Vec<K> {
    let max = max.max(1);
    if keys.len() <= max {
        return Vec::new();
    }
    keys[..keys.len() - max].to_vec()
}
