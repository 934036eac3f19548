//! Object URIs and channel URLs

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Generate a fresh object URI for an object published from `domain`
pub fn generate_uri(domain: &str) -> String {
    let seq = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("/{}/{}_{}.rem", domain, Uuid::new_v4().simple(), seq)
}

/// Key an object URI is stored under in the identity table
///
/// Lookups ignore case and a leading slash.
pub fn table_key(uri: &str) -> String {
    uri.trim_start_matches('/').to_ascii_lowercase()
}

/// Split a URL into its channel part and the object URI
///
/// `scheme://authority/path` gives `(Some("scheme://authority"), "/path")`;
/// a bare object URI gives `(None, uri)`.
pub fn split_url(url: &str) -> (Option<&str>, &str) {
    let Some(scheme_end) = url.find("://") else {
        return (None, url);
    };
    let rest = &url[scheme_end + 3..];
    match rest.find('/') {
        Some(slash) => {
            let split = scheme_end + 3 + slash;
            (Some(&url[..split]), &url[split..])
        }
        None => (Some(url), ""),
    }
}
