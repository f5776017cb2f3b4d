use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use reqwest::Url;

/// Ordered endpoint list with a single active index. Failover walks the list
/// round-robin; concurrent callers failing on the same endpoint advance it once.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<String>,
    active: AtomicUsize,
    failovers: AtomicU64,
}

impl EndpointPool {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            active: AtomicUsize::new(0),
            failovers: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn current(&self) -> (usize, &str) {
        let idx = self.active.load(Ordering::Acquire) % self.endpoints.len().max(1);
        (idx, self.endpoints.get(idx).map(String::as_str).unwrap_or(""))
    }

    /// Move off `from_idx`. Returns false with a single endpoint or when another
    /// caller already moved on.
    pub fn failover(&self, from_idx: usize) -> bool {
        if self.endpoints.len() < 2 {
            return false;
        }
        let next = (from_idx + 1) % self.endpoints.len();
        let moved = self
            .active
            .compare_exchange(from_idx, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.failovers.fetch_add(1, Ordering::Relaxed);
        }
        moved
    }

    pub fn failover_count(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn masked_current(&self) -> String {
        mask_endpoint(self.current().1)
    }
}

const SENSITIVE_KEYS: &[&str] = &["api-key", "api_key", "apikey", "token", "key", "secret"];

/// Strip userinfo, sensitive query values and long path tokens (API keys in paths).
/// Anything that does not parse as a URL is hidden entirely.
pub fn mask_endpoint(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "***".to_string();
    };
    // Only fails for URLs without a host, which carry no userinfo anyway.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);

    if let Some(segments) = url.path_segments() {
        let masked = segments
            .map(|seg| if seg.len() >= 16 { "***" } else { seg })
            .collect::<Vec<_>>()
            .join("/");
        url.set_path(&format!("/{masked}"));
    }

    if url.query().is_some_and(|q| !q.is_empty()) {
        let pairs = url
            .query_pairs()
            .map(|(k, v)| {
                let v = if SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                    "***".to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect::<Vec<_>>();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let mut masked = url.as_str().to_string();
    // Url always renders a root path; keep the configured spelling.
    if url.path() == "/" && url.query().is_none() && !raw.ends_with('/') {
        masked.pop();
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_cycles_and_dedupes_concurrent_moves() {
        let pool = EndpointPool::new(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(pool.current(), (0, "a"));
        assert!(pool.failover(0));
        assert!(!pool.failover(0));
        assert_eq!(pool.current(), (1, "b"));
        assert!(pool.failover(1));
        assert!(pool.failover(2));
        assert_eq!(pool.current(), (0, "a"));
        assert_eq!(pool.failover_count(), 3);
    }

    #[test]
    fn single_endpoint_never_fails_over() {
        let pool = EndpointPool::new(vec!["only".into()]);
        assert!(!pool.failover(0));
        assert_eq!(pool.current(), (0, "only"));
    }

    #[test]
    fn masking_hides_keys() {
        assert_eq!(
            mask_endpoint("https://mainnet.example-rpc.com/?api-key=secret&cluster=main"),
            "https://mainnet.example-rpc.com/?api-key=***&cluster=main"
        );
        assert_eq!(
            mask_endpoint("https://user:pw@rpc.example.com/v2/3f9a1c2b7d8e4f60aa11"),
            "https://rpc.example.com/v2/***"
        );
        assert_eq!(mask_endpoint("http://127.0.0.1:8899"), "http://127.0.0.1:8899");
        assert_eq!(
            mask_endpoint("https://rpc.example.com/v1?Token=abc#frag"),
            "https://rpc.example.com/v1?Token=***"
        );
        assert_eq!(mask_endpoint("not a url with key=abc"), "***");
    }
}
