// Per-URL success/failure bookkeeping for the fallback fetcher.

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UrlHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_attempt: Option<Instant>,
}

impl UrlHealth {
    /// Healthy with no history, with zero failures, or while successes outnumber failures.
    pub fn is_healthy(&self) -> bool {
        self.failure_count == 0 || self.success_count > self.failure_count
    }

    pub fn attempts(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

/// Process-lifetime health registry. Counters only reset through [`clear`](Self::clear).
#[derive(Default)]
pub struct UrlHealthRegistry {
    entries: DashMap<String, UrlHealth>,
}

impl UrlHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, url: &str) {
        let mut entry = self.entries.entry(url.to_string()).or_default();
        entry.success_count += 1;
        entry.last_attempt = Some(Instant::now());
    }

    pub fn record_failure(&self, url: &str, error: impl Into<String>) {
        let mut entry = self.entries.entry(url.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_error = Some(error.into());
        entry.last_attempt = Some(Instant::now());
    }

    pub fn get(&self, url: &str) -> Option<UrlHealth> {
        self.entries.get(url).map(|e| e.clone())
    }

    /// URLs without history count as healthy.
    pub fn is_healthy(&self, url: &str) -> bool {
        self.entries.get(url).map_or(true, |e| e.is_healthy())
    }

    /// Stable reorder placing healthy URLs before unhealthy ones.
    pub fn healthy_first(&self, urls: &[String]) -> Vec<String> {
        let (mut healthy, unhealthy): (Vec<String>, Vec<String>) =
            urls.iter().cloned().partition(|u| self.is_healthy(u));
        healthy.extend(unhealthy);
        healthy
    }

    pub fn tracked_urls(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(successes: u64, failures: u64) -> UrlHealth {
        UrlHealth {
            success_count: successes,
            failure_count: failures,
            ..Default::default()
        }
    }

    #[test]
    fn test_is_healthy_rules() {
        assert!(UrlHealth::default().is_healthy());
        assert!(health(3, 0).is_healthy());
        assert!(health(10, 1).is_healthy());
        assert!(!health(0, 5).is_healthy());
        assert!(!health(2, 2).is_healthy());
    }

    #[test]
    fn test_registry_tracks_and_clears() {
        let reg = UrlHealthRegistry::new();
        assert!(reg.is_healthy("http://never-seen"));

        for _ in 0..5 {
            reg.record_failure("http://bad", "connection refused");
        }
        reg.record_success("http://good");

        let bad = reg.get("http://bad").unwrap();
        assert_eq!(bad.failure_count, 5);
        assert_eq!(bad.last_error.as_deref(), Some("connection refused"));
        assert!(!reg.is_healthy("http://bad"));
        assert_eq!(reg.tracked_urls(), 2);

        let ordered = reg.healthy_first(&[
            "http://bad".to_string(),
            "http://good".to_string(),
            "http://new".to_string(),
        ]);
        assert_eq!(ordered, vec!["http://good", "http://new", "http://bad"]);

        reg.clear();
        assert!(reg.get("http://bad").is_none());
        assert!(reg.is_healthy("http://bad"));
    }
}
