//! Transient deny list for HTTP endpoints that keep failing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Errors tolerated before a key is actually denied.
pub const MAX_ERROR_COUNT: u32 = 5;

/// How long a 404/499 keeps a service dark.
pub const BLACKLIST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    expires_at: Instant,
    reason: u16,
    error_count: u32,
}

/// Keyed by the URL prefix up to the last '/': every asset URL on the same
/// endpoint shares one failure budget.
pub struct HostBlacklist {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for HostBlacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBlacklist {
    pub fn new() -> HostBlacklist {
        HostBlacklist {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// URL prefix up to (and excluding) the last '/'.
    pub fn key_for(url: &str) -> &str {
        match url.rfind('/') {
            Some(pos) => &url[..pos],
            None => url,
        }
    }

    /// Record a failure for the endpoint serving `url`.
    pub fn add(&self, url: &str, timeout: Duration, reason: u16) {
        let key = Self::key_for(url).to_string();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key).or_insert(Entry {
            expires_at: Instant::now(),
            reason,
            error_count: 0,
        });
        entry.error_count += 1;
        entry.reason = reason;
        entry.expires_at = Instant::now() + timeout;
    }

    /// Deny the endpoint immediately, without waiting for the failure budget.
    /// For definitive answers (404, 499): asking again will not help.
    pub fn ban(&self, url: &str, timeout: Duration, reason: u16) {
        let key = Self::key_for(url).to_string();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key).or_insert(Entry {
            expires_at: Instant::now(),
            reason,
            error_count: 0,
        });
        entry.error_count = entry.error_count.max(MAX_ERROR_COUNT) + 1;
        entry.reason = reason;
        entry.expires_at = Instant::now() + timeout;
    }

    /// True while the endpoint has exceeded its failure budget and the entry
    /// has not expired. Expired entries are swept here.
    pub fn is_blacklisted(&self, url: &str) -> bool {
        let key = Self::key_for(url);
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        match entries.get(key) {
            Some(e) => e.error_count > MAX_ERROR_COUNT,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_prefix_to_last_slash() {
        assert_eq!(HostBlacklist::key_for("http://h/cap/tex?id=1"), "http://h/cap");
        assert_eq!(HostBlacklist::key_for("no-slash"), "no-slash");
    }

    #[test]
    fn test_denies_only_past_threshold() {
        let bl = HostBlacklist::new();
        let url = "http://h/cap/tex";
        for _ in 0..MAX_ERROR_COUNT {
            bl.add(url, Duration::from_secs(60), 499);
            assert!(!bl.is_blacklisted(url));
        }
        bl.add(url, Duration::from_secs(60), 499);
        assert!(bl.is_blacklisted(url));
        // different endpoint, same host: independent budget
        assert!(!bl.is_blacklisted("http://h/other/tex"));
    }

    #[test]
    fn test_ban_denies_immediately() {
        let bl = HostBlacklist::new();
        let url = "http://h/cap/tex";
        bl.ban(url, Duration::from_secs(60), 404);
        assert!(bl.is_blacklisted(url));
    }

    #[test]
    fn test_expiry_sweeps() {
        let bl = HostBlacklist::new();
        let url = "http://h/cap/tex";
        for _ in 0..=MAX_ERROR_COUNT {
            bl.add(url, Duration::from_millis(0), 404);
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(!bl.is_blacklisted(url));
        assert!(bl.is_empty());
    }
}
