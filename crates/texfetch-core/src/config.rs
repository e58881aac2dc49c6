//! Optional config from .texfetchrc or ~/.texfetchrc (JSON). Merged with env and CLI.

use std::path::Path;

use crate::asset::AssetId;

pub const DEFAULT_HTTP_MAX_REQUESTS: u32 = 32;
pub const DEFAULT_HTTP_MIN_REQUESTS: u32 = 8;
pub const DEFAULT_HTTP_THROTTLE_BPS: u64 = 4 * 1024 * 1024;
pub const DEFAULT_SERVICE_CONCURRENCY: u32 = 8;
pub const MAX_SERVICE_CONCURRENCY: u32 = 32;

/// Engine tunables. CLI and env override the file.
#[derive(Clone, Debug)]
pub struct Config {
    pub cache_dir: Option<String>,
    /// Global cap on concurrently attached HTTP requests.
    pub http_max_requests: u32,
    /// Below this many active requests, bandwidth throttling never rejects.
    pub http_min_requests: u32,
    /// Bytes/sec across all services before admission starts rejecting.
    pub http_throttle_bps: u64,
    /// Initial per-service concurrent connection limit.
    pub service_concurrency: u32,
    /// Fetch pool threads. 0 runs the state machines inline from tick().
    pub fetch_threads: usize,
    pub cache_threads: usize,
    pub decode_threads: usize,
    pub udp_enabled: bool,
    /// Minimum gap between network sweeps (UDP batch sends), in ms.
    pub sweep_interval_ms: u64,
    /// Asset ids known broken; fetches fail immediately in Init.
    pub asset_blacklist: Vec<AssetId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            http_max_requests: DEFAULT_HTTP_MAX_REQUESTS,
            http_min_requests: DEFAULT_HTTP_MIN_REQUESTS,
            http_throttle_bps: DEFAULT_HTTP_THROTTLE_BPS,
            service_concurrency: DEFAULT_SERVICE_CONCURRENCY,
            fetch_threads: num_cpus::get().clamp(2, 8),
            cache_threads: 2,
            decode_threads: num_cpus::get().clamp(1, 4),
            udp_enabled: true,
            sweep_interval_ms: 100,
            asset_blacklist: Vec::new(),
        }
    }
}

/// Load config from .texfetchrc in dir, then ~/.texfetchrc. Missing or invalid file = default.
pub fn load_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    let home = dirs::home_dir();
    let candidates = [
        dir.join(".texfetchrc"),
        home.map(|h| h.join(".texfetchrc")).unwrap_or_else(|| dir.join(".none")),
    ];
    for path in &candidates {
        if path.is_file() {
            if let Ok(s) = std::fs::read_to_string(path) {
                if let Ok(v) = serde_json::from_str::<serde_json::Value>(&s) {
                    if let Some(c) = v.get("cacheDir").and_then(|x| x.as_str()) {
                        cfg.cache_dir = Some(c.to_string());
                    }
                    if let Some(n) = v.get("httpMaxRequests").and_then(|x| x.as_u64()) {
                        cfg.http_max_requests = (n as u32).max(1);
                    }
                    if let Some(n) = v.get("httpMinRequests").and_then(|x| x.as_u64()) {
                        cfg.http_min_requests = n as u32;
                    }
                    if let Some(n) = v.get("httpThrottleBps").and_then(|x| x.as_u64()) {
                        cfg.http_throttle_bps = n;
                    }
                    if let Some(n) = v.get("serviceConcurrency").and_then(|x| x.as_u64()) {
                        cfg.service_concurrency = (n as u32).clamp(1, MAX_SERVICE_CONCURRENCY);
                    }
                    if let Some(b) = v.get("udpEnabled").and_then(|x| x.as_bool()) {
                        cfg.udp_enabled = b;
                    }
                    if let Some(list) = v.get("assetBlacklist").and_then(|x| x.as_array()) {
                        cfg.asset_blacklist = list
                            .iter()
                            .filter_map(|x| x.as_str())
                            .filter_map(|s| s.parse::<AssetId>().ok())
                            .collect();
                    }
                }
            }
            break;
        }
    }
    apply_env(&mut cfg);
    cfg
}

fn apply_env(cfg: &mut Config) {
    if let Ok(dir) = std::env::var("TEXFETCH_CACHE_DIR") {
        cfg.cache_dir = Some(dir);
    }
    if let Ok(v) = std::env::var("TEXFETCH_HTTP_MAX") {
        if let Ok(n) = v.parse::<u32>() {
            cfg.http_max_requests = n.max(1);
        }
    }
    if let Ok(v) = std::env::var("TEXFETCH_THROTTLE_BPS") {
        if let Ok(n) = v.parse::<u64>() {
            cfg.http_throttle_bps = n;
        }
    }
    if let Ok(v) = std::env::var("TEXFETCH_UDP") {
        cfg.udp_enabled = v != "0" && v.to_lowercase() != "false";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = Config::default();
        assert!(cfg.http_min_requests < cfg.http_max_requests);
        assert!(cfg.service_concurrency >= 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".texfetchrc"),
            r#"{"httpMaxRequests": 4, "serviceConcurrency": 2, "udpEnabled": false}"#,
        )
        .unwrap();
        let cfg = load_config(dir.path());
        assert_eq!(cfg.http_max_requests, 4);
        assert_eq!(cfg.service_concurrency, 2);
        assert!(!cfg.udp_enabled);
    }
}
