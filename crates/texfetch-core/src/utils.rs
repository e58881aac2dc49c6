use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{Result, Write};
use std::path::PathBuf;

use chrono::Local;

pub const LOG_FILE: &str = "logs.txt";

/// Returns the path to the cache directory. Uses TEXFETCH_CACHE_DIR if set;
/// otherwise $HOME/.texfetch-cache (or the platform home equivalent).
pub fn get_cache_dir() -> String {
    if let Ok(dir) = env::var("TEXFETCH_CACHE_DIR") {
        return dir;
    }
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(".texfetch-cache").to_string_lossy().to_string()
}

pub fn init_cache() -> Result<()> {
    let cache_dir = get_cache_dir();
    fs::create_dir_all(&cache_dir)?;
    fs::create_dir_all(store_dir())?;

    let log_path = PathBuf::from(&cache_dir).join(LOG_FILE);
    if !log_path.exists() {
        File::create(&log_path)?;
    }

    Ok(())
}

fn is_quiet() -> bool {
    if env::var("TEXFETCH_QUIET").map(|v| v == "1" || v == "true").unwrap_or(false) {
        return true;
    }
    env::var("TEXFETCH_LOG")
        .map(|v| v.to_lowercase() == "quiet" || v.to_lowercase() == "error")
        .unwrap_or(false)
}

pub fn log(message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let log_message = format!("[{}] {}", timestamp, message);

    // When TEXFETCH_QUIET/TEXFETCH_LOG=quiet, never print logs to stdout (only to file)
    if !is_quiet() {
        println!("{}", log_message);
    }

    let log_path = PathBuf::from(get_cache_dir()).join(LOG_FILE);

    let mut should_write = true;
    if let Ok(contents) = fs::read_to_string(&log_path) {
        if let Some(last_line) = contents.lines().last() {
            if last_line == log_message {
                should_write = false;
            }
        }
    }

    if should_write {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
            let _ = writeln!(file, "{}", log_message);
        }
    }
}

pub fn log_error(message: &str) {
    eprintln!("{}", message);
    log(message);
}

fn cache_dir_path() -> PathBuf {
    PathBuf::from(get_cache_dir())
}

/// Texture store dir: cache_dir/store/
pub fn store_dir() -> PathBuf {
    cache_dir_path().join("store")
}

/// Index path: cache_dir/store_index.json (asset id -> entry metadata)
pub fn store_index_path() -> PathBuf {
    cache_dir_path().join("store_index.json")
}

/// Total bytes held in the texture store.
pub fn cache_size_bytes() -> u64 {
    let mut total = 0u64;
    if let Ok(entries) = fs::read_dir(store_dir()) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
    }
    total
}

/// Remove every stored texture and the index. Logs are kept.
pub fn cache_clean() -> Result<()> {
    let dir = store_dir();
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    let index = store_index_path();
    if index.exists() {
        fs::remove_file(&index)?;
    }
    Ok(())
}

/// Asset ids present in the store, from file stems.
pub fn list_cached_assets() -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(store_dir()) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
    }
    out.sort();
    out
}

/// Parse an env var as usize with a clamp, falling back to `default`.
pub fn env_usize(name: &str, default: usize, max: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.clamp(1, max))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_usize_default() {
        assert_eq!(env_usize("TEXFETCH_TEST_UNSET_VAR", 7, 100), 7);
    }

    #[test]
    fn test_cache_dir_env_override() {
        std::env::set_var("TEXFETCH_CACHE_DIR", "/tmp/texfetch-test-dir");
        assert_eq!(get_cache_dir(), "/tmp/texfetch-test-dir");
        std::env::remove_var("TEXFETCH_CACHE_DIR");
    }
}
