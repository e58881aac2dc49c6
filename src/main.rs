//! Thin CLI layer: parse args, styled output, and call into texfetch-core.

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Arg, ArgAction, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use texfetch_core::engine::{EngineOptions, FetchEngine, FetchRequest, UrlProvider};
use texfetch_core::worker::PollResult;
use texfetch_core::{
    cache_clean, cache_size_bytes, init_cache, list_cached_assets, load_config, AssetId,
    DiskBlobCache, PassthroughCodec, ServiceRegistry, UreqTransport,
};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && std::env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

struct FixedUrl {
    url: String,
}

impl UrlProvider for FixedUrl {
    fn url_for(&self, id: AssetId, _host: Option<&str>) -> Option<String> {
        Some(format!("{}/?texture_id={}", self.url.trim_end_matches('/'), id))
    }
}

fn build_cli() -> Command {
    Command::new("texfetch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Progressive texture fetcher: disk cache, HTTP range requests")
        .subcommand_required(true)
        .subcommand(
            Command::new("fetch")
                .about("Fetch an asset by id and write the compressed stream to disk")
                .arg(Arg::new("id").required(true).help("128-bit asset id (UUID form)"))
                .arg(
                    Arg::new("url")
                        .long("url")
                        .help("Direct asset URL (http://, https://, or file://)"),
                )
                .arg(
                    Arg::new("cap")
                        .long("cap")
                        .help("Capability base URL; the asset id is appended as texture_id"),
                )
                .arg(
                    Arg::new("discard")
                        .long("discard")
                        .default_value("0")
                        .help("Discard level: 0 = full asset, higher = smaller prefix"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .short('o')
                        .help("Output file (default: <id>.j2c)"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .default_value("60")
                        .help("Give up after this many seconds"),
                )
                .arg(
                    Arg::new("quiet")
                        .long("quiet")
                        .short('q')
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("cache")
                .about("Inspect or clean the texture store")
                .subcommand_required(true)
                .subcommand(Command::new("size").about("Total bytes in the store"))
                .subcommand(Command::new("list").about("List cached asset ids"))
                .subcommand(Command::new("clean").about("Delete every cached texture")),
        )
        .subcommand(Command::new("stats").about("Cache store summary"))
}

fn cmd_fetch(matches: &clap::ArgMatches) -> Result<(), String> {
    let id: AssetId = matches
        .get_one::<String>("id")
        .unwrap()
        .parse()
        .map_err(|e| format!("invalid asset id: {}", e))?;
    let url = matches.get_one::<String>("url").cloned();
    let cap = matches.get_one::<String>("cap").cloned();
    if url.is_none() && cap.is_none() {
        return Err("one of --url or --cap is required".to_string());
    }
    let discard: u8 = matches
        .get_one::<String>("discard")
        .unwrap()
        .parse()
        .map_err(|_| "discard must be a small integer".to_string())?;
    let timeout_secs: u64 = matches
        .get_one::<String>("timeout")
        .unwrap()
        .parse()
        .map_err(|_| "timeout must be seconds".to_string())?;
    let quiet = matches.get_flag("quiet");

    init_cache().map_err(|e| format!("cache init: {}", e))?;
    let mut config = load_config(Path::new("."));
    // the CLI drives the pipeline from this thread; no sim circuit here
    config.fetch_threads = 0;
    config.udp_enabled = false;
    config.cache_threads = 1;

    let cache = DiskBlobCache::new(config.cache_dir.as_deref(), 1).map_err(|e| e.to_string())?;
    let engine = FetchEngine::new(EngineOptions {
        config,
        cache: Arc::new(cache.clone()),
        codec: Arc::new(PassthroughCodec),
        http: Arc::new(UreqTransport::new()),
        udp: None,
        url_provider: cap.map(|url| Arc::new(FixedUrl { url }) as Arc<dyn UrlProvider>),
        registry: Some(Arc::new(ServiceRegistry::new(8, 32))),
        agent_id: AssetId::random(),
        session_id: AssetId::random(),
    });

    let mut req = FetchRequest::new(id);
    req.url = url;
    req.priority = 1_000_000.0;
    req.desired_discard = discard;
    if !engine.create_request(req) {
        return Err("request rejected".to_string());
    }

    let spinner = if quiet {
        None
    } else {
        let s = ProgressBar::new_spinner();
        s.set_style(
            ProgressStyle::default_spinner()
                .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
                .template("{spinner:.dim} {msg}")
                .unwrap(),
        );
        s.set_message(format!("fetching {}", id));
        Some(s)
    };

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let result = loop {
        engine.tick();
        match engine.poll_finished(id) {
            PollResult::NotReady => {
                if Instant::now() >= deadline {
                    break Err("fetch timed out".to_string());
                }
                if let Some(s) = &spinner {
                    s.tick();
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            PollResult::Ready { discard, raw, .. } => break Ok((discard, raw)),
            PollResult::Aborted => break Err("fetch failed".to_string()),
        }
    };
    if let Some(s) = &spinner {
        s.finish_and_clear();
    }

    let stats = engine.stats();
    engine.shutdown();
    cache.shutdown();

    let (got_discard, raw) = result?;
    let out_path = matches
        .get_one::<String>("out")
        .cloned()
        .unwrap_or_else(|| format!("{}.j2c", id));
    std::fs::write(&out_path, raw.data.as_slice())
        .map_err(|e| format!("write {}: {}", out_path, e))?;
    success(&format!(
        "{} -> {} ({} bytes, discard {})",
        id,
        out_path,
        raw.data.len(),
        got_discard
    ));
    dim(&format!(
        "http: {} requests, {} bytes; cache: {} hits, {} writes",
        stats.metrics.http_requests,
        stats.metrics.http_bytes,
        stats.metrics.cache_hits,
        stats.metrics.cache_writes
    ));
    Ok(())
}

fn cmd_cache(matches: &clap::ArgMatches) -> Result<(), String> {
    match matches.subcommand() {
        Some(("size", _)) => {
            let bytes = cache_size_bytes();
            info(&format!(
                "{} bytes ({:.1} MiB)",
                bytes,
                bytes as f64 / (1024.0 * 1024.0)
            ));
            Ok(())
        }
        Some(("list", _)) => {
            let assets = list_cached_assets();
            if assets.is_empty() {
                dim("cache is empty");
            }
            for a in assets {
                println!("{}", a);
            }
            Ok(())
        }
        Some(("clean", _)) => {
            cache_clean().map_err(|e| format!("cache clean: {}", e))?;
            success("cache cleaned");
            Ok(())
        }
        _ => unreachable!("subcommand required"),
    }
}

fn cmd_stats() -> Result<(), String> {
    let assets = list_cached_assets();
    let bytes = cache_size_bytes();
    println!("cached assets: {}", assets.len());
    println!("store size:    {} bytes", bytes);
    println!("cache dir:     {}", texfetch_core::utils::get_cache_dir());
    Ok(())
}

fn main() {
    let matches = build_cli().get_matches();
    let result = match matches.subcommand() {
        Some(("fetch", m)) => cmd_fetch(m),
        Some(("cache", m)) => cmd_cache(m),
        Some(("stats", _)) => cmd_stats(),
        _ => unreachable!("subcommand required"),
    };
    if let Err(e) = result {
        error(&format!("error: {}", e));
        std::process::exit(1);
    }
}
