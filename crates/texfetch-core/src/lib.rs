//! Core library for texfetch: fetch engine, per-service scheduler, UDP
//! reassembly, blob cache, transports. Used by the CLI binary; can be reused
//! by viewers and other tools.

pub mod asset;
pub mod assembler;
pub mod blacklist;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error_handling;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod service_name;
pub mod service_queue;
pub mod udp;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod scheduler_tests;

#[cfg(test)]
mod pipeline_tests;

// Re-export main API for the CLI and embedders
pub use asset::{AssetId, CodecTag, FormattedBytes, RawImage, MAX_DISCARD};
pub use cache::{BlobCache, CacheReadOutcome, DiskBlobCache, MemBlobCache};
pub use codec::{Codec, DecodedImage, PassthroughCodec};
pub use config::{load_config, Config};
pub use engine::{EngineOptions, EngineStats, FetchEngine, FetchRequest, UrlProvider};
pub use error_handling::FetchError;
pub use http::{HttpOutcome, HttpTransport, UreqTransport};
pub use metrics::{FetchMetrics, MetricsSnapshot};
pub use service_name::service_name_from_url;
pub use service_queue::{CapabilityClass, PerServiceQueue, ServiceRegistry};
pub use udp::{ImageHeader, ImagePacket, ImageRequest, RequestBatch, SimTransport};
pub use utils::{cache_clean, cache_size_bytes, init_cache, list_cached_assets, log, log_error};
pub use worker::{FetchState, FetchWorker, PollResult};
