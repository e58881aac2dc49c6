//! HTTP transport seam, the ureq-backed implementation, and the global
//! admission accounting the scheduler consults before attaching a request.

use std::io::Read;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
pub const ACCEPT_HEADER: &str = "image/x-j2c";

/// Classified response. The state machine never sees raw status codes except
/// through these arms.
#[derive(Debug)]
pub enum HttpOutcome {
    /// 2xx with body. 206 bodies are the requested range.
    Success { status: u16, body: Vec<u8> },
    NotFound,
    Unreachable,
    Busy,
    Timeout,
    Error { status: u16, reason: String },
}

pub trait HttpTransport: Send + Sync {
    /// Blocking range GET; runs on the transport pool. `size == 0` means
    /// "to end of asset". A Range header is sent whenever offset or size is
    /// nonzero.
    fn get(&self, url: &str, offset: usize, size: usize) -> HttpOutcome;
}

/// Builds the Range header value for a byte window.
pub fn range_header(offset: usize, size: usize) -> String {
    if size == 0 {
        format!("bytes={}-", offset)
    } else {
        format!("bytes={}-{}", offset, offset + size - 1)
    }
}

/// One shared agent: connection reuse, redirects, hard timeout.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqTransport {
    pub fn new() -> UreqTransport {
        let agent = ureq::AgentBuilder::new()
            .timeout(HTTP_TIMEOUT)
            .redirects(8)
            .build();
        UreqTransport { agent }
    }
}

impl HttpTransport for UreqTransport {
    fn get(&self, url: &str, offset: usize, size: usize) -> HttpOutcome {
        let mut req = self.agent.get(url).set("Accept", ACCEPT_HEADER);
        if offset > 0 || size > 0 {
            req = req.set("Range", &range_header(offset, size));
        }
        match req.call() {
            Ok(resp) => {
                let status = resp.status();
                let mut body = Vec::new();
                match resp.into_reader().read_to_end(&mut body) {
                    Ok(_) => HttpOutcome::Success { status, body },
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::TimedOut {
                            HttpOutcome::Timeout
                        } else {
                            HttpOutcome::Error {
                                status,
                                reason: e.to_string(),
                            }
                        }
                    }
                }
            }
            Err(ureq::Error::Status(code, resp)) => {
                let reason = resp.status_text().to_string();
                match code {
                    404 => HttpOutcome::NotFound,
                    499 => HttpOutcome::Unreachable,
                    503 => HttpOutcome::Busy,
                    _ => HttpOutcome::Error { status: code, reason },
                }
            }
            Err(ureq::Error::Transport(t)) => {
                let msg = t.to_string();
                if msg.contains("timed out") || msg.contains("timeout") {
                    HttpOutcome::Timeout
                } else {
                    HttpOutcome::Unreachable
                }
            }
        }
    }
}

/// Global HTTP accounting: how many requests are attached, and how fast bytes
/// have been arriving. A request may attach while the active count is under
/// the hard cap, or while bandwidth is below the throttle and at least the
/// minimum request count is already running.
pub struct HttpAdmission {
    active: AtomicU32,
    bytes_accum: AtomicU64,
    recent_bps: AtomicU64,
    max_requests: u32,
    min_requests: u32,
    throttle_bps: u64,
}

impl HttpAdmission {
    pub fn new(max_requests: u32, min_requests: u32, throttle_bps: u64) -> HttpAdmission {
        HttpAdmission {
            active: AtomicU32::new(0),
            bytes_accum: AtomicU64::new(0),
            recent_bps: AtomicU64::new(0),
            max_requests,
            min_requests,
            throttle_bps,
        }
    }

    pub fn admit(&self) -> bool {
        let active = self.active.load(Ordering::Relaxed);
        let bw = self.recent_bps.load(Ordering::Relaxed);
        (active < self.max_requests) || (bw < self.throttle_bps && active > self.min_requests)
    }

    pub fn attach(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn detach(&self, bytes: u64) {
        self.bytes_accum.fetch_add(bytes, Ordering::Relaxed);
        // a detach without an attach is a bug upstream
        let prev = self.active.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Drain accumulated bytes and refresh the bandwidth estimate. Called from
    /// the engine tick with the elapsed wall time since the previous drain.
    pub fn drain_bytes(&self, elapsed: Duration) -> u64 {
        let bytes = self.bytes_accum.swap(0, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64().max(0.001);
        let bps = (bytes as f64 / secs) as u64;
        // halfway blend so one quiet tick doesn't zero the estimate
        let old = self.recent_bps.load(Ordering::Relaxed);
        self.recent_bps.store((old + bps) / 2, Ordering::Relaxed);
        bytes
    }
}
