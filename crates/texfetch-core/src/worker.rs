//! Per-asset fetch state machine.
//!
//! A worker drives one asset from cache lookup through network acquisition,
//! decode, and cache write-back. The state logic lives in `step`, which never
//! performs I/O itself: it mutates the worker under its mutex and hands the
//! engine an action to run outside every lock. Completions land in inbox
//! slots and the engine re-queues the worker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::asset::{
    work_priority, AssetId, CodecTag, FormattedBytes, RawImage,
};
use crate::assembler::{InsertError, PacketAssembler};
use crate::cache::CacheReadOutcome;
use crate::codec::DecodedImage;
use crate::error_handling::FetchError;
use crate::http::HttpOutcome;
use crate::service_queue::{CapabilityClass, PerServiceQueue, ServiceRequest};

/// Strikes allowed for unclassified HTTP errors before giving up on HTTP.
pub const HTTP_MAX_RETRIES: u32 = 3;
/// Hard ceiling on attempts per network pass; keeps a permanently busy
/// service (503 forever) from spinning a worker.
pub const HTTP_MAX_ATTEMPTS: u32 = 16;
/// Priority changes below this fraction do not re-sort the run queue.
pub const PRIORITY_HYSTERESIS: f32 = 0.05;
/// Sim re-request thresholds.
pub const MIN_DELTA_PRIORITY: f32 = 1000.0;
pub const MIN_REQUEST_TIME: Duration = Duration::from_secs(1);
pub const SIM_LAZY_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchState {
    Init,
    LoadFromCache,
    CachePost,
    LoadFromNetwork,
    LoadFromSim,
    SendHttp,
    WaitHttp,
    Decode,
    WaitDecode,
    WriteToCache,
    WaitOnWrite,
    Done,
}

/// What `poll_finished` hands back.
#[derive(Clone, Debug)]
pub enum PollResult {
    Ready {
        discard: u8,
        raw: RawImage,
        aux: Option<RawImage>,
    },
    NotReady,
    Aborted,
}

/// I/O the engine must run for a worker, produced by `step` and executed with
/// no worker or queue lock held.
pub enum StepAction {
    /// Run `step` again.
    Continue,
    /// Waiting on a completion; nothing to do.
    Park,
    ReadCache {
        offset: usize,
        size: usize,
    },
    ReadFile {
        path: String,
    },
    EnqueueHttp {
        service: Arc<PerServiceQueue>,
        class: CapabilityClass,
    },
    EnqueueUdp,
    /// Sim data adopted or fetch abandoned; drop the asset from the UDP queue
    /// and cancel with the host if a request went out.
    CancelUdp {
        host: Option<String>,
        was_requested: bool,
    },
    SubmitDecode {
        codec: CodecTag,
        bytes: Vec<u8>,
        discard: u8,
        need_aux: bool,
    },
    /// Drop the (corrupt) cache entry, then continue.
    RemoveCacheEntry,
    WriteCache {
        bytes: Vec<u8>,
        file_size: usize,
    },
    /// Reached `Done`.
    Finished,
}

/// Everything `step` needs from the outside world, behind a seam so the state
/// machine is testable without an engine.
pub trait WorkerEnv {
    fn asset_blacklisted(&self, id: AssetId) -> bool;
    fn host_blacklisted(&self, url: &str) -> bool;
    fn url_for(&self, id: AssetId, host: Option<&str>) -> Option<String>;
    fn service_for(&self, url: &str) -> Arc<PerServiceQueue>;
    fn udp_available(&self) -> bool;
}

pub(crate) struct WorkerInner {
    pub state: FetchState,
    pub url: Option<String>,
    pub host: Option<String>,
    pub class: CapabilityClass,
    pub image_type: u8,
    pub needs_aux: bool,

    pub priority: f32,
    pub immediate: bool,
    pub desired_discard: u8,
    pub desired_size: usize,

    pub formatted: FormattedBytes,
    pub raw: Option<RawImage>,
    pub aux: Option<RawImage>,
    pub decoded_discard: Option<u8>,

    pub assembler: PacketAssembler,
    pub can_use_http: bool,
    pub can_use_udp: bool,
    pub sent_udp_request: bool,
    pub in_udp_queue: bool,
    pub sim_requested_discard: i8,
    pub sim_request_time: Option<Instant>,
    pub sim_request_priority: f32,

    pub http_failures: u32,
    pub http_attempts: u32,
    pub http_requested_offset: usize,
    pub http_requested_size: usize,

    pub write_to_cache: bool,
    pub was_cached: bool,
    pub decode_retried: bool,

    pub service: Option<Arc<PerServiceQueue>>,
    pub queued_in_service: bool,

    pub cache_read_pending: bool,
    pub http_pending: bool,
    pub decode_pending: bool,
    pub cache_write_handle: Option<u64>,

    pub inbox_cache_read: Option<CacheReadOutcome>,
    pub inbox_http: Option<HttpOutcome>,
    pub inbox_decode: Option<Result<DecodedImage, FetchError>>,
    pub inbox_cache_write: Option<Result<(), FetchError>>,

    pub flagged_for_delete: bool,
}

pub struct FetchWorker {
    pub id: AssetId,
    pub(crate) inner: Mutex<WorkerInner>,
}

impl ServiceRequest for FetchWorker {
    fn asset_id(&self) -> AssetId {
        self.id
    }
}

fn is_file_url(url: &Option<String>) -> Option<String> {
    url.as_deref()
        .and_then(|u| u.strip_prefix("file://"))
        .map(|p| p.to_string())
}

impl FetchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: AssetId,
        url: Option<String>,
        host: Option<String>,
        class: CapabilityClass,
        image_type: u8,
        priority: f32,
        desired_discard: u8,
        desired_size: usize,
        needs_aux: bool,
        can_use_http: bool,
        can_use_udp: bool,
    ) -> Arc<FetchWorker> {
        Arc::new(FetchWorker {
            id,
            inner: Mutex::new(WorkerInner {
                state: FetchState::Init,
                url,
                host,
                class,
                image_type,
                needs_aux,
                priority,
                immediate: false,
                desired_discard,
                desired_size,
                formatted: FormattedBytes::default(),
                raw: None,
                aux: None,
                decoded_discard: None,
                assembler: PacketAssembler::new(),
                can_use_http,
                can_use_udp,
                sent_udp_request: false,
                in_udp_queue: false,
                sim_requested_discard: -1,
                sim_request_time: None,
                sim_request_priority: 0.0,
                http_failures: 0,
                http_attempts: 0,
                http_requested_offset: 0,
                http_requested_size: 0,
                write_to_cache: false,
                was_cached: false,
                decode_retried: false,
                service: None,
                queued_in_service: false,
                cache_read_pending: false,
                http_pending: false,
                decode_pending: false,
                cache_write_handle: None,
                inbox_cache_read: None,
                inbox_http: None,
                inbox_decode: None,
                inbox_cache_write: None,
                flagged_for_delete: false,
            }),
        })
    }

    pub fn state(&self) -> FetchState {
        self.inner.lock().unwrap().state
    }

    pub fn priority(&self) -> f32 {
        self.inner.lock().unwrap().priority
    }

    pub fn work_priority(&self) -> u64 {
        let w = self.inner.lock().unwrap();
        work_priority(w.priority, w.immediate)
    }

    /// Update the image priority. Returns true when the change is large
    /// enough (or the worker is parked in `Done`) that the run queue should
    /// re-sort.
    pub fn set_priority(&self, p: f32) -> bool {
        let mut w = self.inner.lock().unwrap();
        let old = w.priority;
        w.priority = p;
        let threshold = old.abs() * PRIORITY_HYSTERESIS;
        (p - old).abs() > threshold || w.state == FetchState::Done
    }

    /// Update what the caller wants. Returns true when the worker should be
    /// re-queued: either the request grew, or a finished worker is asked for
    /// finer detail and re-enters the pipeline.
    pub fn set_desired(&self, discard: u8, size: usize) -> bool {
        let mut w = self.inner.lock().unwrap();
        let mut requeue = false;
        if discard < w.desired_discard {
            w.desired_discard = discard;
            w.immediate = true;
            requeue = true;
        }
        if size > w.desired_size {
            w.desired_size = size;
            requeue = true;
        }
        if w.state == FetchState::Done {
            match w.decoded_discard {
                Some(d) if discard < d => {
                    w.state = FetchState::Init;
                    requeue = true;
                }
                _ => requeue = false,
            }
        }
        requeue
    }

    pub fn flag_for_delete(&self) {
        self.inner.lock().unwrap().flagged_for_delete = true;
    }

    pub fn flagged_for_delete(&self) -> bool {
        self.inner.lock().unwrap().flagged_for_delete
    }

    /// Deletion must wait for every outstanding cache/decode handle, and a
    /// decided cache write goes through first; an HTTP response in flight is
    /// simply ignored when it lands.
    pub fn delete_ok(&self) -> bool {
        let w = self.inner.lock().unwrap();
        !w.cache_read_pending
            && !w.decode_pending
            && w.cache_write_handle.is_none()
            && w.state != FetchState::WriteToCache
    }

    pub fn poll(&self) -> PollResult {
        let w = self.inner.lock().unwrap();
        if w.state != FetchState::Done {
            return PollResult::NotReady;
        }
        match (&w.raw, w.decoded_discard) {
            (Some(raw), Some(discard)) => PollResult::Ready {
                discard,
                raw: raw.clone(),
                aux: w.aux.clone(),
            },
            _ => PollResult::Aborted,
        }
    }

    // ---- completion entry points (engine callbacks) ----

    pub fn on_cache_read(&self, outcome: CacheReadOutcome) {
        let mut w = self.inner.lock().unwrap();
        w.cache_read_pending = false;
        w.inbox_cache_read = Some(outcome);
    }

    pub fn on_http(&self, outcome: HttpOutcome) {
        let mut w = self.inner.lock().unwrap();
        w.http_pending = false;
        w.inbox_http = Some(outcome);
    }

    pub fn on_decode(&self, result: Result<DecodedImage, FetchError>) {
        let mut w = self.inner.lock().unwrap();
        w.decode_pending = false;
        w.inbox_decode = Some(result);
    }

    /// Swap the placeholder write handle for the real one, unless the write
    /// already completed.
    pub(crate) fn assign_cache_write_handle(&self, handle: u64) {
        let mut w = self.inner.lock().unwrap();
        if w.cache_write_handle == Some(0) {
            w.cache_write_handle = Some(handle);
        }
    }

    pub fn on_cache_write(&self, result: Result<(), FetchError>) {
        let mut w = self.inner.lock().unwrap();
        w.cache_write_handle = None;
        w.inbox_cache_write = Some(result);
    }

    /// Inbound sim header. Only valid while this worker is actually waiting
    /// on the simulator.
    pub fn receive_header(
        &self,
        codec: CodecTag,
        total_packets: u16,
        total_bytes: u32,
        payload: Vec<u8>,
    ) -> Result<(), InsertError> {
        let mut w = self.inner.lock().unwrap();
        let awaiting = matches!(
            w.state,
            FetchState::LoadFromNetwork | FetchState::LoadFromSim
        ) && w.sent_udp_request;
        if !awaiting {
            return Err(InsertError::NotExpected);
        }
        w.assembler
            .insert_header(codec, total_packets, total_bytes as usize, payload)?;
        w.state = FetchState::LoadFromSim;
        Ok(())
    }

    pub fn receive_packet(&self, index: u16, payload: Vec<u8>) -> Result<(), InsertError> {
        let mut w = self.inner.lock().unwrap();
        if !matches!(
            w.state,
            FetchState::LoadFromNetwork | FetchState::LoadFromSim
        ) {
            return Err(InsertError::NotExpected);
        }
        w.assembler.insert(index, payload)
    }

    /// Called from the engine's network sweep: decide whether this asset
    /// needs a (re-)request from its sim, and mark it sent if so.
    pub fn plan_sim_request(&self) -> Option<SimRequestPlan> {
        let mut w = self.inner.lock().unwrap();
        if !matches!(
            w.state,
            FetchState::LoadFromNetwork | FetchState::LoadFromSim
        ) {
            return None;
        }
        if w.assembler.complete() {
            return None;
        }
        let host = w.host.clone()?;

        let desired = w.desired_discard as i8;
        let elapsed = w
            .sim_request_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        let needs_send = !w.sent_udp_request
            || w.sim_requested_discard != desired
            || ((w.priority - w.sim_request_priority).abs() > MIN_DELTA_PRIORITY
                && elapsed >= MIN_REQUEST_TIME)
            || elapsed >= SIM_LAZY_FLUSH_TIMEOUT;
        if !needs_send {
            return None;
        }

        w.sent_udp_request = true;
        w.sim_requested_discard = desired;
        w.sim_request_time = Some(Instant::now());
        w.sim_request_priority = w.priority;

        let next_packet = w.assembler.next_needed();
        Some(SimRequestPlan {
            host,
            discard: desired,
            priority: w.priority,
            next_packet,
            image_type: w.image_type,
        })
    }

    /// Detach from the service queue bookkeeping on deletion. Returns the
    /// held service handle (for registry release) and whether the worker was
    /// still pending in it.
    pub(crate) fn take_service(&self) -> (Option<Arc<PerServiceQueue>>, Option<CapabilityClass>) {
        let mut w = self.inner.lock().unwrap();
        let pending = if w.queued_in_service {
            w.queued_in_service = false;
            Some(w.class)
        } else {
            None
        };
        (w.service.take(), pending)
    }

    // ---- the state machine ----

    pub(crate) fn step(&self, env: &dyn WorkerEnv) -> StepAction {
        let mut w = self.inner.lock().unwrap();
        match w.state {
            FetchState::Init => self.step_init(&mut w, env),
            FetchState::LoadFromCache => self.step_load_from_cache(&mut w),
            FetchState::CachePost => self.step_cache_post(&mut w),
            FetchState::LoadFromNetwork => self.step_load_from_network(&mut w, env),
            FetchState::LoadFromSim => self.step_load_from_sim(&mut w),
            FetchState::SendHttp => self.step_send_http(&mut w, env),
            FetchState::WaitHttp => self.step_wait_http(&mut w),
            FetchState::Decode => self.step_decode(&mut w),
            FetchState::WaitDecode => self.step_wait_decode(&mut w),
            FetchState::WriteToCache => self.step_write_to_cache(&mut w),
            FetchState::WaitOnWrite => self.step_wait_on_write(&mut w),
            FetchState::Done => StepAction::Finished,
        }
    }

    fn step_init(&self, w: &mut WorkerInner, env: &dyn WorkerEnv) -> StepAction {
        // per-attempt scratch; the codec tag survives inside FormattedBytes
        w.formatted.clear();
        w.assembler = PacketAssembler::new();
        w.inbox_cache_read = None;
        w.inbox_http = None;
        w.inbox_decode = None;
        w.inbox_cache_write = None;
        w.http_failures = 0;
        w.http_attempts = 0;
        w.sent_udp_request = false;
        w.sim_requested_discard = -1;
        w.sim_request_time = None;
        w.write_to_cache = false;
        w.was_cached = false;

        if env.asset_blacklisted(self.id) {
            w.state = FetchState::Done;
            return StepAction::Finished;
        }
        w.state = FetchState::LoadFromCache;
        StepAction::Continue
    }

    fn step_load_from_cache(&self, w: &mut WorkerInner) -> StepAction {
        if let Some(outcome) = w.inbox_cache_read.take() {
            match outcome {
                CacheReadOutcome::Hit { bytes, known_total } => {
                    if !bytes.is_empty() {
                        w.was_cached = true;
                        w.formatted.data.extend_from_slice(&bytes);
                    }
                    if known_total.is_some() {
                        w.formatted.total = known_total;
                    }
                }
                CacheReadOutcome::Miss | CacheReadOutcome::Corrupt => {}
            }
            w.state = FetchState::CachePost;
            return StepAction::Continue;
        }
        if w.cache_read_pending {
            return StepAction::Park;
        }
        if let Some(path) = is_file_url(&w.url) {
            w.cache_read_pending = true;
            return StepAction::ReadFile { path };
        }
        let offset = w.formatted.len();
        if offset >= w.desired_size {
            w.state = FetchState::CachePost;
            return StepAction::Continue;
        }
        w.cache_read_pending = true;
        StepAction::ReadCache {
            offset,
            size: w.desired_size - offset,
        }
    }

    fn step_cache_post(&self, w: &mut WorkerInner) -> StepAction {
        if (w.formatted.len() >= w.desired_size && !w.formatted.is_empty())
            || w.formatted.have_all()
        {
            w.write_to_cache = false;
            w.state = FetchState::Decode;
            return StepAction::Continue;
        }
        if is_file_url(&w.url).is_some() {
            // a local file either satisfies the request or never will
            if !w.formatted.is_empty() {
                w.write_to_cache = false;
                w.state = FetchState::Decode;
            } else {
                w.state = FetchState::Done;
                return StepAction::Finished;
            }
            return StepAction::Continue;
        }
        w.state = FetchState::LoadFromNetwork;
        StepAction::Continue
    }

    fn step_load_from_network(&self, w: &mut WorkerInner, env: &dyn WorkerEnv) -> StepAction {
        if w.can_use_http && w.url.is_none() {
            w.url = env.url_for(self.id, w.host.as_deref());
        }
        if w.can_use_http {
            match &w.url {
                Some(u) => {
                    if env.host_blacklisted(u) {
                        w.can_use_http = false;
                    }
                }
                None => w.can_use_http = false,
            }
        }
        if w.can_use_http {
            w.write_to_cache = true;
            w.state = FetchState::SendHttp;
            return StepAction::Continue;
        }

        let udp_ok = w.can_use_udp && env.udp_available() && w.host.is_some();
        if udp_ok {
            if !w.in_udp_queue {
                w.in_udp_queue = true;
                w.write_to_cache = true;
                w.assembler.reset(&w.formatted.data, w.desired_size);
                return StepAction::EnqueueUdp;
            }
            // request batches go out with the engine's network sweep
            return StepAction::Park;
        }

        w.state = FetchState::Done;
        StepAction::Finished
    }

    fn step_load_from_sim(&self, w: &mut WorkerInner) -> StepAction {
        if let Some(prefix) = w.assembler.deliverable_prefix() {
            if w.assembler.total_bytes() > 0 {
                w.formatted.total = Some(w.assembler.total_bytes());
            }
            if w.formatted.codec.is_none() {
                w.formatted.codec = w.assembler.codec();
            }
            w.formatted.data = prefix;
            w.write_to_cache = true;
            w.immediate = true;
            w.state = FetchState::Decode;
            let host = w.host.clone();
            let was_requested = w.sent_udp_request;
            w.in_udp_queue = false;
            return StepAction::CancelUdp {
                host,
                was_requested,
            };
        }
        StepAction::Park
    }

    fn step_send_http(&self, w: &mut WorkerInner, env: &dyn WorkerEnv) -> StepAction {
        if w.queued_in_service {
            // waiting for the scheduler to attach us
            return StepAction::Park;
        }
        if w.http_attempts >= HTTP_MAX_ATTEMPTS {
            return self.http_give_up(w);
        }
        let url = match &w.url {
            Some(u) => u.clone(),
            None => {
                w.state = FetchState::LoadFromNetwork;
                return StepAction::Continue;
            }
        };
        let service = match w.service.clone() {
            Some(s) => s,
            None => {
                let s = env.service_for(&url);
                w.service = Some(Arc::clone(&s));
                s
            }
        };
        w.queued_in_service = true;
        StepAction::EnqueueHttp {
            service,
            class: w.class,
        }
    }

    /// The scheduler attached us: compute the byte range and move to WaitHttp.
    /// Returns None when the worker moved on (cancelled) in the meantime.
    pub(crate) fn begin_http_request(&self) -> Option<(String, usize, usize)> {
        let mut w = self.inner.lock().unwrap();
        if w.state != FetchState::SendHttp || w.flagged_for_delete {
            w.queued_in_service = false;
            return None;
        }
        let url = w.url.clone()?;
        let cur = w.formatted.len();
        let mut offset = cur;
        let mut size = w.desired_size.saturating_sub(cur).max(1);
        if offset > 0 {
            // widen the window one byte into data we already hold: some
            // intermediate caches answer an exact-tail range with 200 and the
            // whole body, and this keeps them honest with a 206
            offset -= 1;
            size += 1;
        }
        w.queued_in_service = false;
        w.http_requested_offset = offset;
        w.http_requested_size = size;
        w.http_pending = true;
        w.http_attempts += 1;
        w.state = FetchState::WaitHttp;
        Some((url, offset, size))
    }

    fn step_wait_http(&self, w: &mut WorkerInner) -> StepAction {
        let outcome = match w.inbox_http.take() {
            Some(o) => o,
            None => return StepAction::Park,
        };
        match outcome {
            HttpOutcome::Success { status, body } => {
                self.append_http_body(w, status, body);
                w.write_to_cache = true;
                w.immediate = true;
                if w.formatted.codec.is_none() {
                    w.formatted.codec = w
                        .url
                        .as_deref()
                        .and_then(CodecTag::from_url)
                        .or(Some(CodecTag::J2c));
                }
                w.state = FetchState::Decode;
                StepAction::Continue
            }
            HttpOutcome::NotFound | HttpOutcome::Unreachable => {
                // engine already blacklisted the endpoint
                self.http_fall_back(w)
            }
            HttpOutcome::Busy => {
                // service overloaded; retry, bounded only by the attempt cap
                w.state = FetchState::SendHttp;
                StepAction::Continue
            }
            HttpOutcome::Timeout => {
                w.state = FetchState::Done;
                StepAction::Finished
            }
            HttpOutcome::Error { .. } => {
                w.http_failures += 1;
                if w.http_failures >= HTTP_MAX_RETRIES {
                    self.http_give_up(w)
                } else {
                    w.state = FetchState::SendHttp;
                    StepAction::Continue
                }
            }
        }
    }

    /// Append a range response, skipping whatever overlaps bytes already held.
    fn append_http_body(&self, w: &mut WorkerInner, status: u16, body: Vec<u8>) {
        let offset = w.http_requested_offset;
        let req_size = w.http_requested_size;
        let held = w.formatted.len();

        if body.is_empty() {
            // the asset ends exactly where we stand
            w.formatted.total = Some(held);
            return;
        }
        if status != 206 && offset > 0 {
            // server ignored the Range header and sent the whole asset
            w.formatted.data = body;
            w.formatted.total = Some(w.formatted.len());
            return;
        }
        if offset <= held {
            let skip = held - offset;
            if skip < body.len() {
                let short = body.len() < req_size;
                w.formatted.data.extend_from_slice(&body[skip..]);
                if short {
                    w.formatted.total = Some(w.formatted.len());
                }
            }
        } else {
            // response ahead of our buffer; unusable, treat as end-of-data so
            // decode works with what we have
            w.formatted.total = Some(held);
        }
        if status == 200 && offset == 0 {
            w.formatted.total = Some(w.formatted.len());
        }
    }

    /// HTTP is done failing: decode a partial buffer, fall back to UDP, or
    /// fail outright.
    fn http_give_up(&self, w: &mut WorkerInner) -> StepAction {
        if !w.formatted.is_empty() {
            w.state = FetchState::Decode;
            return StepAction::Continue;
        }
        self.http_fall_back(w)
    }

    fn http_fall_back(&self, w: &mut WorkerInner) -> StepAction {
        if w.can_use_udp && w.host.is_some() {
            w.can_use_http = false;
            w.formatted.clear();
            w.was_cached = false;
            w.state = FetchState::Init;
            StepAction::Continue
        } else {
            w.state = FetchState::Done;
            StepAction::Finished
        }
    }

    fn step_decode(&self, w: &mut WorkerInner) -> StepAction {
        if w.formatted.is_empty() {
            w.state = FetchState::Done;
            return StepAction::Finished;
        }
        let codec = w.formatted.codec.unwrap_or(CodecTag::J2c);
        w.decode_pending = true;
        w.state = FetchState::WaitDecode;
        StepAction::SubmitDecode {
            codec,
            bytes: w.formatted.data.clone(),
            discard: w.desired_discard,
            need_aux: w.needs_aux,
        }
    }

    fn step_wait_decode(&self, w: &mut WorkerInner) -> StepAction {
        let result = match w.inbox_decode.take() {
            Some(r) => r,
            None => return StepAction::Park,
        };
        match result {
            Ok(img) => {
                w.decoded_discard = Some(img.discard);
                w.raw = Some(img.raw);
                w.aux = img.aux;
                w.state = FetchState::WriteToCache;
                StepAction::Continue
            }
            Err(_) => {
                if w.was_cached && !w.decode_retried {
                    // cached bytes would not decode: assume corruption, drop
                    // the entry and start over from the network
                    w.decode_retried = true;
                    w.formatted.clear();
                    w.was_cached = false;
                    w.state = FetchState::Init;
                    StepAction::RemoveCacheEntry
                } else {
                    w.state = FetchState::Done;
                    StepAction::Finished
                }
            }
        }
    }

    fn step_write_to_cache(&self, w: &mut WorkerInner) -> StepAction {
        if !w.write_to_cache || w.formatted.is_empty() {
            w.state = FetchState::Done;
            return StepAction::Finished;
        }
        w.state = FetchState::WaitOnWrite;
        // placeholder until the cache hands back the real handle; an inline
        // cache may complete (and clear this) before that happens
        w.cache_write_handle = Some(0);
        StepAction::WriteCache {
            bytes: w.formatted.data.clone(),
            file_size: w.formatted.file_size_for_cache(),
        }
    }

    fn step_wait_on_write(&self, w: &mut WorkerInner) -> StepAction {
        if w.inbox_cache_write.take().is_some() {
            w.state = FetchState::Done;
            return StepAction::Finished;
        }
        StepAction::Park
    }
}

/// One entry for an outgoing sim request batch.
#[derive(Clone, Debug)]
pub struct SimRequestPlan {
    pub host: String,
    pub discard: i8,
    pub priority: f32,
    pub next_packet: u32,
    pub image_type: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_queue::ServiceRegistry;

    struct NullEnv {
        registry: Arc<ServiceRegistry>,
    }

    impl NullEnv {
        fn new() -> NullEnv {
            NullEnv {
                registry: Arc::new(ServiceRegistry::new(8, 32)),
            }
        }
    }

    impl WorkerEnv for NullEnv {
        fn asset_blacklisted(&self, _id: AssetId) -> bool {
            false
        }
        fn host_blacklisted(&self, _url: &str) -> bool {
            false
        }
        fn url_for(&self, _id: AssetId, _host: Option<&str>) -> Option<String> {
            None
        }
        fn service_for(&self, url: &str) -> Arc<PerServiceQueue> {
            self.registry
                .instance(&crate::service_name::service_name_from_url(url))
        }
        fn udp_available(&self) -> bool {
            false
        }
    }

    fn worker() -> Arc<FetchWorker> {
        FetchWorker::new(
            AssetId(7),
            Some("http://host.example/cap/?texture_id=x".to_string()),
            None,
            CapabilityClass::ApprovedTexture,
            0,
            1000.0,
            0,
            4000,
            false,
            true,
            false,
        )
    }

    #[test]
    fn test_init_goes_to_cache() {
        let wk = worker();
        let env = NullEnv::new();
        assert!(matches!(wk.step(&env), StepAction::Continue));
        assert_eq!(wk.state(), FetchState::LoadFromCache);
        match wk.step(&env) {
            StepAction::ReadCache { offset, size } => {
                assert_eq!(offset, 0);
                assert_eq!(size, 4000);
            }
            _ => panic!("expected cache read"),
        }
    }

    #[test]
    fn test_priority_hysteresis() {
        let wk = worker();
        assert!(!wk.set_priority(1040.0)); // 4% change: absorbed
        assert!(wk.set_priority(2000.0)); // large change: re-sort
    }

    #[test]
    fn test_set_desired_reentry_only_for_finer() {
        let wk = worker();
        {
            let mut w = wk.inner.lock().unwrap();
            w.state = FetchState::Done;
            w.decoded_discard = Some(2);
            w.raw = Some(RawImage::new(4, 4, 3, vec![0; 48]));
        }
        assert!(!wk.set_desired(3, 0)); // coarser: stays Done
        assert_eq!(wk.state(), FetchState::Done);
        assert!(wk.set_desired(1, 8000)); // finer: re-enters
        assert_eq!(wk.state(), FetchState::Init);
    }

    #[test]
    fn test_http_realign_skips_overlap() {
        let wk = worker();
        {
            let mut w = wk.inner.lock().unwrap();
            w.formatted.data = vec![1u8; 90];
            w.http_requested_offset = 80;
            w.http_requested_size = 1000;
            wk.append_http_body(&mut w, 206, vec![2u8; 200]);
            assert_eq!(w.formatted.len(), 90 + 200 - 10);
            // short response marks the asset complete
            assert_eq!(w.formatted.total, Some(280));
        }
    }

    #[test]
    fn test_http_200_restart_replaces_buffer() {
        let wk = worker();
        {
            let mut w = wk.inner.lock().unwrap();
            w.formatted.data = vec![1u8; 500];
            w.http_requested_offset = 499;
            w.http_requested_size = 3501;
            wk.append_http_body(&mut w, 200, vec![9u8; 3980]);
            assert_eq!(w.formatted.len(), 3980);
            assert_eq!(w.formatted.total, Some(3980));
        }
    }

    #[test]
    fn test_range_expansion_on_resume() {
        let wk = worker();
        {
            let mut w = wk.inner.lock().unwrap();
            w.formatted.data = vec![1u8; 1000];
            w.state = FetchState::SendHttp;
        }
        let (_url, offset, size) = wk.begin_http_request().unwrap();
        assert_eq!(offset, 999);
        assert_eq!(size, 4000 - 1000 + 1);
    }

    #[test]
    fn test_delete_gated_on_handles() {
        let wk = worker();
        assert!(wk.delete_ok());
        wk.inner.lock().unwrap().cache_write_handle = Some(3);
        assert!(!wk.delete_ok());
        wk.on_cache_write(Ok(()));
        assert!(wk.delete_ok());
    }
}
