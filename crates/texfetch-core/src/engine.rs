//! The fetch engine: owns the worker map, runs the priority loop, dispatches
//! HTTP through the per-service scheduler, batches UDP requests, and fans
//! inbound packets back to workers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel;
use dashmap::DashMap;

use crate::asset::{
    AssetId, CodecTag, MAX_DISCARD, MAX_IMAGE_DATA_SIZE, TEXTURE_CACHE_ENTRY_SIZE,
};
use crate::blacklist::{HostBlacklist, BLACKLIST_TIMEOUT};
use crate::cache::{BlobCache, CacheReadOutcome};
use crate::codec::Codec;
use crate::config::Config;
use crate::http::{HttpAdmission, HttpOutcome, HttpTransport};
use crate::metrics::{FetchMetrics, MetricsSnapshot};
use crate::pool::{JobPool, RunQueue};
use crate::service_name::service_name_from_url;
use crate::service_queue::{
    AddOutcome, CapabilityClass, DispatchedRequest, PerServiceQueue, RequestSink, ServiceRegistry,
    ServiceRequest,
};
use crate::udp::{ImageRequest, RequestBatch, SimTransport, IMAGES_PER_REQUEST};
use crate::utils;
use crate::worker::{FetchState, FetchWorker, PollResult, StepAction, WorkerEnv};

/// Hands out asset-fetch URLs for a host, typically from a region capability.
pub trait UrlProvider: Send + Sync {
    fn url_for(&self, id: AssetId, host: Option<&str>) -> Option<String>;
}

/// Everything the caller wants fetched, as one record.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub id: AssetId,
    pub url: Option<String>,
    pub host: Option<String>,
    pub priority: f32,
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub desired_discard: u8,
    pub needs_aux: bool,
    pub can_use_http: bool,
}

impl FetchRequest {
    pub fn new(id: AssetId) -> FetchRequest {
        FetchRequest {
            id,
            url: None,
            host: None,
            priority: 0.0,
            width: 0,
            height: 0,
            components: 0,
            desired_discard: 0,
            needs_aux: false,
            can_use_http: true,
        }
    }
}

pub struct EngineOptions {
    pub config: Config,
    pub cache: Arc<dyn BlobCache>,
    pub codec: Arc<dyn Codec>,
    pub http: Arc<dyn HttpTransport>,
    pub udp: Option<Arc<dyn SimTransport>>,
    pub url_provider: Option<Arc<dyn UrlProvider>>,
    /// Defaults to the process-wide registry; tests pass a private one.
    pub registry: Option<Arc<ServiceRegistry>>,
    pub agent_id: AssetId,
    pub session_id: AssetId,
}

#[derive(Clone, Copy, Debug)]
pub struct EngineStats {
    pub workers: usize,
    pub queued: usize,
    pub active_http: u32,
    pub udp_pending: usize,
    pub metrics: MetricsSnapshot,
}

struct EngineShared {
    config: Config,
    workers: DashMap<AssetId, Arc<FetchWorker>>,
    run_queue: RunQueue,
    registry: Arc<ServiceRegistry>,
    admission: HttpAdmission,
    http_transport: Arc<dyn HttpTransport>,
    http_pool: Arc<JobPool>,
    cache: Arc<dyn BlobCache>,
    codec: Arc<dyn Codec>,
    decode_pool: Arc<JobPool>,
    udp: Option<Arc<dyn SimTransport>>,
    udp_queue: Mutex<HashSet<AssetId>>,
    udp_cancels: Mutex<Vec<(String, AssetId)>>,
    host_blacklist: HostBlacklist,
    asset_blacklist: HashSet<AssetId>,
    url_provider: Option<Arc<dyn UrlProvider>>,
    metrics: Arc<FetchMetrics>,
    network_ready: AtomicBool,
    last_sweep: Mutex<Instant>,
    last_drain: Mutex<Instant>,
    agent_id: AssetId,
    session_id: AssetId,
}

impl WorkerEnv for EngineShared {
    fn asset_blacklisted(&self, id: AssetId) -> bool {
        self.asset_blacklist.contains(&id)
    }

    fn host_blacklisted(&self, url: &str) -> bool {
        self.host_blacklist.is_blacklisted(url)
    }

    fn url_for(&self, id: AssetId, host: Option<&str>) -> Option<String> {
        self.url_provider.as_ref().and_then(|p| p.url_for(id, host))
    }

    fn service_for(&self, url: &str) -> Arc<PerServiceQueue> {
        self.registry.instance(&service_name_from_url(url))
    }

    fn udp_available(&self) -> bool {
        self.config.udp_enabled && self.udp.is_some()
    }
}

impl RequestSink for EngineShared {
    fn add(
        &self,
        _service: &Arc<PerServiceQueue>,
        _class: CapabilityClass,
        _request: &Arc<dyn ServiceRequest>,
    ) -> AddOutcome {
        if !self.admission.admit() {
            return AddOutcome::Throttled;
        }
        self.admission.attach();
        AddOutcome::Added
    }
}

pub struct FetchEngine {
    shared: Arc<EngineShared>,
    fetch_handles: Mutex<Vec<JoinHandle<()>>>,
    ticker_stop: Mutex<Option<channel::Sender<()>>>,
    ticker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FetchEngine {
    pub fn new(options: EngineOptions) -> FetchEngine {
        let config = options.config;
        let registry = options
            .registry
            .unwrap_or_else(ServiceRegistry::global);
        let shared = Arc::new(EngineShared {
            admission: HttpAdmission::new(
                config.http_max_requests,
                config.http_min_requests,
                config.http_throttle_bps,
            ),
            workers: DashMap::new(),
            run_queue: RunQueue::new(),
            registry,
            http_transport: options.http,
            http_pool: JobPool::new(
                "texfetch-http",
                if config.fetch_threads == 0 {
                    0
                } else {
                    config.http_max_requests as usize
                },
            ),
            cache: options.cache,
            codec: options.codec,
            decode_pool: JobPool::new(
                "texfetch-decode",
                if config.fetch_threads == 0 {
                    0
                } else {
                    config.decode_threads
                },
            ),
            udp: options.udp,
            udp_queue: Mutex::new(HashSet::new()),
            udp_cancels: Mutex::new(Vec::new()),
            host_blacklist: HostBlacklist::new(),
            asset_blacklist: config.asset_blacklist.iter().cloned().collect(),
            url_provider: options.url_provider,
            metrics: FetchMetrics::new(),
            network_ready: AtomicBool::new(true),
            // let the first tick sweep immediately
            last_sweep: Mutex::new(Instant::now() - Duration::from_secs(1)),
            last_drain: Mutex::new(Instant::now()),
            agent_id: options.agent_id,
            session_id: options.session_id,
            config,
        });

        let engine = FetchEngine {
            shared: Arc::clone(&shared),
            fetch_handles: Mutex::new(Vec::new()),
            ticker_stop: Mutex::new(None),
            ticker_handle: Mutex::new(None),
        };
        engine.spawn_fetch_threads();
        engine
    }

    fn spawn_fetch_threads(&self) {
        let n = self.shared.config.fetch_threads;
        let mut handles = self.fetch_handles.lock().unwrap();
        for i in 0..n {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("texfetch-worker-{}", i))
                .spawn(move || {
                    while let Some(id) = shared.run_queue.pop_blocking() {
                        if let Some(wk) = shared.get_worker(id) {
                            shared.advance(&wk);
                        }
                    }
                })
                .expect("spawn fetch thread");
            handles.push(handle);
        }
    }

    /// Run `tick` on a background thread until shutdown.
    pub fn start_ticker(&self) {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let interval = Duration::from_millis(self.shared.config.sweep_interval_ms.max(10));
        let ticker = channel::tick(interval);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("texfetch-tick".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => shared.tick(),
                    recv(stop_rx) -> _ => return,
                }
            })
            .expect("spawn ticker");
        *self.ticker_stop.lock().unwrap() = Some(stop_tx);
        *self.ticker_handle.lock().unwrap() = Some(handle);
    }

    /// Gate UDP traffic until the embedder's transports are actually live.
    pub fn set_network_ready(&self, ready: bool) {
        self.shared.network_ready.store(ready, Ordering::Relaxed);
    }

    /// Register or refresh a fetch. Returns false when the request conflicts
    /// with an existing worker on a different host (the stale worker is
    /// dropped so the next call starts clean).
    pub fn create_request(&self, req: FetchRequest) -> bool {
        if let Some(existing) = self.shared.get_worker(req.id) {
            let same_host = {
                let w = existing.inner.lock().unwrap();
                w.host == req.host
            };
            if !same_host {
                self.delete_request(req.id, true);
                return false;
            }
            self.update_priority(req.id, req.priority);
            let size = self.shared.desired_size_for(&req).1;
            self.update_desired(req.id, req.desired_discard, size);
            return true;
        }

        let (desired_discard, desired_size) = self.shared.desired_size_for(&req);
        let class = if req.url.is_some() {
            CapabilityClass::Texture
        } else {
            CapabilityClass::ApprovedTexture
        };
        let worker = FetchWorker::new(
            req.id,
            req.url,
            req.host,
            class,
            0,
            req.priority,
            desired_discard,
            desired_size,
            req.needs_aux,
            req.can_use_http,
            self.shared.config.udp_enabled,
        );
        self.shared.workers.insert(req.id, Arc::clone(&worker));
        self.shared.wake(&worker);
        true
    }

    pub fn update_priority(&self, id: AssetId, priority: f32) {
        if let Some(wk) = self.shared.get_worker(id) {
            if wk.set_priority(priority) && wk.state() != FetchState::Done {
                self.shared.run_queue.push(id, wk.work_priority());
            }
        }
    }

    pub fn update_desired(&self, id: AssetId, discard: u8, size: usize) {
        if let Some(wk) = self.shared.get_worker(id) {
            let prioritize_pending_write = {
                let w = wk.inner.lock().unwrap();
                w.state == FetchState::WaitOnWrite
                    && w.decoded_discard.map_or(false, |d| discard < d)
            };
            if prioritize_pending_write {
                // get the old buffer onto disk sooner so the finer fetch can
                // replace it
                if let Some(h) = wk.inner.lock().unwrap().cache_write_handle {
                    self.shared.cache.prioritize_write(h);
                }
            }
            if wk.set_desired(discard, size) {
                self.shared.wake(&wk);
            }
        }
    }

    /// Flag a worker for removal. With `cancel`, pending queue entries and
    /// UDP interest are dropped immediately; either way the worker is only
    /// reaped once its outstanding cache/decode handles drain.
    pub fn delete_request(&self, id: AssetId, cancel: bool) {
        let Some(wk) = self.shared.get_worker(id) else {
            return;
        };
        wk.flag_for_delete();
        if cancel {
            self.shared.detach_worker(&wk);
        }
        if wk.delete_ok() {
            self.shared.reap(&wk);
        }
    }

    pub fn poll_finished(&self, id: AssetId) -> PollResult {
        match self.shared.get_worker(id) {
            Some(wk) => wk.poll(),
            None => PollResult::Aborted,
        }
    }

    /// Inbound UDP header fan-in. Anything malformed cancels the asset with
    /// the sending host.
    pub fn receive_image_header(
        &self,
        host: &str,
        id: AssetId,
        codec: CodecTag,
        total_packets: u16,
        total_bytes: u32,
        payload: Vec<u8>,
    ) {
        self.shared.metrics.udp_packets.fetch_add(1, Ordering::Relaxed);
        let Some(wk) = self.shared.get_worker(id) else {
            self.shared.schedule_udp_cancel(host, id);
            return;
        };
        if payload.is_empty() {
            self.shared.schedule_udp_cancel(host, id);
            return;
        }
        match wk.receive_header(codec, total_packets, total_bytes, payload) {
            Ok(()) => self.shared.wake(&wk),
            Err(e) => {
                utils::log_error(&format!("udp header rejected for {}: {:?}", id, e));
                self.shared.schedule_udp_cancel(host, id);
            }
        }
    }

    pub fn receive_image_packet(&self, host: &str, id: AssetId, packet_num: u16, payload: Vec<u8>) {
        self.shared.metrics.udp_packets.fetch_add(1, Ordering::Relaxed);
        let Some(wk) = self.shared.get_worker(id) else {
            self.shared.schedule_udp_cancel(host, id);
            return;
        };
        if payload.is_empty() {
            self.shared.schedule_udp_cancel(host, id);
            return;
        }
        match wk.receive_packet(packet_num, payload) {
            Ok(()) => self.shared.wake(&wk),
            Err(e) => {
                utils::log_error(&format!("udp packet {} rejected for {}: {:?}", packet_num, id, e));
                self.shared.schedule_udp_cancel(host, id);
            }
        }
    }

    /// One engine heartbeat: refresh bandwidth accounting, emit UDP batches,
    /// advance ready workers (when running inline), and pump the scheduler.
    pub fn tick(&self) {
        self.shared.tick();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            workers: self.shared.workers.len(),
            queued: self.shared.registry.total_queued(),
            active_http: self.shared.admission.active(),
            udp_pending: self.shared.udp_queue.lock().unwrap().len(),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    pub fn metrics(&self) -> Arc<FetchMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn shutdown(&self) {
        if let Some(stop) = self.ticker_stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
        if let Some(h) = self.ticker_handle.lock().unwrap().take() {
            let _ = h.join();
        }
        self.shared.run_queue.shutdown();
        let handles: Vec<_> = self.fetch_handles.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
        self.shared.http_pool.shutdown();
        self.shared.decode_pool.shutdown();
    }
}

impl EngineShared {
    fn get_worker(&self, id: AssetId) -> Option<Arc<FetchWorker>> {
        // clone out so no map shard lock is held while the worker runs
        self.workers.get(&id).map(|r| Arc::clone(r.value()))
    }

    fn desired_size_for(&self, req: &FetchRequest) -> (u8, usize) {
        let non_j2c = req
            .url
            .as_deref()
            .and_then(CodecTag::from_url)
            .map_or(false, |c| c != CodecTag::J2c);
        if non_j2c || req.desired_discard == 0 {
            return (req.desired_discard, MAX_IMAGE_DATA_SIZE);
        }
        if req.width > 0 && req.height > 0 && req.components > 0 {
            let size = self.codec.size_for(
                req.width,
                req.height,
                req.components,
                req.desired_discard,
            );
            return (req.desired_discard, size);
        }
        (MAX_DISCARD, TEXTURE_CACHE_ENTRY_SIZE)
    }

    fn wake(self: &Arc<Self>, worker: &Arc<FetchWorker>) {
        if worker.flagged_for_delete() && worker.delete_ok() {
            self.reap(worker);
            return;
        }
        // a flagged worker with a decided cache write still runs to Done
        self.run_queue.push(worker.id, worker.work_priority());
    }

    /// Drive one worker until it parks on I/O or finishes. Runs on a fetch
    /// thread, or inline from tick().
    fn advance(self: &Arc<Self>, worker: &Arc<FetchWorker>) {
        loop {
            if worker.flagged_for_delete() && worker.delete_ok() {
                self.reap(worker);
                return;
            }
            match worker.step(self.as_ref()) {
                StepAction::Continue => continue,
                StepAction::Park => return,
                StepAction::Finished => {
                    if worker.flagged_for_delete() && worker.delete_ok() {
                        self.reap(worker);
                    }
                    return;
                }
                StepAction::ReadCache { offset, size } => {
                    let wk = Arc::clone(worker);
                    let shared = Arc::clone(self);
                    self.cache.read(
                        worker.id,
                        offset,
                        size,
                        Box::new(move |outcome| {
                            if matches!(&outcome, CacheReadOutcome::Hit { bytes, .. } if !bytes.is_empty())
                            {
                                shared.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                            }
                            wk.on_cache_read(outcome);
                            shared.wake(&wk);
                        }),
                    );
                    return;
                }
                StepAction::ReadFile { path } => {
                    let wk = Arc::clone(worker);
                    let shared = Arc::clone(self);
                    self.http_pool.submit(Box::new(move || {
                        let outcome = match std::fs::read(&path) {
                            Ok(bytes) => {
                                let total = bytes.len();
                                CacheReadOutcome::Hit {
                                    bytes,
                                    known_total: Some(total),
                                }
                            }
                            Err(_) => CacheReadOutcome::Miss,
                        };
                        wk.on_cache_read(outcome);
                        shared.wake(&wk);
                    }));
                    return;
                }
                StepAction::EnqueueHttp { service, class } => {
                    let as_request: Arc<dyn ServiceRequest> = Arc::clone(worker) as _;
                    service.enqueue(class, as_request);
                    let mut dispatched = Vec::new();
                    service.add_queued_to(self.as_ref(), false, &self.registry, &mut dispatched);
                    self.start_dispatched(dispatched);
                    return;
                }
                StepAction::EnqueueUdp => {
                    self.udp_queue.lock().unwrap().insert(worker.id);
                    return;
                }
                StepAction::CancelUdp {
                    host,
                    was_requested,
                } => {
                    self.udp_queue.lock().unwrap().remove(&worker.id);
                    if was_requested {
                        if let Some(h) = host {
                            self.schedule_udp_cancel(&h, worker.id);
                        }
                    }
                    continue;
                }
                StepAction::SubmitDecode {
                    codec,
                    bytes,
                    discard,
                    need_aux,
                } => {
                    let wk = Arc::clone(worker);
                    let shared = Arc::clone(self);
                    let dec = Arc::clone(&self.codec);
                    self.decode_pool.submit(Box::new(move || {
                        shared.metrics.decodes.fetch_add(1, Ordering::Relaxed);
                        let result = dec.decode(codec, &bytes, discard, need_aux);
                        if result.is_err() {
                            shared.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                        }
                        wk.on_decode(result);
                        shared.wake(&wk);
                    }));
                    return;
                }
                StepAction::RemoveCacheEntry => {
                    self.cache.remove(worker.id);
                    continue;
                }
                StepAction::WriteCache { bytes, file_size } => {
                    let wk = Arc::clone(worker);
                    let shared = Arc::clone(self);
                    self.metrics.cache_writes.fetch_add(1, Ordering::Relaxed);
                    let handle = self.cache.write(
                        worker.id,
                        bytes,
                        file_size,
                        Box::new(move |result| {
                            wk.on_cache_write(result);
                            shared.wake(&wk);
                        }),
                    );
                    worker.assign_cache_write_handle(handle);
                    return;
                }
            }
        }
    }

    /// Start the HTTP transfer for every request the scheduler just popped.
    fn start_dispatched(self: &Arc<Self>, dispatched: Vec<DispatchedRequest>) {
        for d in dispatched {
            let id = d.request.asset_id();
            let Some(worker) = self.get_worker(id) else {
                self.admission.detach(0);
                d.service.request_done(d.class);
                continue;
            };
            match worker.begin_http_request() {
                None => {
                    self.admission.detach(0);
                    d.service.request_done(d.class);
                }
                Some((url, offset, size)) => {
                    let shared = Arc::clone(self);
                    let transport = Arc::clone(&self.http_transport);
                    let service = d.service;
                    let class = d.class;
                    self.http_pool.submit(Box::new(move || {
                        let outcome = transport.get(&url, offset, size);
                        shared.finish_http(&worker, &service, class, &url, outcome);
                    }));
                }
            }
        }
    }

    fn finish_http(
        self: &Arc<Self>,
        worker: &Arc<FetchWorker>,
        service: &Arc<PerServiceQueue>,
        class: CapabilityClass,
        url: &str,
        outcome: HttpOutcome,
    ) {
        let (success, bytes) = match &outcome {
            HttpOutcome::Success { body, .. } => (true, body.len() as u64),
            _ => (false, 0),
        };
        self.admission.detach(bytes);
        service.request_done(class);
        self.metrics.record_http(success, bytes);

        match &outcome {
            HttpOutcome::NotFound => {
                self.host_blacklist.ban(url, BLACKLIST_TIMEOUT, 404);
            }
            HttpOutcome::Unreachable => {
                self.host_blacklist.ban(url, BLACKLIST_TIMEOUT, 499);
            }
            HttpOutcome::Error { status, .. } => {
                self.host_blacklist.add(url, BLACKLIST_TIMEOUT, *status);
            }
            _ => {}
        }

        // a deleted worker's response is simply dropped
        if self.workers.contains_key(&worker.id) && !worker.flagged_for_delete() {
            worker.on_http(outcome);
            self.wake(worker);
        }

        // the freed slot may unblock someone
        let dispatched = self.registry.pump(self.as_ref());
        self.start_dispatched(dispatched);
    }

    fn schedule_udp_cancel(&self, host: &str, id: AssetId) {
        self.udp_cancels
            .lock()
            .unwrap()
            .push((host.to_string(), id));
    }

    /// Remove a worker's footprint from scheduler and UDP bookkeeping.
    fn detach_worker(self: &Arc<Self>, worker: &Arc<FetchWorker>) {
        self.run_queue.remove(worker.id);
        let (service, pending_class) = worker.take_service();
        if let Some(svc) = service {
            if let Some(class) = pending_class {
                svc.cancel(class, worker.id);
            }
            self.registry.release(svc);
        }
        self.udp_queue.lock().unwrap().remove(&worker.id);
        let cancel_host = {
            let w = worker.inner.lock().unwrap();
            if w.sent_udp_request { w.host.clone() } else { None }
        };
        if let Some(h) = cancel_host {
            self.schedule_udp_cancel(&h, worker.id);
        }
    }

    fn reap(self: &Arc<Self>, worker: &Arc<FetchWorker>) {
        self.detach_worker(worker);
        self.workers.remove(&worker.id);
    }

    fn tick(self: &Arc<Self>) {
        // bandwidth window refresh
        {
            let mut last = self.last_drain.lock().unwrap();
            let elapsed = last.elapsed();
            if elapsed >= Duration::from_millis(50) {
                *last = Instant::now();
                drop(last);
                self.admission.drain_bytes(elapsed);
            }
        }

        // network sweep, rate limited
        if self.network_ready.load(Ordering::Relaxed) {
            let due = {
                let mut last = self.last_sweep.lock().unwrap();
                let interval = Duration::from_millis(self.config.sweep_interval_ms);
                if last.elapsed() >= interval {
                    *last = Instant::now();
                    true
                } else {
                    false
                }
            };
            if due {
                self.send_udp_batches();
                self.send_udp_cancels();
            }
        }

        // inline mode: the tick thread is the fetch pool
        if self.config.fetch_threads == 0 {
            while let Some(id) = self.run_queue.try_pop() {
                if let Some(wk) = self.get_worker(id) {
                    self.advance(&wk);
                }
            }
        }

        let dispatched = self.registry.pump(self.as_ref());
        self.start_dispatched(dispatched);
    }

    fn send_udp_batches(self: &Arc<Self>) {
        let Some(udp) = self.udp.clone() else {
            return;
        };
        let ids: Vec<AssetId> = self.udp_queue.lock().unwrap().iter().cloned().collect();
        let mut by_host: HashMap<String, Vec<ImageRequest>> = HashMap::new();
        for id in ids {
            let Some(wk) = self.get_worker(id) else {
                self.udp_queue.lock().unwrap().remove(&id);
                continue;
            };
            if let Some(plan) = wk.plan_sim_request() {
                by_host.entry(plan.host).or_default().push(ImageRequest {
                    id,
                    discard: plan.discard,
                    priority: plan.priority,
                    next_packet: plan.next_packet,
                    image_type: plan.image_type,
                });
            }
        }
        for (host, entries) in by_host {
            for chunk in entries.chunks(IMAGES_PER_REQUEST) {
                let batch = RequestBatch {
                    agent_id: self.agent_id,
                    session_id: self.session_id,
                    entries: chunk.to_vec(),
                };
                match udp.send_request_batch(&host, &batch) {
                    Ok(()) => {
                        self.metrics
                            .udp_request_batches
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => utils::log_error(&format!("udp request batch to {}: {}", host, e)),
                }
            }
        }
    }

    fn send_udp_cancels(self: &Arc<Self>) {
        let Some(udp) = self.udp.clone() else {
            self.udp_cancels.lock().unwrap().clear();
            return;
        };
        let pending: Vec<(String, AssetId)> =
            self.udp_cancels.lock().unwrap().drain(..).collect();
        if pending.is_empty() {
            return;
        }
        let mut by_host: HashMap<String, Vec<AssetId>> = HashMap::new();
        for (host, id) in pending {
            by_host.entry(host).or_default().push(id);
        }
        for (host, ids) in by_host {
            for chunk in ids.chunks(IMAGES_PER_REQUEST) {
                if let Err(e) = udp.send_cancel_batch(&host, chunk) {
                    utils::log_error(&format!("udp cancel batch to {}: {}", host, e));
                }
            }
        }
    }
}
