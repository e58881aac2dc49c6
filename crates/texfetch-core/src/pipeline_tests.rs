//! End-to-end pipeline scenarios against in-memory collaborators: scripted
//! HTTP, a recording sim transport, an in-memory blob cache, and a codec that
//! chokes on a poison byte.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::asset::{AssetId, CodecTag, RawImage, FIRST_PACKET_SIZE, MAX_IMG_PACKET_SIZE};
use crate::cache::MemBlobCache;
use crate::codec::{Codec, DecodedImage};
use crate::config::Config;
use crate::engine::{EngineOptions, FetchEngine, FetchRequest, UrlProvider};
use crate::error_handling::{errors, FetchError};
use crate::http::{HttpOutcome, HttpTransport};
use crate::service_queue::ServiceRegistry;
use crate::udp::{RequestBatch, SimTransport};
use crate::worker::PollResult;

/// First byte that makes MockCodec refuse to decode.
const POISON: u8 = 0xBA;

struct MockCodec;

impl Codec for MockCodec {
    fn decode(
        &self,
        _codec: CodecTag,
        bytes: &[u8],
        target_discard: u8,
        need_aux: bool,
    ) -> Result<DecodedImage, FetchError> {
        if bytes.is_empty() || bytes[0] == POISON {
            return Err(errors::decode_error("decode", None, "bad stream"));
        }
        let raw = RawImage::new(bytes.len() as u32, 1, 1, bytes.to_vec());
        let aux = if need_aux {
            Some(RawImage::new(bytes.len() as u32, 1, 1, vec![0xFF; bytes.len()]))
        } else {
            None
        };
        Ok(DecodedImage {
            raw,
            aux,
            discard: target_discard,
        })
    }
}

/// Serves one asset with real range semantics, after draining any forced
/// outcomes. Records every request it sees.
#[derive(Default)]
struct MockHttp {
    asset: Mutex<Option<Vec<u8>>>,
    forced: Mutex<VecDeque<HttpOutcome>>,
    requests: Mutex<Vec<(String, usize, usize)>>,
}

impl MockHttp {
    fn new() -> Arc<MockHttp> {
        Arc::new(MockHttp::default())
    }

    fn serve(&self, bytes: Vec<u8>) {
        *self.asset.lock().unwrap() = Some(bytes);
    }

    fn force(&self, outcome: HttpOutcome) {
        self.forced.lock().unwrap().push_back(outcome);
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<(String, usize, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for MockHttp {
    fn get(&self, url: &str, offset: usize, size: usize) -> HttpOutcome {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), offset, size));
        if let Some(outcome) = self.forced.lock().unwrap().pop_front() {
            return outcome;
        }
        let asset = self.asset.lock().unwrap();
        match asset.as_ref() {
            None => HttpOutcome::NotFound,
            Some(bytes) => {
                let start = offset.min(bytes.len());
                let end = if size == 0 {
                    bytes.len()
                } else {
                    offset.saturating_add(size).min(bytes.len())
                };
                let body = bytes[start..end].to_vec();
                let status = if start == 0 && end == bytes.len() { 200 } else { 206 };
                HttpOutcome::Success { status, body }
            }
        }
    }
}

#[derive(Default)]
struct MockSim {
    requests: Mutex<Vec<(String, RequestBatch)>>,
    cancels: Mutex<Vec<(String, Vec<AssetId>)>>,
}

impl MockSim {
    fn new() -> Arc<MockSim> {
        Arc::new(MockSim::default())
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requested_ids(&self) -> Vec<AssetId> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, b)| b.entries.iter().map(|e| e.id))
            .collect()
    }

    fn cancelled_ids(&self) -> Vec<AssetId> {
        self.cancels
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }
}

impl SimTransport for MockSim {
    fn send_request_batch(&self, host: &str, batch: &RequestBatch) -> Result<(), String> {
        self.requests
            .lock()
            .unwrap()
            .push((host.to_string(), batch.clone()));
        Ok(())
    }

    fn send_cancel_batch(&self, host: &str, ids: &[AssetId]) -> Result<(), String> {
        self.cancels
            .lock()
            .unwrap()
            .push((host.to_string(), ids.to_vec()));
        Ok(())
    }
}

struct CapProvider {
    base: String,
}

impl UrlProvider for CapProvider {
    fn url_for(&self, id: AssetId, _host: Option<&str>) -> Option<String> {
        Some(format!("{}/?texture_id={}", self.base, id))
    }
}

struct Rig {
    engine: FetchEngine,
    http: Arc<MockHttp>,
    sim: Arc<MockSim>,
    cache: MemBlobCache,
}

fn rig() -> Rig {
    let http = MockHttp::new();
    let sim = MockSim::new();
    let cache = MemBlobCache::new();
    let config = Config {
        fetch_threads: 0,
        sweep_interval_ms: 0,
        ..Config::default()
    };
    let engine = FetchEngine::new(EngineOptions {
        config,
        cache: Arc::new(cache.clone()),
        codec: Arc::new(MockCodec),
        http: http.clone(),
        udp: Some(sim.clone()),
        url_provider: Some(Arc::new(CapProvider {
            base: "http://cap.grid.example/fetch".to_string(),
        })),
        registry: Some(Arc::new(ServiceRegistry::new(8, 32))),
        agent_id: AssetId(0xA6E47),
        session_id: AssetId(0x5E5510),
    });
    Rig {
        engine,
        http,
        sim,
        cache,
    }
}

/// Drive ticks until the fetch settles or the budget runs out.
fn run_until_done(rig: &Rig, id: AssetId, max_ticks: usize) -> PollResult {
    for _ in 0..max_ticks {
        rig.engine.tick();
        match rig.engine.poll_finished(id) {
            PollResult::NotReady => continue,
            done => return done,
        }
    }
    rig.engine.poll_finished(id)
}

fn j2c_request(id: AssetId) -> FetchRequest {
    FetchRequest {
        priority: 1000.0,
        host: Some("sim1.grid.example".to_string()),
        ..FetchRequest::new(id)
    }
}

#[test]
fn test_cache_hit_full_no_network() {
    let r = rig();
    let id = AssetId(1);
    let bytes = vec![7u8; 3000];
    r.cache.insert(id, bytes.clone(), 3000); // complete entry

    assert!(r.engine.create_request(j2c_request(id)));
    match run_until_done(&r, id, 10) {
        PollResult::Ready { discard, raw, aux } => {
            assert_eq!(discard, 0);
            assert_eq!(raw.data.as_slice(), bytes.as_slice());
            assert!(aux.is_none());
        }
        other => panic!("expected ready, got {:?}", other),
    }
    assert_eq!(r.http.request_count(), 0);
    assert_eq!(r.sim.request_count(), 0);
    // already complete in cache: no write-back
    assert_eq!(r.engine.stats().metrics.cache_writes, 0);
}

#[test]
fn test_http_206_tail_appends_and_writes_back() {
    let r = rig();
    let id = AssetId(2);
    let full: Vec<u8> = (0..3980u32).map(|i| (i % 251) as u8).collect();
    r.cache.insert(id, full[..1000].to_vec(), 1001); // partial, total unknown
    r.http.serve(full.clone());

    let mut req = j2c_request(id);
    req.url = Some("http://tex.example/assets/two.j2c".to_string());
    assert!(r.engine.create_request(req));

    match run_until_done(&r, id, 10) {
        PollResult::Ready { raw, .. } => assert_eq!(raw.data.len(), 3980),
        other => panic!("expected ready, got {:?}", other),
    }

    // one range request, resumed one byte inside the held prefix
    let reqs = r.http.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].1, 999);

    // cache got the complete asset with its real size
    let (cached, file_size) = r.cache.get(id).unwrap();
    assert_eq!(cached, full);
    assert_eq!(file_size, 3980);
}

#[test]
fn test_404_falls_back_to_udp() {
    let r = rig();
    let id = AssetId(3);
    // no HTTP asset: every GET answers 404

    assert!(r.engine.create_request(j2c_request(id)));
    // a few ticks: HTTP fails, the worker re-enters and queues for UDP
    for _ in 0..4 {
        r.engine.tick();
    }
    assert_eq!(r.http.request_count(), 1);
    assert!(r.sim.requested_ids().contains(&id));

    // sim answers: header + two data packets
    let host = "sim1.grid.example";
    let p0 = vec![1u8; FIRST_PACKET_SIZE];
    let p1 = vec![2u8; MAX_IMG_PACKET_SIZE];
    let p2 = vec![3u8; 120];
    let total = (p0.len() + p1.len() + p2.len()) as u32;
    r.engine
        .receive_image_header(host, id, CodecTag::J2c, 3, total, p0.clone());
    r.engine.receive_image_packet(host, id, 1, p1.clone());
    r.engine.receive_image_packet(host, id, 2, p2.clone());

    match run_until_done(&r, id, 10) {
        PollResult::Ready { raw, .. } => {
            let mut expected = p0;
            expected.extend(p1);
            expected.extend(p2);
            assert_eq!(raw.data.as_slice(), expected.as_slice());
        }
        other => panic!("expected ready, got {:?}", other),
    }

    // completed sim fetch cancels its interest with the host on the next sweep
    r.engine.tick();
    assert!(r.sim.cancelled_ids().contains(&id));

    // the endpoint is blacklisted: a second asset goes straight to UDP
    let id2 = AssetId(4);
    assert!(r.engine.create_request(j2c_request(id2)));
    for _ in 0..4 {
        r.engine.tick();
    }
    assert_eq!(r.http.request_count(), 1);
    assert!(r.sim.requested_ids().contains(&id2));
}

#[test]
fn test_503_retries_then_succeeds() {
    let r = rig();
    let id = AssetId(5);
    let full = vec![9u8; 2000];
    r.http.force(HttpOutcome::Busy);
    r.http.force(HttpOutcome::Busy);
    r.http.serve(full.clone());

    let mut req = j2c_request(id);
    req.url = Some("http://tex.example/assets/five.j2c".to_string());
    req.host = None;
    assert!(r.engine.create_request(req));

    match run_until_done(&r, id, 20) {
        PollResult::Ready { raw, .. } => assert_eq!(raw.data.len(), 2000),
        other => panic!("expected ready, got {:?}", other),
    }
    assert_eq!(r.http.request_count(), 3);
}

#[test]
fn test_http_errors_cap_then_abort() {
    let r = rig();
    let id = AssetId(6);
    for _ in 0..3 {
        r.http.force(HttpOutcome::Error {
            status: 500,
            reason: "boom".to_string(),
        });
    }

    let mut req = j2c_request(id);
    req.url = Some("http://tex.example/assets/six.j2c".to_string());
    req.host = None; // no UDP fallback
    assert!(r.engine.create_request(req));

    match run_until_done(&r, id, 20) {
        PollResult::Aborted => {}
        other => panic!("expected aborted, got {:?}", other),
    }
    assert_eq!(r.http.request_count(), 3);
}

#[test]
fn test_timeout_is_terminal() {
    let r = rig();
    let id = AssetId(7);
    r.http.force(HttpOutcome::Timeout);

    let mut req = j2c_request(id);
    req.url = Some("http://tex.example/assets/seven.j2c".to_string());
    req.host = None;
    assert!(r.engine.create_request(req));

    assert!(matches!(run_until_done(&r, id, 10), PollResult::Aborted));
    assert_eq!(r.http.request_count(), 1);
}

#[test]
fn test_corrupt_cache_entry_refetched() {
    let r = rig();
    let id = AssetId(8);
    let mut poisoned = vec![5u8; 1500];
    poisoned[0] = POISON;
    r.cache.insert(id, poisoned, 1500);
    let good = vec![6u8; 1500];
    r.http.serve(good.clone());

    let mut req = j2c_request(id);
    req.url = Some("http://tex.example/assets/eight.j2c".to_string());
    assert!(r.engine.create_request(req));

    match run_until_done(&r, id, 20) {
        PollResult::Ready { raw, .. } => assert_eq!(raw.data.as_slice(), good.as_slice()),
        other => panic!("expected ready, got {:?}", other),
    }
    // the poisoned entry was dropped and replaced by the refetched bytes
    let (cached, _) = r.cache.get(id).unwrap();
    assert_eq!(cached, good);
}

#[test]
fn test_needs_aux_surfaces_aux_image() {
    let r = rig();
    let id = AssetId(9);
    r.cache.insert(id, vec![1u8; 800], 800);

    let mut req = j2c_request(id);
    req.needs_aux = true;
    assert!(r.engine.create_request(req));

    match run_until_done(&r, id, 10) {
        PollResult::Ready { aux, .. } => assert!(aux.is_some()),
        other => panic!("expected ready, got {:?}", other),
    }
}

#[test]
fn test_file_url_loads_locally() {
    let r = rig();
    let id = AssetId(10);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.j2c");
    std::fs::write(&path, vec![4u8; 900]).unwrap();

    let mut req = j2c_request(id);
    req.url = Some(format!("file://{}", path.display()));
    req.host = None;
    assert!(r.engine.create_request(req));

    match run_until_done(&r, id, 10) {
        PollResult::Ready { raw, .. } => assert_eq!(raw.data.len(), 900),
        other => panic!("expected ready, got {:?}", other),
    }
    assert_eq!(r.http.request_count(), 0);
}

#[test]
fn test_missing_file_url_aborts() {
    let r = rig();
    let id = AssetId(11);
    let mut req = j2c_request(id);
    req.url = Some("file:///does/not/exist.j2c".to_string());
    req.host = None;
    assert!(r.engine.create_request(req));
    assert!(matches!(run_until_done(&r, id, 10), PollResult::Aborted));
}

#[test]
fn test_host_change_rejects_and_drops_worker() {
    let r = rig();
    let id = AssetId(12);
    assert!(r.engine.create_request(j2c_request(id)));
    let mut moved = j2c_request(id);
    moved.host = Some("sim2.grid.example".to_string());
    assert!(!r.engine.create_request(moved.clone()));
    // the stale worker is gone; the same request now lands cleanly
    assert!(r.engine.create_request(moved));
}

#[test]
fn test_reentry_on_finer_desired_discard() {
    let r = rig();
    let id = AssetId(13);
    let full: Vec<u8> = (0..4000u32).map(|i| (i % 199) as u8).collect();
    r.cache.insert(id, full[..1200].to_vec(), full.len() + 1); // partial, known total
    r.http.serve(full.clone());

    let mut req = j2c_request(id);
    req.url = Some("http://tex.example/assets/thirteen.j2c".to_string());
    req.desired_discard = 3;
    req.width = 256;
    req.height = 256;
    req.components = 3;
    assert!(r.engine.create_request(req));
    assert!(matches!(
        run_until_done(&r, id, 10),
        PollResult::Ready { discard: 3, .. }
    ));

    // the caller now wants full resolution: the worker re-enters
    r.engine.update_desired(id, 0, full.len());
    match run_until_done(&r, id, 20) {
        PollResult::Ready { discard, raw, .. } => {
            assert_eq!(discard, 0);
            assert_eq!(raw.data.len(), full.len());
        }
        other => panic!("expected ready, got {:?}", other),
    }
}

#[test]
fn test_delete_request_aborts_poll() {
    let r = rig();
    let id = AssetId(14);
    r.cache.insert(id, vec![2u8; 700], 700);
    assert!(r.engine.create_request(j2c_request(id)));
    r.engine.delete_request(id, true);
    assert!(matches!(r.engine.poll_finished(id), PollResult::Aborted));
    assert_eq!(r.engine.stats().workers, 0);
}

#[test]
fn test_duplicate_packet_schedules_cancel() {
    let r = rig();
    let id = AssetId(15);
    assert!(r.engine.create_request(j2c_request(id)));
    for _ in 0..4 {
        r.engine.tick();
    }
    let host = "sim1.grid.example";
    r.engine
        .receive_image_header(host, id, CodecTag::J2c, 4, 5000, vec![1u8; FIRST_PACKET_SIZE]);
    r.engine
        .receive_image_packet(host, id, 1, vec![2u8; MAX_IMG_PACKET_SIZE]);
    r.engine
        .receive_image_packet(host, id, 1, vec![2u8; MAX_IMG_PACKET_SIZE]);
    r.engine.tick();
    assert!(r.sim.cancelled_ids().contains(&id));
}

#[test]
fn test_statically_blacklisted_asset_aborts_without_io() {
    let id = AssetId(0xBAD);
    let http = MockHttp::new();
    let cache = MemBlobCache::new();
    cache.insert(id, vec![1u8; 500], 500);
    let config = Config {
        fetch_threads: 0,
        sweep_interval_ms: 0,
        asset_blacklist: vec![id],
        ..Config::default()
    };
    let engine = FetchEngine::new(EngineOptions {
        config,
        cache: Arc::new(cache),
        codec: Arc::new(MockCodec),
        http: http.clone(),
        udp: None,
        url_provider: None,
        registry: Some(Arc::new(ServiceRegistry::new(8, 32))),
        agent_id: AssetId(1),
        session_id: AssetId(2),
    });
    let mut req = FetchRequest::new(id);
    req.url = Some("http://tex.example/assets/bad.j2c".to_string());
    assert!(engine.create_request(req));
    engine.tick();
    assert!(matches!(engine.poll_finished(id), PollResult::Aborted));
    // never even looked at the cache or the network
    assert_eq!(engine.stats().metrics.cache_hits, 0);
    assert_eq!(http.request_count(), 0);
}

#[test]
fn test_unknown_asset_packet_schedules_cancel() {
    let r = rig();
    let ghost = AssetId(0xDEAD);
    r.engine
        .receive_image_packet("sim1.grid.example", ghost, 1, vec![1u8; MAX_IMG_PACKET_SIZE]);
    r.engine.tick();
    assert!(r.sim.cancelled_ids().contains(&ghost));
}
