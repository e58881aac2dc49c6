//! Per-service request queues and the weighted-fair dispatcher.
//!
//! Every remote endpoint (canonical `host[:port]`) gets one queue holding
//! pending fetch requests in four capability classes. Dispatch visits the two
//! approved classes first, longer queue first, then the two unapproved
//! classes in strict rotation. A service throttled by its own caps hands the
//! slot to its peers so global bandwidth never idles behind one endpoint.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::asset::AssetId;
use crate::config::{DEFAULT_SERVICE_CONCURRENCY, MAX_SERVICE_CONCURRENCY};
use crate::metrics::{new_queue_stats, SharedQueueStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapabilityClass {
    ApprovedTexture,
    ApprovedInventory,
    Texture,
    Inventory,
}

pub const CAPABILITY_CLASSES: [CapabilityClass; 4] = [
    CapabilityClass::ApprovedTexture,
    CapabilityClass::ApprovedInventory,
    CapabilityClass::Texture,
    CapabilityClass::Inventory,
];

impl CapabilityClass {
    pub fn index(self) -> usize {
        match self {
            CapabilityClass::ApprovedTexture => 0,
            CapabilityClass::ApprovedInventory => 1,
            CapabilityClass::Texture => 2,
            CapabilityClass::Inventory => 3,
        }
    }

    pub fn from_index(i: usize) -> CapabilityClass {
        CAPABILITY_CLASSES[i]
    }

    pub fn is_approved(self) -> bool {
        self.index() < 2
    }
}

/// A request that can sit in a service queue. The scheduler only needs
/// identity; everything else stays with the owner.
pub trait ServiceRequest: Send + Sync {
    fn asset_id(&self) -> AssetId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Global admission said no; every later class would hear the same.
    Throttled,
}

/// Where dispatched requests go: the engine's HTTP attach path, or a
/// recording stub in tests.
pub trait RequestSink {
    fn add(
        &self,
        service: &Arc<PerServiceQueue>,
        class: CapabilityClass,
        request: &Arc<dyn ServiceRequest>,
    ) -> AddOutcome;
}

/// A request the scheduler just popped; the caller starts the actual I/O
/// outside every queue lock.
pub struct DispatchedRequest {
    pub service: Arc<PerServiceQueue>,
    pub class: CapabilityClass,
    pub request: Arc<dyn ServiceRequest>,
}

struct QueueInner {
    concurrent_limit: u32,
    pending: [VecDeque<Arc<dyn ServiceRequest>>; 4],
    active: [u32; 4],
    starved: [bool; 4],
    /// Which approved class goes first on a length tie. Advances on every
    /// dispatch pass, deliberately not only on success.
    approved_first: usize,
    /// Rotation cursor for the unapproved pair; same loose bookkeeping.
    unapproved_first: usize,
}

pub struct PerServiceQueue {
    name: String,
    inner: Mutex<QueueInner>,
    stats: SharedQueueStats,
}

impl PerServiceQueue {
    fn new(name: String, concurrent_limit: u32, stats: SharedQueueStats) -> PerServiceQueue {
        PerServiceQueue {
            name,
            inner: Mutex::new(QueueInner {
                concurrent_limit,
                pending: Default::default(),
                active: [0; 4],
                starved: [false; 4],
                approved_first: 0,
                unapproved_first: 0,
            }),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append to the class FIFO. Refuses a request already pending on this
    /// service so nothing ever queues twice.
    pub fn enqueue(&self, class: CapabilityClass, request: Arc<dyn ServiceRequest>) -> bool {
        let id = request.asset_id();
        let mut q = self.inner.lock().unwrap();
        if q.pending.iter().any(|p| p.iter().any(|r| r.asset_id() == id)) {
            return false;
        }
        q.pending[class.index()].push_back(request);
        let mut stats = self.stats.lock().unwrap();
        stats.total_queued += 1;
        stats.total_added += 1;
        true
    }

    /// Remove a pending request in place. The remaining requests keep their
    /// original order.
    pub fn cancel(&self, class: CapabilityClass, id: AssetId) -> bool {
        let mut q = self.inner.lock().unwrap();
        let queue = &mut q.pending[class.index()];
        if let Some(pos) = queue.iter().position(|r| r.asset_id() == id) {
            queue.remove(pos);
            self.stats.lock().unwrap().total_queued -= 1;
            true
        } else {
            false
        }
    }

    /// An attached request finished (or was abandoned); free its slot.
    pub fn request_done(&self, class: CapabilityClass) {
        let mut q = self.inner.lock().unwrap();
        let c = class.index();
        if q.active[c] > 0 {
            q.active[c] -= 1;
            let mut stats = self.stats.lock().unwrap();
            if stats.total_active > 0 {
                stats.total_active -= 1;
            }
        }
    }

    pub fn pending_len(&self, class: CapabilityClass) -> usize {
        self.inner.lock().unwrap().pending[class.index()].len()
    }

    pub fn active_count(&self) -> u32 {
        self.inner.lock().unwrap().active.iter().sum()
    }

    pub fn active_by_class(&self, class: CapabilityClass) -> u32 {
        self.inner.lock().unwrap().active[class.index()]
    }

    pub fn concurrent_limit(&self) -> u32 {
        self.inner.lock().unwrap().concurrent_limit
    }

    pub fn starved(&self, class: CapabilityClass) -> bool {
        self.inner.lock().unwrap().starved[class.index()]
    }

    fn set_concurrent_limit(&self, limit: u32) {
        self.inner.lock().unwrap().concurrent_limit = limit;
    }

    fn is_idle(&self) -> bool {
        let q = self.inner.lock().unwrap();
        q.pending.iter().all(|p| p.is_empty()) && q.active.iter().all(|&a| a == 0)
    }

    /// Try to hand one pending request to the sink.
    ///
    /// Class visit order: the approved pair first (longer queue first, tie
    /// broken by the rotating cursor), then the unapproved pair round-robin.
    /// Only the first non-empty class is attempted; a throttle there means
    /// every later class would be throttled too. When called non-recursively,
    /// each peer service then gets one pass of its own, which keeps the
    /// transport busy when only this service's caps were the obstacle.
    pub fn add_queued_to(
        self: &Arc<Self>,
        sink: &dyn RequestSink,
        recursive: bool,
        registry: &ServiceRegistry,
        dispatched: &mut Vec<DispatchedRequest>,
    ) {
        {
            let mut q = self.inner.lock().unwrap();

            let len0 = q.pending[0].len();
            let len1 = q.pending[1].len();
            let approved_first = if len0 > len1 {
                0
            } else if len1 > len0 {
                1
            } else {
                q.approved_first
            };
            q.approved_first ^= 1;
            let unapproved_first = q.unapproved_first;
            q.unapproved_first ^= 1;

            let order = [
                approved_first,
                approved_first ^ 1,
                2 + unapproved_first,
                2 + (unapproved_first ^ 1),
            ];

            let mut all_empty = true;
            for &c in &order {
                if q.pending[c].is_empty() {
                    continue;
                }
                all_empty = false;
                let active_total: u32 = q.active.iter().sum();
                if active_total >= q.concurrent_limit {
                    break; // our own cap; peers may still have room
                }
                let front = Arc::clone(q.pending[c].front().unwrap());
                match sink.add(self, CapabilityClass::from_index(c), &front) {
                    AddOutcome::Added => {
                        q.pending[c].pop_front();
                        q.active[c] += 1;
                        q.starved[c] = false;
                        let mut stats = self.stats.lock().unwrap();
                        stats.total_queued -= 1;
                        stats.total_active += 1;
                        drop(stats);
                        dispatched.push(DispatchedRequest {
                            service: Arc::clone(self),
                            class: CapabilityClass::from_index(c),
                            request: front,
                        });
                    }
                    AddOutcome::Throttled => {}
                }
                break;
            }
            if all_empty {
                q.starved = [true; 4];
            }
        }

        if !recursive {
            for peer in registry.services() {
                if !Arc::ptr_eq(&peer, self) {
                    peer.add_queued_to(sink, true, registry, dispatched);
                }
            }
        }
    }
}

/// Process-wide map of service name to queue. Queues are created lazily and
/// collapse once nothing references them and they are empty.
pub struct ServiceRegistry {
    map: Mutex<HashMap<String, Arc<PerServiceQueue>>>,
    stats: SharedQueueStats,
    default_concurrency: u32,
    global_max: u32,
}

lazy_static! {
    static ref GLOBAL_REGISTRY: Arc<ServiceRegistry> = Arc::new(ServiceRegistry::new(
        DEFAULT_SERVICE_CONCURRENCY,
        MAX_SERVICE_CONCURRENCY
    ));
}

impl ServiceRegistry {
    pub fn new(default_concurrency: u32, global_max: u32) -> ServiceRegistry {
        ServiceRegistry {
            map: Mutex::new(HashMap::new()),
            stats: new_queue_stats(),
            default_concurrency: default_concurrency.max(1),
            global_max: global_max.max(1),
        }
    }

    /// The process-wide registry most embedders share.
    pub fn global() -> Arc<ServiceRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Look up or create the queue for a service name.
    pub fn instance(&self, name: &str) -> Arc<PerServiceQueue> {
        let mut map = self.map.lock().unwrap();
        if let Some(q) = map.get(name) {
            return Arc::clone(q);
        }
        let q = Arc::new(PerServiceQueue::new(
            name.to_string(),
            self.default_concurrency,
            Arc::clone(&self.stats),
        ));
        map.insert(name.to_string(), Arc::clone(&q));
        q
    }

    /// Drop a caller's handle. The entry is removed only when this release
    /// leaves the registry as the sole owner and the queue is idle; the check
    /// runs under the map lock so a concurrent `instance` cannot lose its
    /// fresh handle.
    pub fn release(&self, handle: Arc<PerServiceQueue>) {
        let mut map = self.map.lock().unwrap();
        if Arc::strong_count(&handle) == 2 && handle.is_idle() {
            if let Some(current) = map.get(handle.name()) {
                if Arc::ptr_eq(current, &handle) {
                    map.remove(handle.name());
                }
            }
        }
    }

    /// Snapshot of every live queue, in stable name order.
    pub fn services(&self) -> Vec<Arc<PerServiceQueue>> {
        let map = self.map.lock().unwrap();
        let mut out: Vec<_> = map.values().cloned().collect();
        out.sort_by(|a, b| a.name().cmp(b.name()));
        out
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raise or lower every service's connection cap, clamped to
    /// `[1, global_max]`.
    pub fn adjust_concurrent_connections(&self, increment: i32) {
        for svc in self.services() {
            let cur = svc.concurrent_limit() as i64;
            let next = (cur + increment as i64).clamp(1, self.global_max as i64);
            svc.set_concurrent_limit(next as u32);
        }
    }

    /// One dispatch pass over every service.
    pub fn pump(&self, sink: &dyn RequestSink) -> Vec<DispatchedRequest> {
        let mut out = Vec::new();
        for svc in self.services() {
            svc.add_queued_to(sink, true, self, &mut out);
        }
        out
    }

    pub fn total_queued(&self) -> usize {
        self.stats.lock().unwrap().total_queued
    }

    pub fn total_active(&self) -> usize {
        self.stats.lock().unwrap().total_active
    }

    pub fn total_added(&self) -> u64 {
        self.stats.lock().unwrap().total_added
    }
}
