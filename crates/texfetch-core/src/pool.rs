//! Worker pools: a priority run queue for the per-asset state machines and a
//! plain FIFO pool for blocking I/O and decode jobs.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::asset::AssetId;

struct RunEntry {
    priority: u64,
    seq: u64,
    id: AssetId,
}

impl PartialEq for RunEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for RunEntry {}
impl PartialOrd for RunEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RunEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap on priority; earlier insertion wins ties
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct RunInner {
    heap: BinaryHeap<RunEntry>,
    /// Live sequence number per asset. Heap entries whose seq is stale are
    /// skipped on pop; pushing again with a new priority re-sorts in O(log n).
    latest: HashMap<AssetId, u64>,
    next_seq: u64,
    shutdown: bool,
}

/// Priority queue of assets whose state machine is ready to advance.
/// An asset appears at most once, no matter how often it is pushed.
pub struct RunQueue {
    inner: Mutex<RunInner>,
    cond: Condvar,
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RunQueue {
    pub fn new() -> RunQueue {
        RunQueue {
            inner: Mutex::new(RunInner {
                heap: BinaryHeap::new(),
                latest: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Queue (or re-queue with a new priority) an asset.
    pub fn push(&self, id: AssetId, priority: u64) {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.latest.insert(id, seq);
        inner.heap.push(RunEntry { priority, seq, id });
        drop(inner);
        self.cond.notify_one();
    }

    pub fn remove(&self, id: AssetId) {
        self.inner.lock().unwrap().latest.remove(&id);
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.inner.lock().unwrap().latest.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest-priority ready asset, if any.
    pub fn try_pop(&self) -> Option<AssetId> {
        let mut inner = self.inner.lock().unwrap();
        Self::pop_locked(&mut inner)
    }

    /// Block until an asset is ready or the queue shuts down.
    pub fn pop_blocking(&self) -> Option<AssetId> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(id) = Self::pop_locked(&mut inner) {
                return Some(id);
            }
            if inner.shutdown {
                return None;
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    fn pop_locked(inner: &mut RunInner) -> Option<AssetId> {
        while let Some(entry) = inner.heap.pop() {
            if inner.latest.get(&entry.id) == Some(&entry.seq) {
                inner.latest.remove(&entry.id);
                return Some(entry.id);
            }
            // stale entry superseded by a later push
        }
        None
    }

    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.cond.notify_all();
    }
}

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct JobInner {
    queue: VecDeque<Job>,
    shutdown: bool,
}

/// Fixed thread set draining a FIFO of boxed jobs. With zero threads, jobs
/// run inline on the submitting thread; the deterministic path tests use.
pub struct JobPool {
    inner: Mutex<JobInner>,
    cond: Condvar,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    pub fn new(name: &str, workers: usize) -> Arc<JobPool> {
        let pool = Arc::new(JobPool {
            inner: Mutex::new(JobInner {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            workers,
            handles: Mutex::new(Vec::new()),
        });
        for i in 0..workers {
            let p = Arc::clone(&pool);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || p.run())
                .expect("spawn pool thread");
            pool.handles.lock().unwrap().push(handle);
        }
        pool
    }

    pub fn is_inline(&self) -> bool {
        self.workers == 0
    }

    pub fn submit(&self, job: Job) {
        if self.workers == 0 {
            job();
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(job);
        drop(inner);
        self.cond.notify_one();
    }

    fn run(&self) {
        loop {
            let job = {
                let mut inner = self.inner.lock().unwrap();
                loop {
                    if let Some(job) = inner.queue.pop_front() {
                        break job;
                    }
                    if inner.shutdown {
                        return;
                    }
                    inner = self.cond.wait(inner).unwrap();
                }
            };
            job();
        }
    }

    pub fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown = true;
        self.cond.notify_all();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}
