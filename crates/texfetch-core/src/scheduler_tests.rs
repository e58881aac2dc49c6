//! Scheduler behavior: weighted fairness, order-preserving cancel, peer
//! spillover, concurrency caps, and the queue accounting invariants.

use std::sync::{Arc, Mutex};

use crate::asset::AssetId;
use crate::service_queue::{
    AddOutcome, CapabilityClass, PerServiceQueue, RequestSink, ServiceRegistry, ServiceRequest,
    CAPABILITY_CLASSES,
};

struct DummyRequest {
    id: AssetId,
}

impl ServiceRequest for DummyRequest {
    fn asset_id(&self) -> AssetId {
        self.id
    }
}

fn req(n: u128) -> Arc<dyn ServiceRequest> {
    Arc::new(DummyRequest { id: AssetId(n) })
}

/// Accepts everything except services named in `reject`, and records what it
/// saw in dispatch order.
#[derive(Default)]
struct RecordingSink {
    reject: Vec<String>,
    seen: Mutex<Vec<(String, CapabilityClass, AssetId)>>,
}

impl RecordingSink {
    fn rejecting(name: &str) -> RecordingSink {
        RecordingSink {
            reject: vec![name.to_string()],
            seen: Mutex::new(Vec::new()),
        }
    }

    fn dispatch_log(&self) -> Vec<(String, CapabilityClass, AssetId)> {
        self.seen.lock().unwrap().clone()
    }
}

impl RequestSink for RecordingSink {
    fn add(
        &self,
        service: &Arc<PerServiceQueue>,
        class: CapabilityClass,
        request: &Arc<dyn ServiceRequest>,
    ) -> AddOutcome {
        if self.reject.iter().any(|r| r == service.name()) {
            return AddOutcome::Throttled;
        }
        self.seen
            .lock()
            .unwrap()
            .push((service.name().to_string(), class, request.asset_id()));
        AddOutcome::Added
    }
}

fn dispatch_once(
    svc: &Arc<PerServiceQueue>,
    sink: &RecordingSink,
    registry: &ServiceRegistry,
) -> usize {
    let mut out = Vec::new();
    svc.add_queued_to(sink, true, registry, &mut out);
    out.len()
}

#[test]
fn test_weighted_fairness_order() {
    let registry = ServiceRegistry::new(16, 32);
    let svc = registry.instance("svc.example");
    let sink = RecordingSink::default();

    // approved classes get two each, unapproved one each
    let mut n = 0u128;
    for &class in &CAPABILITY_CLASSES {
        let count = if class.is_approved() { 2 } else { 1 };
        for _ in 0..count {
            n += 1;
            assert!(svc.enqueue(class, req(n)));
        }
    }

    for _ in 0..6 {
        dispatch_once(&svc, &sink, &registry);
    }
    let classes: Vec<CapabilityClass> = sink.dispatch_log().iter().map(|d| d.1).collect();
    assert_eq!(
        classes,
        vec![
            CapabilityClass::ApprovedTexture,
            CapabilityClass::ApprovedInventory,
            CapabilityClass::ApprovedTexture,
            CapabilityClass::ApprovedInventory,
            CapabilityClass::Texture,
            CapabilityClass::Inventory,
        ]
    );
}

#[test]
fn test_longer_approved_queue_goes_first() {
    let registry = ServiceRegistry::new(16, 32);
    let svc = registry.instance("svc.example");
    let sink = RecordingSink::default();

    svc.enqueue(CapabilityClass::ApprovedTexture, req(1));
    svc.enqueue(CapabilityClass::ApprovedInventory, req(2));
    svc.enqueue(CapabilityClass::ApprovedInventory, req(3));

    dispatch_once(&svc, &sink, &registry);
    assert_eq!(sink.dispatch_log()[0].1, CapabilityClass::ApprovedInventory);
}

#[test]
fn test_unapproved_round_robin() {
    let registry = ServiceRegistry::new(16, 32);
    let svc = registry.instance("svc.example");
    let sink = RecordingSink::default();

    for i in 0..3 {
        svc.enqueue(CapabilityClass::Texture, req(10 + i));
        svc.enqueue(CapabilityClass::Inventory, req(20 + i));
    }
    for _ in 0..4 {
        dispatch_once(&svc, &sink, &registry);
    }
    let classes: Vec<CapabilityClass> = sink.dispatch_log().iter().map(|d| d.1).collect();
    assert_eq!(
        classes,
        vec![
            CapabilityClass::Texture,
            CapabilityClass::Inventory,
            CapabilityClass::Texture,
            CapabilityClass::Inventory,
        ]
    );
}

#[test]
fn test_cancel_preserves_order() {
    let registry = ServiceRegistry::new(16, 32);
    let svc = registry.instance("svc.example");
    let sink = RecordingSink::default();

    for n in 1..=4 {
        svc.enqueue(CapabilityClass::ApprovedTexture, req(n));
    }
    assert!(svc.cancel(CapabilityClass::ApprovedTexture, AssetId(2)));

    for _ in 0..3 {
        dispatch_once(&svc, &sink, &registry);
    }
    let ids: Vec<AssetId> = sink.dispatch_log().iter().map(|d| d.2).collect();
    assert_eq!(ids, vec![AssetId(1), AssetId(3), AssetId(4)]);
}

#[test]
fn test_throttled_service_spills_to_peer() {
    let registry = ServiceRegistry::new(16, 32);
    let a = registry.instance("a.example");
    let b = registry.instance("b.example");
    let sink = RecordingSink::rejecting("a.example");

    for n in 1..=5 {
        a.enqueue(CapabilityClass::ApprovedTexture, req(n));
    }
    b.enqueue(CapabilityClass::ApprovedTexture, req(100));

    // non-recursive entry through the throttled service still drains the peer
    let mut out = Vec::new();
    a.add_queued_to(&sink, false, &registry, &mut out);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].request.asset_id(), AssetId(100));
    assert_eq!(sink.dispatch_log()[0].0, "b.example");
    // the throttled service kept its whole queue
    assert_eq!(a.pending_len(CapabilityClass::ApprovedTexture), 5);
}

#[test]
fn test_concurrent_limit_bounds_active() {
    let registry = ServiceRegistry::new(2, 32);
    let svc = registry.instance("svc.example");
    let sink = RecordingSink::default();

    for n in 1..=5 {
        svc.enqueue(CapabilityClass::ApprovedTexture, req(n));
    }
    for _ in 0..5 {
        dispatch_once(&svc, &sink, &registry);
    }
    assert_eq!(svc.active_count(), 2);
    assert_eq!(svc.concurrent_limit(), 2);
    assert_eq!(svc.pending_len(CapabilityClass::ApprovedTexture), 3);

    // a finished request frees a slot
    svc.request_done(CapabilityClass::ApprovedTexture);
    dispatch_once(&svc, &sink, &registry);
    assert_eq!(svc.active_count(), 2);
    assert_eq!(svc.pending_len(CapabilityClass::ApprovedTexture), 2);
}

#[test]
fn test_total_queued_matches_pending_sum() {
    let registry = ServiceRegistry::new(8, 32);
    let a = registry.instance("a.example");
    let b = registry.instance("b.example");
    let sink = RecordingSink::default();

    for n in 1..=3 {
        a.enqueue(CapabilityClass::ApprovedTexture, req(n));
    }
    for n in 4..=5 {
        b.enqueue(CapabilityClass::Texture, req(n));
    }
    assert_eq!(registry.total_queued(), 5);
    assert_eq!(registry.total_added(), 5);

    a.cancel(CapabilityClass::ApprovedTexture, AssetId(1));
    assert_eq!(registry.total_queued(), 4);

    dispatch_once(&a, &sink, &registry);
    dispatch_once(&b, &sink, &registry);
    let pending_sum: usize = CAPABILITY_CLASSES
        .iter()
        .map(|&c| a.pending_len(c) + b.pending_len(c))
        .sum();
    assert_eq!(registry.total_queued(), pending_sum);
    assert_eq!(registry.total_active(), 2);
}

#[test]
fn test_no_double_enqueue() {
    let registry = ServiceRegistry::new(8, 32);
    let svc = registry.instance("svc.example");
    let r = req(1);
    assert!(svc.enqueue(CapabilityClass::ApprovedTexture, Arc::clone(&r)));
    // same asset again, any class: refused
    assert!(!svc.enqueue(CapabilityClass::ApprovedTexture, Arc::clone(&r)));
    assert!(!svc.enqueue(CapabilityClass::Texture, r));
    assert_eq!(registry.total_queued(), 1);
}

#[test]
fn test_registry_release_collapses_idle_entries() {
    let registry = ServiceRegistry::new(8, 32);
    let handle = registry.instance("gone.example");
    assert_eq!(registry.len(), 1);
    registry.release(handle);
    assert_eq!(registry.len(), 0);

    // a second outstanding handle keeps the entry alive
    let h1 = registry.instance("kept.example");
    let h2 = registry.instance("kept.example");
    registry.release(h1);
    assert_eq!(registry.len(), 1);
    registry.release(h2);
    assert_eq!(registry.len(), 0);
}

#[test]
fn test_registry_release_keeps_busy_entries() {
    let registry = ServiceRegistry::new(8, 32);
    let handle = registry.instance("busy.example");
    handle.enqueue(CapabilityClass::ApprovedTexture, req(1));
    registry.release(handle);
    // not idle: survives its release
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_adjust_concurrent_connections_clamps() {
    let registry = ServiceRegistry::new(8, 16);
    let svc = registry.instance("svc.example");
    registry.adjust_concurrent_connections(100);
    assert_eq!(svc.concurrent_limit(), 16);
    registry.adjust_concurrent_connections(-100);
    assert_eq!(svc.concurrent_limit(), 1);
    registry.adjust_concurrent_connections(3);
    assert_eq!(svc.concurrent_limit(), 4);
}

#[test]
fn test_starvation_flags_on_empty_service() {
    let registry = ServiceRegistry::new(8, 32);
    let svc = registry.instance("svc.example");
    let sink = RecordingSink::default();
    dispatch_once(&svc, &sink, &registry);
    assert!(svc.starved(CapabilityClass::ApprovedTexture));
    svc.enqueue(CapabilityClass::ApprovedTexture, req(1));
    dispatch_once(&svc, &sink, &registry);
    assert!(!svc.starved(CapabilityClass::ApprovedTexture));
}
