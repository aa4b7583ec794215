use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use pipe_core::{stage_config, DocumentRef, DocumentStore, Fields, InMemoryDocumentStore, LeaseGrant, LeaseManager,
                ManualClock, PipelineCoordinator, PipelineError, TaskCursor, TaskRegistry};
use serde_json::json;

fn cursor_a() -> TaskCursor {
    TaskCursor { stage_index: 0,
                 task_index: 0,
                 stage_name: "validate".into(),
                 task_name: "a".into() }
}

async fn seeded_store(clock: Arc<ManualClock>) -> (Arc<InMemoryDocumentStore>, DocumentRef) {
    let store = Arc::new(InMemoryDocumentStore::with_clock(clock));
    let doc = DocumentRef::new("signups", uuid::Uuid::new_v4().to_string());
    let fields = json!({"task_list": [{"name": "validate", "tasks": [{"name": "a", "completed": false}]}]});
    store.create(&doc, fields.as_object().cloned().unwrap()).await.unwrap();
    (store, doc)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_concurrent_acquire_wins() {
    let clock = Arc::new(ManualClock::default());
    let (store, doc) = seeded_store(clock).await;
    let leases = LeaseManager::default();

    let attempts = (0..8).map(|_| {
                             let store = store.clone();
                             let doc = doc.clone();
                             let leases = leases.clone();
                             tokio::spawn(async move { leases.acquire(store.as_ref(), &doc, &cursor_a()).await })
                         });
    let mut granted = 0;
    let mut held = 0;
    for handle in attempts.collect::<Vec<_>>() {
        match handle.await.unwrap() {
            Ok(LeaseGrant::Granted { .. }) => granted += 1,
            Err(PipelineError::LeaseHeld { .. }) => held += 1,
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(held, 7);
}

#[tokio::test]
async fn lease_becomes_available_after_expiry() {
    let clock = Arc::new(ManualClock::default());
    let (store, doc) = seeded_store(clock.clone()).await;
    let leases = LeaseManager::new(Duration::seconds(120));

    assert!(leases.acquire(store.as_ref(), &doc, &cursor_a()).await.unwrap().is_granted());
    clock.advance(Duration::seconds(119));
    assert!(matches!(leases.acquire(store.as_ref(), &doc, &cursor_a()).await,
                     Err(PipelineError::LeaseHeld { .. })));
    clock.advance(Duration::seconds(2));
    assert!(leases.acquire(store.as_ref(), &doc, &cursor_a()).await.unwrap().is_granted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_coordinators_run_the_handler_once() {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryDocumentStore::with_clock(clock));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = TaskRegistry::new();
    registry.register_fn("a", move |_, _, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(Fields::new())
                }
            });
    let coord = PipelineCoordinator::builder(store.clone()).registry(registry)
                                                           .pipeline("signups", stage_config([("validate", &["a"][..])]))
                                                           .build();
    let doc = DocumentRef::new("signups", "race");
    store.create(&doc, Fields::new()).await.unwrap();
    coord.on_create(&doc, &Fields::new()).await.unwrap();
    let after = store.snapshot(&doc).unwrap();

    let (c1, c2) = (coord.clone(), coord.clone());
    let (d1, d2) = (doc.clone(), doc.clone());
    let (a1, a2) = (after.clone(), after.clone());
    let (r1, r2) = tokio::join!(tokio::spawn(async move { c1.on_update(&d1, &Fields::new(), &a1).await }),
                                tokio::spawn(async move { c2.on_update(&d2, &Fields::new(), &a2).await }));
    let results = [r1.unwrap(), r2.unwrap()];

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let completed = results.iter().filter(|r| matches!(r, Ok(o) if o.made_progress())).count();
    assert_eq!(completed, 1);
    // el perdedor ve el lease vigente o la task ya completada
    assert!(results.iter().all(|r| match r {
                                   Ok(_) => true,
                                   Err(e) => matches!(e, PipelineError::LeaseHeld { .. }),
                               }));
}
