use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipe_core::model::read_completed_at;
use pipe_core::{stage_config, DocumentRef, DocumentStore, Dispatcher, EngineSettings, Fields, HandlerError,
                InMemoryDocumentStore, ManualClock, PipelineCoordinator, RedeliveryPolicy, TaskRegistry};

fn fast_settings() -> EngineSettings {
    EngineSettings { retry_initial: Duration::from_millis(2),
                     retry_max: Duration::from_millis(10),
                     ..EngineSettings::default() }
}

async fn wait_until<F>(mut done: F) -> bool
    where F: FnMut() -> bool
{
    for _ in 0..500 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatcher_drives_documents_to_completion() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let mut registry = TaskRegistry::new();
    registry.register_fn("a", |_, _, _| async { Ok(Fields::new()) });
    let coord = PipelineCoordinator::builder(store.clone()).registry(registry)
                                                           .settings(fast_settings())
                                                           .pipeline("signups",
                                                                     stage_config([("validate", &["a"][..]),
                                                                                   ("load", &["b"][..])]))
                                                           .build();
    let handle = Dispatcher::new(coord).spawn();

    let docs: Vec<_> = (0..5).map(|i| DocumentRef::new("signups", format!("s{i}"))).collect();
    for doc in &docs {
        store.create(doc, Fields::new()).await.unwrap();
    }

    let finished = wait_until(|| {
                       docs.iter()
                           .all(|d| store.snapshot(d).map(|f| read_completed_at(&f).is_some()).unwrap_or(false))
                   }).await;
    let stats = handle.shutdown().await;
    assert!(finished, "all documents should reach the terminal state");
    assert_eq!(stats.dropped, 0);
    assert!(stats.delivered >= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_is_retried_after_lease_expiry() {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = TaskRegistry::new();
    registry.register_fn("geocode", move |_, _, _| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(HandlerError::msg("geocoder timeout"))
                    } else {
                        let mut out = Fields::new();
                        out.insert("geo".into(), serde_json::json!({"lat": 40.4, "lng": -3.7}));
                        Ok(out)
                    }
                }
            });
    let coord = PipelineCoordinator::builder(store.clone()).registry(registry)
                                                           .settings(fast_settings())
                                                           .pipeline("signups", stage_config([("enrich", &["geocode"][..])]))
                                                           .build();
    let handle = Dispatcher::new(coord).spawn();
    let doc = DocumentRef::new("signups", "retry-me");
    store.create(&doc, Fields::new()).await.unwrap();

    assert!(wait_until(|| calls.load(Ordering::SeqCst) >= 1).await);
    // mientras el lease siga vigente sólo hay contención, ni un segundo intento
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(chrono::Duration::seconds(121));
    let finished = wait_until(|| store.snapshot(&doc).map(|f| read_completed_at(&f).is_some()).unwrap_or(false)).await;
    handle.shutdown().await;

    assert!(finished);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.snapshot(&doc).unwrap()["geo"]["lat"], serde_json::json!(40.4));
}

#[tokio::test]
async fn unknown_collections_are_dropped() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let coord = PipelineCoordinator::builder(store.clone()).build();
    let handle = Dispatcher::new(coord).with_policy(RedeliveryPolicy::new(Duration::from_millis(1), Duration::from_millis(1)))
                                       .spawn();
    let doc = DocumentRef::new("orders", "o1");
    store.create(&doc, Fields::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = handle.shutdown().await;

    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.delivered, 0);
    assert!(store.snapshot(&doc).unwrap().is_empty());
}

#[tokio::test]
async fn run_inline_until_shutdown_future_resolves() {
    let store = Arc::new(InMemoryDocumentStore::new());
    let coord = PipelineCoordinator::builder(store.clone()).settings(fast_settings())
                                                           .pipeline("signups", stage_config([("sync", &["crm_sync"][..])]))
                                                           .build();
    let doc = DocumentRef::new("signups", "inline");

    let shutdown = {
        let store = store.clone();
        let doc = doc.clone();
        async move {
            store.create(&doc, Fields::new()).await.unwrap();
            wait_until(|| store.snapshot(&doc).map(|f| read_completed_at(&f).is_some()).unwrap_or(false)).await;
        }
    };
    let stats = Dispatcher::new(coord).run(shutdown).await;

    assert!(read_completed_at(&store.snapshot(&doc).unwrap()).is_some());
    assert!(stats.delivered >= 1);
    assert_eq!(stats.dropped, 0);
}
