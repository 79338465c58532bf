//! End-to-end reconciliation scenarios against the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rudder_core::{Kind, Obj};
use rudder_router::{handler_fn, HandlerSet, Router};
use rudder_runtime::RuntimeBackend;
use rudder_store::{MemoryStore, ObjectStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn kind(name: &str) -> Kind {
    Kind::core("v1", name)
}

struct Harness {
    store: Arc<MemoryStore>,
    router: Arc<Router>,
    ct: CancellationToken,
}

impl Harness {
    fn new(name: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let backend = RuntimeBackend::with_workers(store.clone(), 4);
        let set = HandlerSet::new(name, backend);
        let router = Router::new(set, None, 0);
        Self { store, router, ct: CancellationToken::new() }
    }

    async fn start(&self) {
        self.router.start(&self.ct).await.unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

/// Waits until `pred` holds, advancing virtual time in small steps.
async fn eventually(mut pred: impl FnMut() -> bool, what: &str) {
    for _ in 0..1000 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// S1: a handler creates a second object and can read it back immediately,
// before any informer for that kind has observed it.
#[tokio::test(start_paused = true)]
async fn create_then_read() {
    let h = Harness::new("s1");
    let foo = kind("Foo");
    let bar = kind("Bar");

    let read_back = Arc::new(AtomicBool::new(false));
    let read_back2 = read_back.clone();
    let bar2 = bar.clone();
    h.router.handle(
        foo.clone(),
        handler_fn(move |req, _resp| {
            let read_back = read_back2.clone();
            let bar = bar2.clone();
            Box::pin(async move {
                if req.name != "a" {
                    return Ok(());
                }
                let mut dep = Obj::new(bar.clone(), "foo", "b");
                dep.spec = json!({"owner": "a"});
                match req.client.create(&dep).await {
                    Ok(_) => {}
                    Err(e) if matches!(e, rudder_store::StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                let got = req.client.get(&bar, "foo", "b").await?;
                if got.meta.name == "b" {
                    read_back.store(true, Ordering::SeqCst);
                }
                Ok(())
            })
        }),
    );
    h.start().await;

    h.store.create(&Obj::new(foo.clone(), "foo", "a")).await.unwrap();

    let store = h.store.clone();
    eventually(
        || {
            futures::executor::block_on(async {
                store.get(&bar, "foo", "b").await.is_ok()
            })
        },
        "Bar foo/b to exist",
    )
    .await;
    eventually(|| read_back.load(Ordering::SeqCst), "read-after-create to hit").await;
}

// S2 + S4: a read during reconcile subscribes the reader; changing the read
// target re-runs the reader with from_trigger set; deleting the reader drops
// the subscription.
#[tokio::test(start_paused = true)]
async fn dependency_triggering_and_cleanup() {
    let h = Harness::new("s2");
    let app = kind("App");
    let config = kind("Config");

    // (from_trigger, config resource version seen)
    let calls: Arc<Mutex<Vec<(bool, String)>>> = Arc::default();
    let calls2 = calls.clone();
    let config2 = config.clone();
    h.router.handle(
        app.clone(),
        handler_fn(move |req, _resp| {
            let calls = calls2.clone();
            let config = config2.clone();
            Box::pin(async move {
                let cfg = req.client.get(&config, "foo", "c").await?;
                calls
                    .lock()
                    .unwrap()
                    .push((req.from_trigger, cfg.meta.resource_version.clone()));
                Ok(())
            })
        }),
    );

    h.store.create(&Obj::new(config.clone(), "foo", "c")).await.unwrap();
    h.store.create(&Obj::new(app.clone(), "foo", "x")).await.unwrap();
    h.start().await;

    eventually(|| !calls.lock().unwrap().is_empty(), "first app reconcile").await;
    settle().await;

    // S2: mutate the watched config
    let stored = h.store.get(&config, "foo", "c").await.unwrap();
    let mut edit = stored.clone();
    edit.spec = json!({"rev": 2});
    let updated = h.store.update(&edit).await.unwrap();

    let want_rv = updated.meta.resource_version.clone();
    let calls3 = calls.clone();
    eventually(
        move || {
            calls3
                .lock()
                .unwrap()
                .iter()
                .any(|(from_trigger, rv)| *from_trigger && *rv == want_rv)
        },
        "triggered reconcile to observe the new config",
    )
    .await;

    let dump = h.router.dump_triggers(false);
    assert!(dump.contains("v1/App foo/x"), "dump should list the dependent: {dump}");

    // S4: delete the app, let the deletion reconcile drop subscriptions
    h.store.delete(&app, "foo", "x").await.unwrap();
    settle().await;

    let dump = h.router.dump_triggers(false);
    assert!(!dump.contains("v1/App foo/x"), "subscriptions should be dropped: {dump}");

    let before = calls.lock().unwrap().len();
    let stored = h.store.get(&config, "foo", "c").await.unwrap();
    let mut edit = stored.clone();
    edit.spec = json!({"rev": 3});
    h.store.update(&edit).await.unwrap();
    settle().await;
    settle().await;
    assert_eq!(calls.lock().unwrap().len(), before, "deleted app must not be re-enqueued");
}

// S3: the per-key gate bounds dispatch rate at burst 10 plus one token per
// five seconds, and the deferred replay still reconciles the latest state.
#[tokio::test(start_paused = true)]
async fn rate_limiting_bounds_churn() {
    let h = Harness::new("s3");
    let foo = kind("Foo");

    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let calls2 = calls.clone();
    h.router.handle(
        foo.clone(),
        handler_fn(move |req, _resp| {
            let calls = calls2.clone();
            Box::pin(async move {
                if let Some(obj) = &req.object {
                    calls.lock().unwrap().push(obj.meta.resource_version.clone());
                }
                Ok(())
            })
        }),
    );

    h.store.create(&Obj::new(foo.clone(), "foo", "a")).await.unwrap();
    h.start().await;
    settle().await;

    let mut latest = h.store.get(&foo, "foo", "a").await.unwrap();
    for i in 0..50 {
        latest.spec = json!({"i": i});
        latest = h.store.update(&latest).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(900)).await;

    let after_burst = calls.lock().unwrap().len();
    assert!(after_burst <= 10, "burst must cap dispatches, got {after_burst}");

    // one more token roughly every five seconds
    tokio::time::sleep(Duration::from_secs(5)).await;
    let after_one_window = calls.lock().unwrap().len();
    assert!(
        after_one_window <= after_burst + 2,
        "window allows about one extra dispatch: {after_burst} -> {after_one_window}"
    );

    // no lost updates: the latest version is eventually reconciled
    let want_rv = latest.meta.resource_version.clone();
    let calls3 = calls.clone();
    eventually(
        move || calls3.lock().unwrap().iter().any(|rv| *rv == want_rv),
        "latest resource version to be reconciled",
    )
    .await;
}

// S5: a save conflict is surfaced, nothing panics, and the retry sees the
// newer object and lands its change.
#[tokio::test(start_paused = true)]
async fn save_conflict_retries_cleanly() {
    let h = Harness::new("s5");
    let foo = kind("Foo");

    let raced = Arc::new(AtomicBool::new(false));
    let raced2 = raced.clone();
    let store2 = h.store.clone();
    let foo2 = foo.clone();
    h.router.handle(
        foo.clone(),
        handler_fn(move |req, _resp| {
            let raced = raced2.clone();
            let store = store2.clone();
            let foo = foo2.clone();
            Box::pin(async move {
                let Some(obj) = req.object.as_mut() else {
                    return Ok(());
                };
                if obj.spec.get("reconciled").is_some() {
                    return Ok(());
                }
                if !raced.swap(true, Ordering::SeqCst) {
                    // lose the race on purpose: bump the object behind the engine
                    let mut racer = store.get(&foo, &obj.meta.namespace, &obj.meta.name).await?;
                    racer.spec = json!({"racer": true});
                    store.update(&racer).await?;
                }
                let mut spec = obj.spec.clone();
                if !spec.is_object() {
                    spec = json!({});
                }
                spec["reconciled"] = json!(true);
                obj.spec = spec;
                Ok(())
            })
        }),
    );

    h.store.create(&Obj::new(foo.clone(), "foo", "a")).await.unwrap();
    h.start().await;

    let store = h.store.clone();
    let foo3 = foo.clone();
    eventually(
        move || {
            futures::executor::block_on(async {
                store
                    .get(&foo3, "foo", "a")
                    .await
                    .map(|o| o.spec.get("reconciled").is_some())
                    .unwrap_or(false)
            })
        },
        "retry to land the change on the newer version",
    )
    .await;

    let live = h.store.get(&foo, "foo", "a").await.unwrap();
    assert_eq!(live.spec.get("racer"), Some(&json!(true)));
    assert_eq!(live.spec.get("reconciled"), Some(&json!(true)));
}

// S6: retry_after keeps the minimum of the requested delays.
#[tokio::test(start_paused = true)]
async fn retry_after_uses_minimum() {
    let h = Harness::new("s6");
    let foo = kind("Foo");

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    h.router.handle(
        foo.clone(),
        handler_fn(move |_req, resp| {
            let count = count2.clone();
            Box::pin(async move {
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    resp.retry_after(Duration::from_secs(2));
                    resp.retry_after(Duration::from_secs(5));
                    resp.retry_after(Duration::ZERO); // no-op
                }
                Ok(())
            })
        }),
    );

    h.store.create(&Obj::new(foo.clone(), "foo", "a")).await.unwrap();
    h.start().await;

    let count3 = count.clone();
    eventually(move || count3.load(Ordering::SeqCst) >= 1, "first reconcile").await;
    let at_first = count.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(1700)).await;
    assert_eq!(count.load(Ordering::SeqCst), at_first, "no re-run before the 2s delay");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        count.load(Ordering::SeqCst) > at_first,
        "the 2s retry must fire, not the 5s one"
    );
}

// Invariant 1: at most one dispatch per (kind, key) at any instant, even
// when plain, trigger, and replay keys for the same object race.
#[tokio::test(start_paused = true)]
async fn per_key_dispatch_is_serialized() {
    let h = Harness::new("serialize");
    let foo = kind("Foo");

    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let active2 = active.clone();
    let max2 = max_active.clone();
    h.router.handle(
        foo.clone(),
        handler_fn(move |_req, _resp| {
            let active = active2.clone();
            let max_active = max2.clone();
            Box::pin(async move {
                let n = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }),
    );

    h.store.create(&Obj::new(foo.clone(), "foo", "a")).await.unwrap();
    h.start().await;
    settle().await;

    // distinct queue items for the same underlying key
    let backend = h.router.backend();
    for _ in 0..5 {
        backend.trigger(&foo, "_t foo/a", Duration::ZERO).await.unwrap();
        backend.trigger(&foo, "_r foo/a", Duration::ZERO).await.unwrap();
        backend.trigger(&foo, "foo/a", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    settle().await;
    settle().await;

    assert_eq!(max_active.load(Ordering::SeqCst), 1, "dispatches for one key overlapped");
}

// Invariant 5: byte-equal handler output produces no store write.
#[tokio::test(start_paused = true)]
async fn unchanged_object_is_not_saved() {
    let h = Harness::new("no-save");
    let foo = kind("Foo");

    h.router.handle(
        foo.clone(),
        handler_fn(|_req, _resp| Box::pin(async { Ok(()) })),
    );

    let created = h.store.create(&Obj::new(foo.clone(), "foo", "a")).await.unwrap();
    h.start().await;
    settle().await;
    settle().await;

    let live = h.store.get(&foo, "foo", "a").await.unwrap();
    assert_eq!(live.meta.resource_version, created.meta.resource_version);
}

// Invariant 7: trigger-driven dispatches do not fan out again.
#[tokio::test(start_paused = true)]
async fn triggered_dispatch_does_not_amplify() {
    let h = Harness::new("no-amplify");
    let a = kind("Alpha");
    let b = kind("Beta");

    let a_triggered = Arc::new(AtomicUsize::new(0));
    let b_triggered = Arc::new(AtomicUsize::new(0));

    // Alpha reads Beta, Beta reads Alpha: a subscription cycle
    let at2 = a_triggered.clone();
    let b2 = b.clone();
    h.router.handle(
        a.clone(),
        handler_fn(move |req, _resp| {
            let a_triggered = at2.clone();
            let b = b2.clone();
            Box::pin(async move {
                if req.from_trigger {
                    a_triggered.fetch_add(1, Ordering::SeqCst);
                }
                let _ = req.client.get(&b, "ns", "b").await?;
                Ok(())
            })
        }),
    );
    let bt2 = b_triggered.clone();
    let a2 = a.clone();
    h.router.handle(
        b.clone(),
        handler_fn(move |req, _resp| {
            let b_triggered = bt2.clone();
            let a = a2.clone();
            Box::pin(async move {
                if req.from_trigger {
                    b_triggered.fetch_add(1, Ordering::SeqCst);
                }
                let _ = req.client.get(&a, "ns", "a").await?;
                Ok(())
            })
        }),
    );

    h.store.create(&Obj::new(a.clone(), "ns", "a")).await.unwrap();
    h.store.create(&Obj::new(b.clone(), "ns", "b")).await.unwrap();
    h.start().await;
    settle().await;
    settle().await;

    let a_before = a_triggered.load(Ordering::SeqCst);
    let b_before = b_triggered.load(Ordering::SeqCst);

    // change Alpha: Beta gets triggered; Beta's triggered run must not
    // re-trigger Alpha
    let mut edit = h.store.get(&a, "ns", "a").await.unwrap();
    edit.spec = json!({"rev": 2});
    h.store.update(&edit).await.unwrap();

    let bt3 = b_triggered.clone();
    eventually(
        move || bt3.load(Ordering::SeqCst) > b_before,
        "beta to be triggered by alpha's change",
    )
    .await;
    settle().await;
    settle().await;

    assert_eq!(
        a_triggered.load(Ordering::SeqCst),
        a_before,
        "alpha must not be re-triggered by beta's triggered reconcile"
    );
}

// A finalize route holds deletion until its handler runs, then releases the
// object by clearing the finalizer.
#[tokio::test(start_paused = true)]
async fn finalizer_runs_before_removal() {
    let h = Harness::new("finalize");
    let foo = kind("Foo");

    let finalized = Arc::new(AtomicUsize::new(0));
    let fin2 = finalized.clone();
    h.router
        .route()
        .kind(foo.clone())
        .finalize(
            "rudder/cleanup",
            handler_fn(move |_req, _resp| {
                let finalized = fin2.clone();
                Box::pin(async move {
                    finalized.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

    h.store.create(&Obj::new(foo.clone(), "ns", "a")).await.unwrap();
    h.start().await;

    // the first reconcile persists the finalizer
    let store = h.store.clone();
    let foo2 = foo.clone();
    eventually(
        move || {
            futures::executor::block_on(async {
                store
                    .get(&foo2, "ns", "a")
                    .await
                    .map(|o| o.has_finalizer("rudder/cleanup"))
                    .unwrap_or(false)
            })
        },
        "finalizer to be added",
    )
    .await;
    assert_eq!(finalized.load(Ordering::SeqCst), 0, "cleanup must not run while live");

    h.store.delete(&foo, "ns", "a").await.unwrap();

    let store = h.store.clone();
    let foo3 = foo.clone();
    eventually(
        move || {
            futures::executor::block_on(async {
                store.get(&foo3, "ns", "a").await.is_err()
            })
        },
        "object to be purged once finalized",
    )
    .await;
    assert!(finalized.load(Ordering::SeqCst) >= 1, "cleanup must run during deletion");
}

// Selector-filtered routes only see matching objects.
#[tokio::test(start_paused = true)]
async fn selector_routes_filter() {
    let h = Harness::new("selector");
    let foo = kind("Foo");

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let seen2 = seen.clone();
    h.router
        .route()
        .kind(foo.clone())
        .selector("tier=web".parse().unwrap())
        .handler(handler_fn(move |req, _resp| {
            let seen = seen2.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(req.name.clone());
                Ok(())
            })
        }));

    h.store
        .create(&Obj::new(foo.clone(), "ns", "web-1").with_labels([("tier", "web")]))
        .await
        .unwrap();
    h.store
        .create(&Obj::new(foo.clone(), "ns", "db-1").with_labels([("tier", "db")]))
        .await
        .unwrap();
    h.start().await;
    settle().await;
    settle().await;

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&"web-1".to_string()), "matching object must be handled: {seen:?}");
    assert!(!seen.contains(&"db-1".to_string()), "filtered object must be skipped: {seen:?}");
}

// Post-start hooks run once handlers are up.
#[tokio::test(start_paused = true)]
async fn post_start_hooks_run() {
    let h = Harness::new("post-start");
    let foo = kind("Foo");
    h.router.handle(foo.clone(), handler_fn(|_req, _resp| Box::pin(async { Ok(()) })));

    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    h.router.post_start(Box::new(move |_ct, _client| {
        ran2.store(true, Ordering::SeqCst);
    }));

    h.start().await;
    assert!(ran.load(Ordering::SeqCst), "post-start hook must run after start");
}

// Cancelling the root token drains workers and fires the stopped signal.
#[tokio::test(start_paused = true)]
async fn graceful_stop_signals() {
    let h = Harness::new("stop");
    let foo = kind("Foo");
    h.router.handle(foo.clone(), handler_fn(|_req, _resp| Box::pin(async { Ok(()) })));

    h.store.create(&Obj::new(foo.clone(), "ns", "a")).await.unwrap();
    h.start().await;
    settle().await;

    let stopped = h.router.stopped();
    h.ct.cancel();
    tokio::time::timeout(Duration::from_secs(30), stopped.cancelled())
        .await
        .expect("router must signal stopped after cancel");
}

// The router-level error callback can swallow handler errors, in which case
// save-on-change still runs.
#[tokio::test(start_paused = true)]
async fn error_callback_can_handle_errors() {
    let h = Harness::new("on-error");
    let foo = kind("Foo");

    let swallowed = Arc::new(AtomicUsize::new(0));
    let sw2 = swallowed.clone();
    h.router.on_error(Arc::new(move |_req, _resp, err| {
        if err.is_some() {
            sw2.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        err
    }));

    h.router.handle(
        foo.clone(),
        handler_fn(|req, _resp| {
            Box::pin(async move {
                if let Some(obj) = req.object.as_mut() {
                    obj.spec = json!({"touched": true});
                }
                anyhow::bail!("spurious")
            })
        }),
    );

    h.store.create(&Obj::new(foo.clone(), "ns", "a")).await.unwrap();
    h.start().await;

    let sw3 = swallowed.clone();
    eventually(move || sw3.load(Ordering::SeqCst) >= 1, "error callback to run").await;

    // the handled error still allowed the save to land
    let store = h.store.clone();
    let foo2 = foo.clone();
    eventually(
        move || {
            futures::executor::block_on(async {
                store
                    .get(&foo2, "ns", "a")
                    .await
                    .map(|o| o.spec.get("touched").is_some())
                    .unwrap_or(false)
            })
        },
        "save to run despite the handled error",
    )
    .await;
}
