use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use storefront_live::collection::error::{permission_denied, unavailable, CollectionErrorCode};
use storefront_live::collection::model::fields_from_json;
use storefront_live::collection::{
    CollectionKey, InMemoryCollectionSource, MultiplexerSettings, RemoteCollectionSource, Snapshot,
    SnapshotObserver, SubscriptionMultiplexer,
};
use storefront_live::util::BackoffSettings;

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn key(name: &str) -> CollectionKey {
    CollectionKey::new(name).unwrap()
}

fn fast_backoff() -> BackoffSettings {
    BackoffSettings::default()
        .with_initial_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(200))
        .with_jitter(0.0)
}

fn multiplexer(source: &InMemoryCollectionSource, grace: Duration) -> SubscriptionMultiplexer {
    SubscriptionMultiplexer::with_settings(
        Arc::new(source.clone()),
        MultiplexerSettings::default()
            .with_grace_period(grace)
            .with_backoff(fast_backoff()),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn two_subscribers_share_one_upstream() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(100));
    let catalog = key("catalog-items");

    let a = multiplexer.attach(catalog.clone());
    let b = multiplexer.attach(catalog.clone());
    assert_eq!(multiplexer.ref_count(&catalog), 2);

    wait_for(|| a.current_snapshot().is_loaded() && b.current_snapshot().is_loaded()).await;
    assert_eq!(source.subscribe_count(&catalog), 1);
    assert_eq!(source.open_subscriptions(&catalog), 1);

    drop(a);
    assert_eq!(multiplexer.ref_count(&catalog), 1);
    drop(b);
    assert_eq!(multiplexer.ref_count(&catalog), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_closes_exactly_once_after_grace_period() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(80));
    let inquiries = key("inquiries");

    let subscriber = multiplexer.attach(inquiries.clone());
    wait_for(|| multiplexer.is_upstream_open(&inquiries)).await;
    multiplexer.detach(subscriber);

    assert_eq!(source.close_count(&inquiries), 0);
    assert_eq!(multiplexer.active_keys(), vec![inquiries.clone()]);

    wait_for(|| source.close_count(&inquiries) == 1).await;
    assert!(multiplexer.active_keys().is_empty());
    assert!(!multiplexer.is_upstream_open(&inquiries));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(source.close_count(&inquiries), 1);
    assert_eq!(source.subscribe_count(&inquiries), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reattach_within_grace_period_reuses_upstream() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(150));
    let reviews = key("reviews");

    let first = multiplexer.attach(reviews.clone());
    wait_for(|| first.current_snapshot().is_loaded()).await;
    drop(first);

    let second = multiplexer.attach(reviews.clone());
    assert!(second.current_snapshot().is_loaded());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(source.subscribe_count(&reviews), 1);
    assert_eq!(source.close_count(&reviews), 0);
    assert_eq!(multiplexer.ref_count(&reviews), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn attach_after_teardown_starts_cold() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::ZERO);
    let reviews = key("reviews");
    source
        .create(&reviews, fields_from_json(json!({ "name": "Avi" })).unwrap())
        .await
        .unwrap();

    let first = multiplexer.attach(reviews.clone());
    wait_for(|| first.current_snapshot().is_loaded()).await;
    source
        .create(&reviews, fields_from_json(json!({ "name": "Bo" })).unwrap())
        .await
        .unwrap();
    wait_for(|| first.current_snapshot().snapshot().map(|s| s.version()) == Some(2)).await;
    drop(first);
    wait_for(|| source.close_count(&reviews) == 1).await;

    let second = multiplexer.attach(reviews.clone());
    wait_for(|| second.current_snapshot().is_loaded()).await;
    let state = multiplexer.current_snapshot(&reviews);
    let snapshot = state.snapshot().unwrap();
    assert_eq!(snapshot.version(), 1);
    assert_eq!(snapshot.len(), 2);
    assert_eq!(source.subscribe_count(&reviews), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribers_agree_at_each_version() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(50));
    let catalog = key("catalog-items");

    let a = multiplexer.attach(catalog.clone());
    let b = multiplexer.attach_with_overlay(catalog.clone());

    let seen_by_a = Arc::new(Mutex::new(Vec::new()));
    let seen_by_b = Arc::new(Mutex::new(Vec::new()));
    let (sink_a, sink_b) = (seen_by_a.clone(), seen_by_b.clone());
    a.on_update(SnapshotObserver::new().with_next(move |snapshot| {
        sink_a.lock().unwrap().push(snapshot.clone());
    }));
    b.on_update(SnapshotObserver::new().with_next(move |snapshot| {
        sink_b.lock().unwrap().push(snapshot.clone());
    }));

    wait_for(|| a.current_snapshot().is_loaded()).await;
    for price in [100, 200, 300] {
        source
            .create(&catalog, fields_from_json(json!({ "price": price })).unwrap())
            .await
            .unwrap();
    }
    wait_for(|| {
        let last = |seen: &Arc<Mutex<Vec<Snapshot>>>| {
            seen.lock().unwrap().last().map(|s| s.version())
        };
        last(&seen_by_a) == Some(4) && last(&seen_by_b) == Some(4)
    })
    .await;

    let a_versions = seen_by_a.lock().unwrap().clone();
    let b_versions = seen_by_b.lock().unwrap().clone();
    for snapshot in &a_versions {
        let twin = b_versions
            .iter()
            .find(|other| other.version() == snapshot.version())
            .expect("both subscribers observe every version");
        assert_eq!(twin.documents(), snapshot.documents());
    }
    let versions: Vec<u64> = a_versions.iter().map(|s| s.version()).collect();
    assert!(versions.windows(2).all(|pair| pair[1] == pair[0] + 1));
    assert_eq!(a.current_snapshot(), b.current_snapshot());
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_error_keeps_stale_snapshot_and_reconnects() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(50));
    let reviews = key("reviews");
    source
        .create(&reviews, fields_from_json(json!({ "name": "Dana" })).unwrap())
        .await
        .unwrap();

    let subscriber = multiplexer.attach(reviews.clone());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    subscriber.on_update(SnapshotObserver::new().with_error(move |error| {
        sink.lock().unwrap().push(error.code);
    }));
    wait_for(|| subscriber.current_snapshot().is_loaded()).await;

    source.fail_next_subscribe(unavailable("still offline"));
    source.fail_next_subscribe(unavailable("still offline"));
    source.emit_error(&reviews, unavailable("connection reset"));

    wait_for(|| subscriber.last_error().is_some()).await;
    let state = subscriber.current_snapshot();
    let stale = state.snapshot().unwrap();
    assert!(stale.is_stale());
    assert_eq!(stale.len(), 1);

    wait_for(|| subscriber.last_error().is_none()).await;
    assert!(!subscriber.current_snapshot().snapshot().unwrap().is_stale());
    assert_eq!(source.subscribe_count(&reviews), 2);
    assert_eq!(source.open_subscriptions(&reviews), 1);
    wait_for(|| errors.lock().unwrap().len() >= 3).await;
    assert!(errors
        .lock()
        .unwrap()
        .iter()
        .all(|code| *code == CollectionErrorCode::Unavailable));
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_leave_error_visible() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = SubscriptionMultiplexer::with_settings(
        Arc::new(source.clone()),
        MultiplexerSettings::default().with_backoff(fast_backoff().with_max_attempts(1)),
    );
    let business = key("business");
    source.fail_next_subscribe(unavailable("offline"));
    source.fail_next_subscribe(unavailable("offline"));

    let subscriber = multiplexer.attach(business.clone());
    wait_for(|| subscriber.last_error().is_some()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        subscriber.last_error().map(|error| error.code),
        Some(CollectionErrorCode::Unavailable)
    );
    assert!(!subscriber.current_snapshot().is_loaded());
    assert_eq!(source.subscribe_count(&business), 0);
    assert!(!multiplexer.is_upstream_open(&business));
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_denied_is_not_retried() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(50));
    let business = key("business");
    source.fail_next_subscribe(permission_denied("rules"));

    let subscriber = multiplexer.attach(business.clone());
    wait_for(|| subscriber.last_error().is_some()).await;
    // Well past several fast backoff delays; a retry would now succeed.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        subscriber.last_error().map(|error| error.code),
        Some(CollectionErrorCode::PermissionDenied)
    );
    assert!(!subscriber.current_snapshot().is_loaded());
    assert_eq!(source.subscribe_count(&business), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn permission_denied_on_live_stream_stops_reconnecting() {
    let source = InMemoryCollectionSource::new();
    let multiplexer = multiplexer(&source, Duration::from_millis(50));
    let reviews = key("reviews");
    let subscriber = multiplexer.attach(reviews.clone());
    wait_for(|| subscriber.current_snapshot().is_loaded()).await;

    source.emit_error(&reviews, permission_denied("access revoked"));
    wait_for(|| subscriber.last_error().is_some()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(source.subscribe_count(&reviews), 1);
    assert!(!multiplexer.is_upstream_open(&reviews));
    let state = subscriber.current_snapshot();
    assert!(state.snapshot().unwrap().is_stale());
}
