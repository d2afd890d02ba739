// Concurrent evaluation against the same (user, command) key

use chrono::{Duration, Utc};
use cmdgate::admission::{
    AdmissionEngine, AnalyticsSink, CommandPolicy, CounterKey, DecisionStatus, EntitlementStore,
    PolicyStore, TierLimit, UsageCounterStore,
};
use cmdgate::storage::{MemoryStore, SqliteStore};
use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;

const CALLERS: u32 = 16;

trait Backend: EntitlementStore + UsageCounterStore + AnalyticsSink + 'static {}
impl<T: EntitlementStore + UsageCounterStore + AnalyticsSink + 'static> Backend for T {}

fn engine_with_limit<S: Backend>(store: Arc<S>, limit: i64) -> AdmissionEngine {
    let policies = PolicyStore::new(
        None,
        vec![CommandPolicy::new(
            "sticker",
            None,
            Some(TierLimit::new(limit, 60)),
        )],
    );
    AdmissionEngine::with_store(policies, store)
}

fn sqlite() -> (Arc<SqliteStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("concurrency.db")).unwrap();
    (Arc::new(store), dir)
}

async fn no_double_counting<S: Backend>(store: Arc<S>) {
    let engine = engine_with_limit(store.clone(), i64::from(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.evaluate("racer", "sticker", None).await })
        })
        .collect();

    let mut counts: Vec<u32> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| {
            let decision = joined.unwrap().unwrap();
            assert_eq!(decision.status, DecisionStatus::Allowed);
            decision.count_before_decision.unwrap()
        })
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, (0..CALLERS).collect::<Vec<_>>());

    let overflow = engine.evaluate("racer", "sticker", None).await.unwrap();
    assert_eq!(overflow.status, DecisionStatus::RateLimited);
    assert_eq!(overflow.count_before_decision, Some(CALLERS));

    let stored = store
        .get(&CounterKey::new("racer", "sticker"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.count, CALLERS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_counting_memory() {
    no_double_counting(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_double_counting_sqlite() {
    let (store, _dir) = sqlite();
    no_double_counting(store).await;
}

async fn admits_exactly_the_limit<S: Backend>(store: Arc<S>) {
    let limit = CALLERS / 2;
    let engine = engine_with_limit(store, i64::from(limit));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.evaluate("crowd", "sticker", None).await })
        })
        .collect();

    let decisions: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let allowed = decisions.iter().filter(|d| d.is_allowed()).count();
    let limited = decisions
        .iter()
        .filter(|d| d.status == DecisionStatus::RateLimited)
        .count();
    assert_eq!(allowed, limit as usize);
    assert_eq!(limited, (CALLERS - limit) as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admits_exactly_the_limit_memory() {
    admits_exactly_the_limit(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admits_exactly_the_limit_sqlite() {
    let (store, _dir) = sqlite();
    admits_exactly_the_limit(store).await;
}

async fn lazy_expiry_is_idempotent<S: Backend>(store: Arc<S>) {
    let now = Utc::now();
    store
        .grant("lapsed", Some(now - Duration::minutes(5)))
        .await
        .unwrap();

    let first = store.clone();
    let second = store.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.clear_if_expired("lapsed", now).await }),
        tokio::spawn(async move { second.clear_if_expired("lapsed", now).await }),
    );
    let cleared = [a.unwrap().unwrap(), b.unwrap().unwrap()];
    assert_eq!(cleared.iter().filter(|c| **c).count(), 1);

    let record = store.fetch("lapsed").await.unwrap().unwrap();
    assert!(!record.is_premium);
    assert!(record.premium_expires_at.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lazy_expiry_is_idempotent_memory() {
    lazy_expiry_is_idempotent(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lazy_expiry_is_idempotent_sqlite() {
    let (store, _dir) = sqlite();
    lazy_expiry_is_idempotent(store).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_evaluations_on_lapsed_premium() {
    let (store, _dir) = sqlite();
    store
        .grant("lapsed", Some(Utc::now() - Duration::minutes(5)))
        .await
        .unwrap();
    let engine = engine_with_limit(store.clone(), 5);

    let (a, b) = tokio::join!(
        engine.evaluate("lapsed", "sticker", None),
        engine.evaluate("lapsed", "sticker", None),
    );
    assert!(!a.unwrap().is_premium);
    assert!(!b.unwrap().is_premium);
    assert!(!store.fetch("lapsed").await.unwrap().unwrap().is_premium);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_do_not_share_windows() {
    let engine = engine_with_limit(Arc::new(MemoryStore::new()), 1);

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.evaluate(&format!("user-{}", i), "sticker", None).await })
        })
        .collect();

    for joined in join_all(handles).await {
        let decision = joined.unwrap().unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.count_before_decision, Some(0));
    }
}
