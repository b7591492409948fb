//! Test suite for the sync submodule.
//!
//! Test categories:
//! 1. Gated pulls (act / criticize, suppression, manual sync)
//! 2. Update cycle (gate bracketing, push after update, failure handling)
//! 3. Shared aggregator (merge rules, rejection)
//! 4. Channel aggregator (service round trip, shutdown, concurrency)

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use burn::backend::NdArray;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::Tensor;

use super::*;
use crate::buffers::{experience_store, SampleRequest, SharedExperienceStore};
use crate::config::{AggregatorConfig, MergeRule, StoreConfig, SyncConfig};
use crate::core::transition::{FieldMap, TransitionRecord};
use crate::error::{SyncError, SyncOp};

type TestBackend = NdArray<f32>;
type Actor = Linear<TestBackend>;
type Critic = Linear<TestBackend>;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Aggregator that only counts calls, optionally failing them.
#[derive(Default)]
struct CountingAggregator {
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    fail_pulls: AtomicBool,
    fail_pushes: AtomicBool,
}

impl CountingAggregator {
    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

impl<M> Aggregator<M> for CountingAggregator {
    fn pull(&self, _model: &mut M, _timeout: Duration) -> Result<(), SyncError> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(SyncError::Unreachable {
                op: SyncOp::Pull,
                reason: "connection refused".into(),
            });
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push(&self, _model: &M, _timeout: Duration) -> Result<(), SyncError> {
        if self.fail_pushes.load(Ordering::SeqCst) {
            return Err(SyncError::Rejected {
                op: SyncOp::Push,
                reason: "stale parameters".into(),
            });
        }
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn actor() -> Actor {
    LinearConfig::new(4, 2).init(&Default::default())
}

fn critic() -> Critic {
    LinearConfig::new(4, 1).init(&Default::default())
}

fn weights(layer: &Linear<TestBackend>) -> Vec<f32> {
    layer.weight.val().into_data().to_vec::<f32>().unwrap()
}

fn observation() -> Tensor<TestBackend, 2> {
    Tensor::ones([1, 4], &Default::default())
}

fn store(records: usize) -> SharedExperienceStore<TestBackend> {
    let store = experience_store(StoreConfig::new(16), Default::default()).unwrap();
    for i in 0..records {
        let mut obs = FieldMap::new();
        obs.insert("obs".to_string(), Tensor::ones([1, 4], &Default::default()));
        let mut act = FieldMap::new();
        act.insert("act".to_string(), Tensor::zeros([1, 2], &Default::default()));
        let record = TransitionRecord::new(obs.clone(), act, obs, i as f32, false).unwrap();
        store.append(record).unwrap();
    }
    store
}

struct Fixture {
    actor_server: Arc<CountingAggregator>,
    critic_server: Arc<CountingAggregator>,
    client: GradientSyncClient<TestBackend, Actor, Critic>,
}

fn fixture_with(config: SyncConfig, store: SharedExperienceStore<TestBackend>) -> Fixture {
    let actor_server = Arc::new(CountingAggregator::default());
    let critic_server = Arc::new(CountingAggregator::default());
    let client = GradientSyncClient::new(
        actor(),
        actor_server.clone(),
        critic(),
        critic_server.clone(),
        store,
        config,
    )
    .unwrap();
    Fixture {
        actor_server,
        critic_server,
        client,
    }
}

fn fixture() -> Fixture {
    fixture_with(SyncConfig::default(), store(0))
}

// =============================================================================
// 1. GATED PULLS
// =============================================================================

#[test]
fn test_act_pulls_when_gate_open() {
    let mut f = fixture();
    let out = f
        .client
        .act(observation(), true, |actor, x| actor.forward(x))
        .unwrap();
    assert_eq!(out.dims(), [1, 2]);
    assert_eq!(f.actor_server.pulls(), 1);
    assert_eq!(f.critic_server.pulls(), 0);
    assert_eq!(f.client.stats().pulls, 1);
}

#[test]
fn test_act_without_pull_flag() {
    let mut f = fixture();
    f.client.act(observation(), false, |actor, x| actor.forward(x)).unwrap();
    assert_eq!(f.actor_server.pulls(), 0);
    assert_eq!(f.client.stats(), SyncStats::default());
}

#[test]
fn test_criticize_pulls_critic_only() {
    let mut f = fixture();
    let value = f
        .client
        .criticize(observation(), true, |critic, x| critic.forward(x))
        .unwrap();
    assert_eq!(value.dims(), [1, 1]);
    assert_eq!(f.critic_server.pulls(), 1);
    assert_eq!(f.actor_server.pulls(), 0);
}

#[test]
fn test_closed_gate_suppresses_pulls() {
    let mut f = fixture();
    f.client.gate().on();
    f.client.act(observation(), true, |actor, x| actor.forward(x)).unwrap();
    f.client.criticize(observation(), true, |critic, x| critic.forward(x)).unwrap();
    assert_eq!(f.actor_server.pulls(), 0);
    assert_eq!(f.critic_server.pulls(), 0);
    assert_eq!(f.client.stats().suppressed_pulls, 2);

    f.client.gate().off();
    f.client.act(observation(), true, |actor, x| actor.forward(x)).unwrap();
    assert_eq!(f.actor_server.pulls(), 1);
}

#[test]
fn test_manual_sync_bypasses_gate() {
    let mut f = fixture();
    f.client.gate().on();
    f.client.manual_sync().unwrap();
    assert_eq!(f.actor_server.pulls(), 1);
    assert_eq!(f.critic_server.pulls(), 1);
    assert_eq!(f.client.stats().pulls, 2);
}

#[test]
fn test_failed_pull_skips_forward() {
    let mut f = fixture();
    f.actor_server.fail_pulls.store(true, Ordering::SeqCst);
    let before = weights(f.client.actor());

    let mut ran = false;
    let err = f
        .client
        .act(observation(), true, |_, _| ran = true)
        .unwrap_err();
    assert!(matches!(err, SyncError::Unreachable { op: SyncOp::Pull, .. }));
    assert!(!ran);
    assert_eq!(weights(f.client.actor()), before);
    assert_eq!(f.client.stats().pulls, 0);
}

// =============================================================================
// 2. UPDATE CYCLE
// =============================================================================

#[test]
fn test_update_closes_gate_and_pushes_once() {
    let mut f = fixture();
    assert!(f.client.gate().is_open());

    let actor_server = f.actor_server.clone();
    let critic_server = f.critic_server.clone();
    let outcome = f.client.run_update(|scope| {
        assert!(!scope.gate().is_open());
        scope.act(observation(), true, |actor, x| actor.forward(x)).unwrap();
        scope.criticize(observation(), true, |critic, x| critic.forward(x)).unwrap();
        // instrumented servers saw no pull and no push yet
        assert_eq!(actor_server.pulls(), 0);
        assert_eq!(critic_server.pulls(), 0);
        assert_eq!(actor_server.pushes(), 0);
        7
    });

    assert_eq!(outcome.output, 7);
    assert!(outcome.push.is_ok());
    assert!(f.client.gate().is_open());
    assert_eq!(f.actor_server.pushes(), 1);
    assert_eq!(f.critic_server.pushes(), 1);
    assert_eq!(
        f.client.stats(),
        SyncStats {
            pulls: 0,
            suppressed_pulls: 2,
            pushes: 2,
            failed_pushes: 0,
        }
    );
}

#[test]
fn test_push_failure_keeps_local_update() {
    let mut f = fixture();
    f.actor_server.fail_pushes.store(true, Ordering::SeqCst);

    let replacement = actor();
    let expected = weights(&replacement);
    let outcome = f.client.run_update(move |scope| {
        *scope.actor_mut() = replacement;
    });

    assert!(matches!(
        outcome.push,
        Err(SyncError::Rejected { op: SyncOp::Push, .. })
    ));
    assert_eq!(weights(f.client.actor()), expected);
    // the critic push is still attempted
    assert_eq!(f.critic_server.pushes(), 1);
    assert_eq!(f.client.stats().failed_pushes, 1);

    // caller-driven retry
    f.actor_server.fail_pushes.store(false, Ordering::SeqCst);
    f.client.push_all().unwrap();
    assert_eq!(f.actor_server.pushes(), 1);
    assert_eq!(f.critic_server.pushes(), 2);
}

#[test]
fn test_outcome_into_result() {
    let mut f = fixture();
    assert_eq!(f.client.run_update(|_| "done").into_result().unwrap(), "done");

    f.critic_server.fail_pushes.store(true, Ordering::SeqCst);
    assert!(f.client.run_update(|_| ()).into_result().is_err());
}

#[test]
fn test_panicking_update_reopens_gate() {
    let mut f = fixture();
    let result = catch_unwind(AssertUnwindSafe(|| {
        f.client.run_update(|_| -> () { panic!("optimizer blew up") });
    }));
    assert!(result.is_err());
    assert!(f.client.gate().is_open());
    assert_eq!(f.actor_server.pushes(), 0);
}

#[test]
fn test_update_samples_from_store() {
    let mut f = fixture_with(SyncConfig::default(), store(5));
    let outcome = f.client.run_update(|scope| {
        let batch = scope.sample(&SampleRequest::all()).unwrap().unwrap();
        assert_eq!(scope.store().size(), 5);
        batch.count()
    });
    assert_eq!(outcome.output, 5);
    // shared stores are kept by default
    assert_eq!(f.client.store().size(), 5);
}

#[test]
fn test_on_policy_update_clears_store() {
    let config = SyncConfig::default().with_clear_store_after_update(true);
    let mut f = fixture_with(config, store(5));
    f.client.run_update(|_| ());
    assert!(f.client.store().is_empty());
}

#[test]
fn test_zero_timeout_rejected() {
    let err = GradientSyncClient::<TestBackend, Actor, Critic>::new(
        actor(),
        Arc::new(CountingAggregator::default()),
        critic(),
        Arc::new(CountingAggregator::default()),
        store(0),
        SyncConfig::default().with_timeout(Duration::ZERO),
    );
    assert!(err.is_err());
}

// =============================================================================
// 3. SHARED AGGREGATOR
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(1);

#[test]
fn test_shared_replace_then_pull() {
    let server = shared_aggregator(actor(), MergeRule::Replace).unwrap();
    let pushed = actor();
    server.push(&pushed, TIMEOUT).unwrap();
    assert_eq!(server.version(), 1);

    let mut local = actor();
    server.pull(&mut local, TIMEOUT).unwrap();
    assert_eq!(weights(&local), weights(&pushed));
}

#[test]
fn test_shared_average() {
    let initial = actor();
    let pushed = actor();
    let (a, b) = (weights(&initial), weights(&pushed));
    let server = SharedAggregator::new(initial, MergeRule::Average { weight: 0.5 }).unwrap();
    server.push(&pushed, TIMEOUT).unwrap();

    let merged = weights(&server.snapshot());
    for i in 0..merged.len() {
        assert!((merged[i] - 0.5 * (a[i] + b[i])).abs() < 1e-5);
    }
}

#[test]
fn test_shared_rejects_mismatched_architecture() {
    let server = shared_aggregator(actor(), MergeRule::default()).unwrap();
    let wide: Actor = LinearConfig::new(5, 2).init(&Default::default());

    let err = server.push(&wide, TIMEOUT).unwrap_err();
    assert!(matches!(err, SyncError::Rejected { op: SyncOp::Push, .. }));
    assert_eq!(server.version(), 0);

    let mut local = wide.clone();
    let err = server.pull(&mut local, TIMEOUT).unwrap_err();
    assert!(matches!(err, SyncError::Rejected { op: SyncOp::Pull, .. }));
    assert_eq!(weights(&local), weights(&wide));
}

#[test]
fn test_invalid_merge_weight() {
    assert!(SharedAggregator::new(actor(), MergeRule::Average { weight: 0.0 }).is_err());
}

#[test]
fn test_client_against_shared_aggregator() {
    let actor_server = shared_aggregator(actor(), MergeRule::Replace).unwrap();
    let critic_server = shared_aggregator(critic(), MergeRule::Replace).unwrap();

    let mut worker = GradientSyncClient::new(
        actor(),
        actor_server.clone(),
        critic(),
        critic_server.clone(),
        store(0),
        SyncConfig::default(),
    )
    .unwrap();
    let mut peer = GradientSyncClient::new(
        actor(),
        actor_server.clone(),
        critic(),
        critic_server.clone(),
        store(0),
        SyncConfig::default(),
    )
    .unwrap();

    let trained = actor();
    let expected = weights(&trained);
    worker
        .run_update(move |scope| *scope.actor_mut() = trained)
        .into_result()
        .unwrap();
    assert_eq!(actor_server.version(), 1);
    assert_eq!(critic_server.version(), 1);

    peer.act(observation(), true, |actor, x| actor.forward(x)).unwrap();
    assert_eq!(weights(peer.actor()), expected);
}

#[test]
fn test_update_trains_pulled_actor() {
    use burn::backend::Autodiff;
    use burn::optim::{GradientsParams, Optimizer, SgdConfig};

    type AD = Autodiff<NdArray<f32>>;
    type Layer = Linear<AD>;

    fn values(layer: &Layer) -> Vec<f32> {
        layer.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    let device = <AD as burn::tensor::backend::Backend>::Device::default();
    let actor_server = shared_aggregator(LinearConfig::new(4, 2).init::<AD>(&device), MergeRule::Replace).unwrap();
    let critic_server = shared_aggregator(LinearConfig::new(4, 1).init::<AD>(&device), MergeRule::Replace).unwrap();
    let store = experience_store::<AD>(StoreConfig::new(4), device.clone()).unwrap();

    let mut client = GradientSyncClient::new(
        LinearConfig::new(4, 2).init::<AD>(&device),
        actor_server.clone(),
        LinearConfig::new(4, 1).init::<AD>(&device),
        critic_server,
        store,
        SyncConfig::default(),
    )
    .unwrap();

    let input = Tensor::<AD, 2>::ones([2, 4], &device);
    client.act(input.clone(), true, |actor, x| actor.forward(x)).unwrap();
    let pulled = values(client.actor());
    assert_eq!(pulled, values(&actor_server.snapshot()));

    let mut optimizer = SgdConfig::new().init::<AD, Layer>();
    let outcome = client.run_update(|scope| {
        let loss = scope.actor().forward(input).sum();
        let grads = GradientsParams::from_grads(loss.backward(), scope.actor());
        let has_grad = grads.get::<NdArray<f32>, 2>(scope.actor().weight.id).is_some();
        let actor = scope.actor().clone();
        *scope.actor_mut() = optimizer.step(0.1, actor, grads);
        has_grad
    });

    assert!(outcome.into_result().unwrap(), "pulled weight received no gradient");
    let trained = values(client.actor());
    assert_ne!(trained, pulled);
    assert_eq!(values(&actor_server.snapshot()), trained);
}

// =============================================================================
// 4. CHANNEL AGGREGATOR
// =============================================================================

fn service_config() -> AggregatorConfig {
    AggregatorConfig::new()
        .with_merge_rule(MergeRule::Replace)
        .with_poll_interval(Duration::from_millis(5))
        .with_thread_name("TestAggregator")
}

#[test]
fn test_channel_round_trip() {
    let (handle, server) = AggregatorService::spawn(actor(), service_config()).unwrap();
    assert!(handle.is_running());

    let pushed = actor();
    server.push(&pushed, TIMEOUT).unwrap();
    assert_eq!(handle.version(), 1);

    let mut local = actor();
    server.pull(&mut local, TIMEOUT).unwrap();
    assert_eq!(weights(&local), weights(&pushed));

    handle.stop_and_wait().unwrap();
}

#[test]
fn test_channel_unreachable_after_stop() {
    let (handle, server) = AggregatorService::spawn(actor(), service_config()).unwrap();
    handle.stop_and_wait().unwrap();

    let mut local = actor();
    let err = server.pull(&mut local, TIMEOUT).unwrap_err();
    assert!(matches!(err, SyncError::Unreachable { op: SyncOp::Pull, .. }));
    let err = server.push(&local, TIMEOUT).unwrap_err();
    assert!(matches!(err, SyncError::Unreachable { op: SyncOp::Push, .. }));
}

#[test]
fn test_channel_rejects_mismatched_architecture() {
    let (handle, server) = AggregatorService::spawn(actor(), service_config()).unwrap();
    let wide: Actor = LinearConfig::new(5, 2).init(&Default::default());
    let err = server.push(&wide, TIMEOUT).unwrap_err();
    assert!(matches!(err, SyncError::Rejected { op: SyncOp::Push, .. }));
    assert_eq!(handle.version(), 0);
    handle.stop_and_wait().unwrap();
}

#[test]
fn test_channel_accepts_unbounded_timeout() {
    let (handle, server) = AggregatorService::spawn(actor(), service_config()).unwrap();
    let (critic_handle, critic_server) = AggregatorService::spawn(critic(), service_config()).unwrap();

    let pushed = actor();
    server.push(&pushed, Duration::MAX).unwrap();
    let mut local = actor();
    server.pull(&mut local, Duration::MAX).unwrap();
    assert_eq!(weights(&local), weights(&pushed));

    let mut client = GradientSyncClient::new(
        actor(),
        Arc::new(server.clone()),
        critic(),
        Arc::new(critic_server),
        store(0),
        SyncConfig::new().with_timeout(Duration::MAX),
    )
    .unwrap();
    client.manual_sync().unwrap();
    assert_eq!(weights(client.actor()), weights(&pushed));

    handle.stop_and_wait().unwrap();
    critic_handle.stop_and_wait().unwrap();
    let err = server.pull(&mut local, Duration::MAX).unwrap_err();
    assert!(matches!(err, SyncError::Unreachable { op: SyncOp::Pull, .. }));
}

#[test]
fn test_service_exits_when_clients_dropped() {
    let (handle, server) = AggregatorService::spawn(actor(), service_config()).unwrap();
    drop(server);
    handle.join().unwrap();
}

#[test]
fn test_invalid_service_config() {
    let config = service_config().with_queue_capacity(0);
    assert!(AggregatorService::spawn::<TestBackend, Actor>(actor(), config).is_err());
}

#[test]
fn test_concurrent_workers_push_through_service() {
    let (actor_handle, actor_server) = AggregatorService::spawn(actor(), service_config()).unwrap();
    let (critic_handle, critic_server) = AggregatorService::spawn(critic(), service_config()).unwrap();
    let shared_store = store(8);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let actor_server = actor_server.clone();
            let critic_server = critic_server.clone();
            let store = shared_store.clone();
            thread::spawn(move || {
                let mut client = GradientSyncClient::new(
                    actor(),
                    Arc::new(actor_server),
                    critic(),
                    Arc::new(critic_server),
                    store,
                    SyncConfig::default(),
                )
                .unwrap();
                for _ in 0..5 {
                    client.act(observation(), true, |actor, x| actor.forward(x)).unwrap();
                    let outcome = client.run_update(|scope| {
                        let batch = scope.sample(&SampleRequest::new(4)).unwrap();
                        *scope.actor_mut() = actor();
                        batch.map(|b| b.count())
                    });
                    assert_eq!(outcome.into_result().unwrap(), Some(4));
                }
                client.stats()
            })
        })
        .collect();

    for worker in workers {
        let stats = worker.join().unwrap();
        assert_eq!(stats.pushes, 10);
        assert_eq!(stats.pulls, 5);
    }
    assert_eq!(actor_handle.version(), 20);
    assert_eq!(critic_handle.version(), 20);

    actor_handle.stop_and_wait().unwrap();
    critic_handle.stop_and_wait().unwrap();
}
