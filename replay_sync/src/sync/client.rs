//! Per-worker push/pull façade around a local actor and critic.
//!
//! # Protocol
//!
//! ```text
//! act / criticize ──(pull && gate open)──> Aggregator::pull ──> forward
//!
//! run_update:
//!   gate.close() ─> body(&mut UpdateScope) ─> gate reopens ─> push actor, push critic
//!                   (pulls inside are suppressed)             (never gated)
//! ```
//!
//! Pulls are conditional and gated; pushes are unconditional. Neither is
//! retried: the caller owns retry policy. A failed push leaves the locally
//! updated models in place, so the caller can retry with [`push_all`].
//!
//! [`push_all`]: GradientSyncClient::push_all

use std::time::Duration;

use burn::tensor::backend::Backend;

use crate::buffers::{SampleRequest, SampledBatch, SharedExperienceStore};
use crate::config::{ConfigError, SyncConfig};
use crate::core::sync_gate::SyncGate;
use crate::error::{BufferError, SyncError};
use crate::sync::aggregator::SharedAggregatorRef;

/// Counters kept by a [`GradientSyncClient`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Pulls that reached the aggregator and succeeded.
    pub pulls: u64,
    /// Pulls skipped because the gate was closed.
    pub suppressed_pulls: u64,
    /// Successful pushes.
    pub pushes: u64,
    /// Pushes that returned an error.
    pub failed_pushes: u64,
}

/// A local model and the aggregator it syncs with.
struct Replica<M> {
    model: M,
    server: SharedAggregatorRef<M>,
}

impl<M> Replica<M> {
    /// Pull unless `gate` is closed.
    fn gated_pull(
        &mut self,
        role: &'static str,
        gate: &SyncGate,
        stats: &mut SyncStats,
        timeout: Duration,
    ) -> Result<(), SyncError> {
        if gate.get() {
            stats.suppressed_pulls += 1;
            log::trace!("Suppressed {} pull during local update", role);
            return Ok(());
        }
        self.pull(stats, timeout)
    }

    fn pull(&mut self, stats: &mut SyncStats, timeout: Duration) -> Result<(), SyncError> {
        self.server.pull(&mut self.model, timeout)?;
        stats.pulls += 1;
        Ok(())
    }

    fn push(&self, role: &'static str, stats: &mut SyncStats, timeout: Duration) -> Result<(), SyncError> {
        match self.server.push(&self.model, timeout) {
            Ok(()) => {
                stats.pushes += 1;
                Ok(())
            }
            Err(err) => {
                stats.failed_pushes += 1;
                log::warn!("Failed to push {} parameters: {}", role, err);
                Err(err)
            }
        }
    }
}

/// Result of [`GradientSyncClient::run_update`].
///
/// `output` is always available: the local update completed even when the
/// trailing push failed.
#[derive(Debug)]
pub struct UpdateOutcome<T> {
    /// Value returned by the update body.
    pub output: T,
    /// Result of pushing both models after the update.
    pub push: Result<(), SyncError>,
}

impl<T> UpdateOutcome<T> {
    /// The body's output if the push succeeded.
    pub fn into_result(self) -> Result<T, SyncError> {
        self.push.map(|()| self.output)
    }
}

/// Asynchronous actor-critic worker: local actor and critic models, each
/// synchronized with its own aggregator, plus the shared experience store.
///
/// One client per worker; the client (and its gate) is never shared between
/// threads.
pub struct GradientSyncClient<B: Backend, A, C> {
    actor: Replica<A>,
    critic: Replica<C>,
    store: SharedExperienceStore<B>,
    gate: SyncGate,
    config: SyncConfig,
    stats: SyncStats,
}

impl<B: Backend, A, C> GradientSyncClient<B, A, C> {
    /// Create a worker around local copies of the actor and critic.
    pub fn new(
        actor: A,
        actor_server: SharedAggregatorRef<A>,
        critic: C,
        critic_server: SharedAggregatorRef<C>,
        store: SharedExperienceStore<B>,
        config: SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            actor: Replica {
                model: actor,
                server: actor_server,
            },
            critic: Replica {
                model: critic,
                server: critic_server,
            },
            store,
            gate: SyncGate::new(),
            config,
            stats: SyncStats::default(),
        })
    }

    /// Run `forward` on the actor, pulling fresh parameters first when
    /// `pull` is set and the gate is open.
    ///
    /// A failed pull is returned without running `forward`; the local actor
    /// is unchanged.
    pub fn act<I, R>(&mut self, input: I, pull: bool, forward: impl FnOnce(&A, I) -> R) -> Result<R, SyncError> {
        if pull {
            self.actor
                .gated_pull("actor", &self.gate, &mut self.stats, self.config.timeout)?;
        }
        Ok(forward(&self.actor.model, input))
    }

    /// Run `forward` on the critic, pulling first under the same rule as [`act`](Self::act).
    pub fn criticize<I, R>(&mut self, input: I, pull: bool, forward: impl FnOnce(&C, I) -> R) -> Result<R, SyncError> {
        if pull {
            self.critic
                .gated_pull("critic", &self.gate, &mut self.stats, self.config.timeout)?;
        }
        Ok(forward(&self.critic.model, input))
    }

    /// Run one local update with sync disabled, then push both models.
    ///
    /// The gate is closed for the duration of `body` and reopened on every
    /// exit path, unwinding included. The push is attempted after every
    /// completed body and its outcome is reported next to the body's output.
    pub fn run_update<T>(&mut self, body: impl FnOnce(&mut UpdateScope<'_, B, A, C>) -> T) -> UpdateOutcome<T> {
        let output = {
            let _closed = self.gate.close();
            let mut scope = UpdateScope {
                actor: &mut self.actor,
                critic: &mut self.critic,
                store: &self.store,
                gate: &self.gate,
                stats: &mut self.stats,
                timeout: self.config.timeout,
            };
            body(&mut scope)
        };

        if self.config.clear_store_after_update {
            self.store.clear();
        }
        let push = self.push_all();
        UpdateOutcome { output, push }
    }

    /// Push both models, regardless of the gate.
    ///
    /// Both pushes are attempted; the first error is returned.
    pub fn push_all(&mut self) -> Result<(), SyncError> {
        let timeout = self.config.timeout;
        let actor = self.actor.push("actor", &mut self.stats, timeout);
        let critic = self.critic.push("critic", &mut self.stats, timeout);
        actor.and(critic)
    }

    /// Pull both models, bypassing the gate.
    pub fn manual_sync(&mut self) -> Result<(), SyncError> {
        let timeout = self.config.timeout;
        self.actor.pull(&mut self.stats, timeout)?;
        self.critic.pull(&mut self.stats, timeout)
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn actor(&self) -> &A {
        &self.actor.model
    }

    pub fn critic(&self) -> &C {
        &self.critic.model
    }

    pub fn store(&self) -> &SharedExperienceStore<B> {
        &self.store
    }

    /// Consume the client, returning the local actor and critic.
    pub fn into_models(self) -> (A, C) {
        (self.actor.model, self.critic.model)
    }
}

/// Access granted to the body of [`GradientSyncClient::run_update`].
///
/// Models are replaced wholesale (`*scope.actor_mut() = optimizer.step(..)`)
/// as burn optimizers consume and return them.
pub struct UpdateScope<'a, B: Backend, A, C> {
    actor: &'a mut Replica<A>,
    critic: &'a mut Replica<C>,
    store: &'a SharedExperienceStore<B>,
    gate: &'a SyncGate,
    stats: &'a mut SyncStats,
    timeout: Duration,
}

impl<B: Backend, A, C> UpdateScope<'_, B, A, C> {
    pub fn actor(&self) -> &A {
        &self.actor.model
    }

    pub fn actor_mut(&mut self) -> &mut A {
        &mut self.actor.model
    }

    pub fn critic(&self) -> &C {
        &self.critic.model
    }

    pub fn critic_mut(&mut self) -> &mut C {
        &mut self.critic.model
    }

    pub fn store(&self) -> &SharedExperienceStore<B> {
        self.store
    }

    pub fn gate(&self) -> &SyncGate {
        self.gate
    }

    /// Draw a batch from the shared store.
    pub fn sample(&self, request: &SampleRequest<B>) -> Result<Option<SampledBatch<B>>, BufferError> {
        self.store.sample_batch(request)
    }

    /// Same as [`GradientSyncClient::act`]; any pull is suppressed.
    pub fn act<I, R>(&mut self, input: I, pull: bool, forward: impl FnOnce(&A, I) -> R) -> Result<R, SyncError> {
        if pull {
            self.actor.gated_pull("actor", self.gate, self.stats, self.timeout)?;
        }
        Ok(forward(&self.actor.model, input))
    }

    /// Same as [`GradientSyncClient::criticize`]; any pull is suppressed.
    pub fn criticize<I, R>(&mut self, input: I, pull: bool, forward: impl FnOnce(&C, I) -> R) -> Result<R, SyncError> {
        if pull {
            self.critic.gated_pull("critic", self.gate, self.stats, self.timeout)?;
        }
        Ok(forward(&self.critic.model, input))
    }
}
