//! # Replay Sync: Experience Replay and Push/Pull Parameter Sync
//!
//! Concurrency core of an asynchronous actor-critic training loop: a
//! ring-buffered experience store shared by producers and learners, and a
//! push/pull synchronization protocol that lets independent workers train
//! local model copies and merge them through a central aggregator.
//!
//! ## Architecture Overview
//!
//! ```text
//! Producers ──append──> ExperienceStore (ring) ──sample_batch──┐
//!                                                               ▼
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ Worker 0         │  │ Worker 1         │  │ Worker N         │
//! │ GradientSync-    │  │ GradientSync-    │  │ GradientSync-    │
//! │ Client + Gate    │  │ Client + Gate    │  │ Client + Gate    │
//! └──┬───────────▲───┘  └──┬───────────▲───┘  └──┬───────────▲───┘
//!    │ push      │ pull    │           │         │           │
//!    ▼           │         ▼           │         ▼           │
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Aggregator: SharedAggregator (in-process mutex) or            │
//! │             AggregatorService (dedicated thread + channels)   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pulls happen before inference unless the worker's gate is closed by an
//! update in progress; every completed update is pushed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replay_sync::{experience_store, GradientSyncClient, SampleRequest, StoreConfig, SyncConfig};
//!
//! let store = experience_store::<B>(StoreConfig::new(100_000), device.clone())?;
//! store.append(record)?;
//!
//! let mut worker = GradientSyncClient::new(actor, actor_server, critic, critic_server, store, SyncConfig::new())?;
//! let action = worker.act(obs, true, |actor, obs| actor.forward(obs))?;
//! let outcome = worker.run_update(|scope| {
//!     let batch = scope.sample(&SampleRequest::new(64))?;
//!     // optimizer step on scope.actor_mut() / scope.critic_mut()
//!     Ok::<_, BufferError>(batch.map(|b| b.count()))
//! });
//! ```

pub mod buffers;
pub mod config;
pub mod core;
pub mod error;
pub mod sync;

pub use buffers::{
    experience_store, BatchField, ExperienceStore, GroupColumn, SampleRequest, SampleStrategy,
    SampledBatch, Schema, SelectFn, SharedExperienceStore,
};
pub use config::{AggregatorConfig, ConfigError, MergeRule, StoreConfig, SyncConfig};
pub use crate::core::{
    ExtraField, ExtraValue, FieldMap, GateGuard, IntoTransition, RecordFields, Reward, SyncGate,
    TransitionRecord,
};
pub use error::{BufferError, ServiceError, SyncError, SyncOp};
pub use sync::{
    shared_aggregator, Aggregator, AggregatorHandle, AggregatorService, ChannelAggregator,
    GradientSyncClient, MergeError, SharedAggregator, SharedAggregatorRef, SyncStats,
    UpdateOutcome, UpdateScope,
};
