//! In-process aggregator for workers running as threads of one process.
//!
//! The aggregate lives in a single mutex-guarded slot. Pulls clone it out
//! under the lock and load it into the caller's model after release; pushes
//! merge under the lock. Lock acquisition is bounded by the caller's timeout.
//!
//! # Thread Safety
//!
//! Burn modules are `Send` but not `Sync`, so the aggregate sits behind a
//! `Mutex` (which only needs `M: Send`) rather than an `RwLock`.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use burn::module::Module;
use burn::tensor::backend::Backend;
use parking_lot::Mutex;

use crate::config::{ConfigError, MergeRule};
use crate::error::{SyncError, SyncOp};
use crate::sync::aggregator::Aggregator;
use crate::sync::merge::{blend, overwrite, MergeError};

/// Running aggregate plus the rule used to fold pushes into it.
///
/// Shared by [`SharedAggregator`] and the channel service thread.
pub(crate) struct AggregateState<B: Backend, M: Module<B>> {
    merged: M,
    rule: MergeRule,
    pushes: u64,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> AggregateState<B, M> {
    pub(crate) fn new(initial: M, rule: MergeRule) -> Self {
        Self {
            merged: initial,
            rule,
            pushes: 0,
            _backend: PhantomData,
        }
    }

    /// Fold `pushed` into the aggregate. Returns the new version.
    ///
    /// On error the aggregate is unchanged.
    pub(crate) fn absorb(&mut self, pushed: &M) -> Result<u64, MergeError> {
        let merged = blend(self.merged.clone(), pushed, self.rule.weight())?;
        self.merged = merged;
        self.pushes += 1;
        Ok(self.pushes)
    }

    pub(crate) fn snapshot(&self) -> M {
        self.merged.clone()
    }
}

/// Load `aggregate` into `model`, leaving `model` untouched on mismatch.
pub(crate) fn load_into<B: Backend, M: Module<B>>(model: &mut M, aggregate: &M) -> Result<(), SyncError> {
    let loaded = overwrite(model.clone(), aggregate).map_err(|e| rejected(SyncOp::Pull, e))?;
    *model = loaded;
    Ok(())
}

pub(crate) fn rejected(op: SyncOp, err: MergeError) -> SyncError {
    SyncError::Rejected {
        op,
        reason: err.to_string(),
    }
}

/// Aggregator shared by reference between worker threads.
pub struct SharedAggregator<B: Backend, M: Module<B>> {
    state: Mutex<AggregateState<B, M>>,
    /// Mirror of the push count, readable without the lock.
    version: AtomicU64,
}

impl<B: Backend, M: Module<B>> SharedAggregator<B, M> {
    /// Start aggregating from `initial`.
    pub fn new(initial: M, rule: MergeRule) -> Result<Self, ConfigError> {
        rule.validate()?;
        Ok(Self {
            state: Mutex::new(AggregateState::new(initial, rule)),
            version: AtomicU64::new(0),
        })
    }

    /// Number of accepted pushes so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Clone of the current aggregate.
    pub fn snapshot(&self) -> M {
        self.state.lock().snapshot()
    }
}

impl<B, M> Aggregator<M> for SharedAggregator<B, M>
where
    B: Backend,
    M: Module<B>,
{
    fn pull(&self, model: &mut M, timeout: Duration) -> Result<(), SyncError> {
        let aggregate = {
            let state = self.state.try_lock_for(timeout).ok_or(SyncError::Timeout {
                op: SyncOp::Pull,
                timeout,
            })?;
            state.snapshot()
        };
        load_into(model, &aggregate)
    }

    fn push(&self, model: &M, timeout: Duration) -> Result<(), SyncError> {
        let mut state = self.state.try_lock_for(timeout).ok_or(SyncError::Timeout {
            op: SyncOp::Push,
            timeout,
        })?;
        let version = state.absorb(model).map_err(|e| rejected(SyncOp::Push, e))?;
        self.version.store(version, Ordering::Release);
        Ok(())
    }
}

/// Create a new shared aggregator.
pub fn shared_aggregator<B: Backend, M: Module<B>>(
    initial: M,
    rule: MergeRule,
) -> Result<Arc<SharedAggregator<B, M>>, ConfigError> {
    Ok(Arc::new(SharedAggregator::new(initial, rule)?))
}
