//! Boundary to the parameter aggregator.

use std::sync::Arc;
use std::time::Duration;

use crate::error::SyncError;

/// A parameter server shared by many workers.
///
/// Implementations merge pushed parameters into a running aggregate and
/// serve the latest aggregate on pull. Both calls must give up after
/// `timeout` with [`SyncError::Timeout`] rather than block indefinitely,
/// and must leave `model` untouched when they fail.
pub trait Aggregator<M>: Send + Sync {
    /// Overwrite `model`'s parameters with the current aggregate.
    fn pull(&self, model: &mut M, timeout: Duration) -> Result<(), SyncError>;

    /// Merge `model`'s parameters into the aggregate.
    fn push(&self, model: &M, timeout: Duration) -> Result<(), SyncError>;
}

impl<M, A> Aggregator<M> for Arc<A>
where
    A: Aggregator<M> + ?Sized,
{
    fn pull(&self, model: &mut M, timeout: Duration) -> Result<(), SyncError> {
        (**self).pull(model, timeout)
    }

    fn push(&self, model: &M, timeout: Duration) -> Result<(), SyncError> {
        (**self).push(model, timeout)
    }
}

/// Aggregator handle shared between the workers of one process.
pub type SharedAggregatorRef<M> = Arc<dyn Aggregator<M>>;
