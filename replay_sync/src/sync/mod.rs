//! Push/pull parameter synchronization.
//!
//! - `Aggregator`: boundary trait to a parameter server
//! - `GradientSyncClient`: per-worker façade with gated pulls and unconditional pushes
//! - `SharedAggregator`: in-process aggregator behind a mutex
//! - `AggregatorService` / `ChannelAggregator`: aggregator on its own thread, over channels

pub mod aggregator;
pub mod channel;
pub mod client;
pub mod merge;
pub mod shared;

pub use aggregator::{Aggregator, SharedAggregatorRef};
pub use channel::{AggregatorHandle, AggregatorService, ChannelAggregator};
pub use client::{GradientSyncClient, SyncStats, UpdateOutcome, UpdateScope};
pub use merge::{blend, overwrite, MergeError};
pub use shared::{shared_aggregator, SharedAggregator};

#[cfg(test)]
mod tests;
