//! Experience storage and batching.
//!
//! - `ExperienceStore`: fixed-capacity ring buffer shared by producers
//! - `SampleStrategy`: how records are drawn (`random_unique`, `random`, `all`, custom)
//! - `SampleRequest` / `SampledBatch`: schema-aware batch concatenation

pub mod batch;
pub mod experience_store;
pub mod sampling;

pub use batch::{BatchField, GroupColumn, SampleRequest, SampledBatch};
pub use experience_store::{experience_store, ExperienceStore, Schema, SharedExperienceStore};
pub use sampling::{SampleStrategy, SelectFn};
