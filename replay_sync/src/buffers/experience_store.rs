//! Fixed-capacity ring buffer of transition records.
//!
//! # Design
//!
//! - Producers append under an exclusive write lock: validation and device
//!   migration happen before the lock is taken, so the critical section is
//!   just the schema check, the slot write and the cursor update.
//! - The learner samples under a shared read lock, cloning record handles
//!   (tensors are reference counted) and concatenating after release.
//! - `size()` reads an atomic mirror of the length and never blocks.
//!
//! ```text
//! Producer 0 ─┐                                      ┌─> sample_batch (read lock)
//! Producer 1 ─┼─> append ──> RingStorage (write) ────┤
//! Producer N ─┘     [schema check, slot, cursor]     └─> size() (atomic)
//! ```
//!
//! # Consistency
//!
//! Sampling concurrently with appends is relaxed: a sample may include a
//! record that a concurrent append evicts right after, or miss one inserted
//! right before. `clear()` and `replace_contents()` are internally
//! serialized, but interleaving them with in-flight appends or samples from
//! other threads must be coordinated by the caller.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::tensor::backend::Backend;
use parking_lot::RwLock;

use crate::buffers::batch::{concatenate_batch, SampleRequest, SampledBatch};
use crate::config::StoreConfig;
use crate::core::transition::{IntoTransition, TransitionRecord, CORE_FIELDS};
use crate::error::BufferError;

/// Field-name set every stored record must match.
///
/// Fixed by the first record appended to an empty store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: BTreeSet<String>,
}

impl Schema {
    fn of<B: Backend>(record: &TransitionRecord<B>) -> Self {
        Self {
            fields: record.keys().into_iter().map(str::to_string).collect(),
        }
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    /// Field names in sorted order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    fn check<B: Backend>(&self, record: &TransitionRecord<B>) -> Result<(), BufferError> {
        if record.field_count() != self.len() {
            return Err(BufferError::LengthMismatch {
                expected: self.len(),
                found: record.field_count(),
            });
        }
        let keys: BTreeSet<&str> = record.keys().into_iter().collect();
        let missing: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !keys.contains(f.as_str()))
            .cloned()
            .collect();
        let unexpected: Vec<String> = keys
            .iter()
            .filter(|k| !self.fields.contains(**k))
            .map(|k| k.to_string())
            .collect();
        if missing.is_empty() && unexpected.is_empty() {
            Ok(())
        } else {
            Err(BufferError::Schema { missing, unexpected })
        }
    }
}

/// Backing storage: a `Vec` that grows to `capacity`, then is overwritten
/// in place at `cursor`.
///
/// Invariants: `slots.len() <= capacity`; while growing, `cursor ==
/// slots.len()`; once full, `cursor` indexes the oldest record.
pub(crate) struct RingStorage<B: Backend> {
    slots: Vec<TransitionRecord<B>>,
    cursor: usize,
    capacity: usize,
    schema: Option<Schema>,
}

impl<B: Backend> RingStorage<B> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            cursor: 0,
            capacity,
            schema: None,
        }
    }

    /// Write `record` at the cursor and advance it. Returns the slot index.
    ///
    /// One code path for both phases: below capacity the cursor equals the
    /// length, so the write is an append; at capacity it is an overwrite.
    fn push(&mut self, record: TransitionRecord<B>) -> usize {
        let slot = self.cursor;
        if slot == self.slots.len() {
            self.slots.push(record);
        } else {
            self.slots[slot] = record;
        }
        self.cursor = (slot + 1) % self.capacity;
        slot
    }

    /// Drop records from the front until at most `capacity` remain.
    ///
    /// Only valid while `slots` is in oldest-first order (after a bulk
    /// replacement), never in the middle of steady-state ring writes.
    fn truncate_front(&mut self) -> usize {
        let excess = self.slots.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.slots.drain(..excess);
        }
        self.cursor = self.slots.len() % self.capacity;
        excess
    }

    fn replace(&mut self, records: Vec<TransitionRecord<B>>) -> usize {
        self.schema = records.first().map(Schema::of);
        self.slots = records;
        self.truncate_front()
    }

    fn is_full(&self) -> bool {
        self.slots.len() == self.capacity
    }

    /// Physical index of the oldest record.
    fn start(&self) -> usize {
        if self.is_full() {
            self.cursor
        } else {
            0
        }
    }

    /// Record at logical position `idx` (0 = oldest).
    fn get(&self, idx: usize) -> Option<&TransitionRecord<B>> {
        if idx >= self.slots.len() {
            return None;
        }
        self.slots.get((self.start() + idx) % self.slots.len())
    }

    /// Records oldest-first.
    fn iter(&self) -> impl Iterator<Item = &TransitionRecord<B>> {
        let (newer, older) = self.slots.split_at(self.start());
        older.iter().chain(newer.iter())
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.cursor = 0;
        self.schema = None;
    }
}

/// Ring-buffered experience store shared by producers and a learner.
pub struct ExperienceStore<B: Backend> {
    storage: RwLock<RingStorage<B>>,
    /// Mirror of the storage length for lock-free queries.
    size: AtomicUsize,
    capacity: usize,
    device: B::Device,
    main_fields: Vec<String>,
}

impl<B: Backend> ExperienceStore<B> {
    /// Create a store whose payloads live on `device`.
    pub fn new(config: StoreConfig, device: B::Device) -> Result<Self, BufferError> {
        config.validate()?;
        log::debug!(
            "Created experience store: capacity={}, main_fields={:?}, device={:?}",
            config.capacity,
            config.main_fields,
            device
        );
        Ok(Self {
            storage: RwLock::new(RingStorage::new(config.capacity)),
            size: AtomicUsize::new(0),
            capacity: config.capacity,
            device,
            main_fields: config.main_fields,
        })
    }

    /// Create a store with default main fields.
    pub fn with_capacity(capacity: usize, device: B::Device) -> Result<Self, BufferError> {
        Self::new(StoreConfig::new(capacity), device)
    }

    /// Append a record requiring only the core fields.
    pub fn append<R: IntoTransition<B>>(&self, record: R) -> Result<usize, BufferError> {
        self.append_requiring(record, &CORE_FIELDS)
    }

    /// Append a record that must carry every field in `required_fields`.
    ///
    /// Returns the slot index written to. On any error the store is left
    /// untouched.
    pub fn append_requiring<R: IntoTransition<B>>(
        &self,
        record: R,
        required_fields: &[&str],
    ) -> Result<usize, BufferError> {
        let record = record.into_transition()?;
        let missing = record.missing_keys(required_fields);
        if !missing.is_empty() {
            log::debug!("Rejected record missing required fields {:?}", missing);
            return Err(BufferError::missing(missing));
        }
        let record = record.to_device(&self.device);

        let mut storage = self.storage.write();
        match &storage.schema {
            Some(schema) => {
                if let Err(err) = schema.check(&record) {
                    log::debug!("Rejected record: {}", err);
                    return Err(err);
                }
            }
            None => {
                let schema = Schema::of(&record);
                log::debug!("Established store schema {:?}", schema.fields);
                storage.schema = Some(schema);
            }
        }
        let was_full = storage.is_full();
        let slot = storage.push(record);
        self.size.store(storage.len(), Ordering::Release);
        if !was_full && storage.is_full() {
            log::debug!("Experience store reached capacity {}, evicting oldest from now on", self.capacity);
        }
        Ok(slot)
    }

    /// Replace the whole contents, keeping at most the newest `capacity`
    /// records.
    ///
    /// This is the corrective bulk path: every record is validated against
    /// the first one, and excess records are truncated from the front.
    /// Returns the number of records dropped by truncation.
    pub fn replace_contents<R, I>(&self, records: I) -> Result<usize, BufferError>
    where
        R: IntoTransition<B>,
        I: IntoIterator<Item = R>,
    {
        let mut validated = Vec::new();
        let mut schema: Option<Schema> = None;
        for record in records {
            let record = record.into_transition()?;
            match &schema {
                Some(established) => established.check(&record)?,
                None => schema = Some(Schema::of(&record)),
            }
            validated.push(record.to_device(&self.device));
        }

        let mut storage = self.storage.write();
        let dropped = storage.replace(validated);
        self.size.store(storage.len(), Ordering::Release);
        if dropped > 0 {
            log::debug!(
                "Truncated bulk replacement to capacity {}: dropped {} oldest records",
                self.capacity,
                dropped
            );
        }
        Ok(dropped)
    }

    /// Current number of records. Never blocks.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fill fraction, 0.0 to 1.0.
    pub fn utilization(&self) -> f32 {
        self.size() as f32 / self.capacity as f32
    }

    /// Where record payloads are stored.
    pub fn storage_location(&self) -> &B::Device {
        &self.device
    }

    /// Fields batched by concatenation.
    pub fn main_fields(&self) -> &[String] {
        &self.main_fields
    }

    /// The established schema, `None` while the store is empty.
    pub fn schema(&self) -> Option<Schema> {
        self.storage.read().schema.clone()
    }

    /// Clone of every record, oldest first.
    pub fn snapshot(&self) -> Vec<TransitionRecord<B>> {
        self.storage.read().iter().cloned().collect()
    }

    /// Remove every record, reset the cursor and forget the schema.
    ///
    /// Callers must make sure no append or sample is in flight on other
    /// threads; the store does not order `clear` against them.
    pub fn clear(&self) {
        let mut storage = self.storage.write();
        storage.clear();
        self.size.store(0, Ordering::Release);
    }

    /// Sample a batch.
    ///
    /// Returns `Ok(None)` when the store is empty or the strategy selects
    /// nothing; otherwise the batch and its actual record count.
    pub fn sample_batch(&self, request: &SampleRequest<B>) -> Result<Option<SampledBatch<B>>, BufferError> {
        let selected: Vec<TransitionRecord<B>> = {
            let storage = self.storage.read();
            if storage.len() == 0 {
                return Ok(None);
            }
            let positions = request
                .strategy
                .select(storage.iter(), storage.len(), request.batch_size)?;
            positions
                .into_iter()
                .filter_map(|idx| storage.get(idx).cloned())
                .collect()
        };
        if selected.is_empty() {
            return Ok(None);
        }

        let device = request.device.as_ref().unwrap_or(&self.device);
        concatenate_batch(&selected, request, &self.main_fields, device).map(Some)
    }
}

/// Thread-safe shared experience store.
pub type SharedExperienceStore<B> = Arc<ExperienceStore<B>>;

/// Create a new shared experience store.
pub fn experience_store<B: Backend>(
    config: StoreConfig,
    device: B::Device,
) -> Result<SharedExperienceStore<B>, BufferError> {
    Ok(Arc::new(ExperienceStore::new(config, device)?))
}
