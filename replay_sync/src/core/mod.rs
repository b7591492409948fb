//! Core types: transition records and the per-worker sync gate.

pub mod sync_gate;
pub mod transition;

pub use sync_gate::{GateGuard, SyncGate};
pub use transition::{
    ExtraField, ExtraValue, FieldMap, IntoTransition, RecordFields, Reward, TransitionRecord,
    ACTION, CORE_FIELDS, NEXT_STATE, REWARD, STATE, TERMINAL, WILDCARD,
};
