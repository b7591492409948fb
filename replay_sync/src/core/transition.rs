//! Transition records stored in the experience store.
//!
//! A [`TransitionRecord`] bundles one interaction step (or a pre-batched
//! group of steps): three tensor groups (`state`, `action`, `next_state`),
//! a reward, a terminal flag, and an open, ordered set of extension fields
//! chosen by the producer (advantages, log-probabilities, hidden state, ...).
//!
//! Records are validated once, at construction, and are immutable afterwards
//! apart from the device migration the store performs on insertion.
//!
//! # Shapes
//!
//! Every tensor is rank 2, `[batch, features]`. The leading dimension of every
//! tensor in a group must equal the record's unit size: 1 for a scalar reward,
//! otherwise the reward tensor's leading dimension.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::BufferError;

pub const STATE: &str = "state";
pub const ACTION: &str = "action";
pub const NEXT_STATE: &str = "next_state";
pub const REWARD: &str = "reward";
pub const TERMINAL: &str = "terminal";

/// Selector that expands to every extension field not otherwise requested.
pub const WILDCARD: &str = "*";

/// The five fields every record carries, in key order.
pub const CORE_FIELDS: [&str; 5] = [STATE, ACTION, NEXT_STATE, REWARD, TERMINAL];

/// Named tensors of one structured field, keyed by sub-field name.
pub type FieldMap<B> = BTreeMap<String, Tensor<B, 2>>;

/// Reward of a record: a plain scalar or a `[unit_size, *]` tensor.
#[derive(Debug, Clone)]
pub enum Reward<B: Backend> {
    Scalar(f32),
    Tensor(Tensor<B, 2>),
}

impl<B: Backend> From<f32> for Reward<B> {
    fn from(value: f32) -> Self {
        Reward::Scalar(value)
    }
}

impl<B: Backend> From<Tensor<B, 2>> for Reward<B> {
    fn from(value: Tensor<B, 2>) -> Self {
        Reward::Tensor(value)
    }
}

/// Host-side value of an extension field.
///
/// These never hold device tensors: they are batched either as a plain list
/// or, when requested, stacked into a numeric column on the target device.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtraValue {
    Number(f32),
    Numbers(Vec<f32>),
    Flag(bool),
    Label(String),
}

impl ExtraValue {
    /// Numeric view of the value, `None` for labels.
    pub fn to_numbers(&self) -> Option<Vec<f32>> {
        match self {
            ExtraValue::Number(v) => Some(vec![*v]),
            ExtraValue::Numbers(v) => Some(v.clone()),
            ExtraValue::Flag(v) => Some(vec![if *v { 1.0 } else { 0.0 }]),
            ExtraValue::Label(_) => None,
        }
    }
}

/// An extension field: a host value or an additional tensor group.
#[derive(Debug, Clone)]
pub enum ExtraField<B: Backend> {
    Value(ExtraValue),
    Group(FieldMap<B>),
}

/// One validated interaction step.
#[derive(Debug, Clone)]
pub struct TransitionRecord<B: Backend> {
    state: FieldMap<B>,
    action: FieldMap<B>,
    next_state: FieldMap<B>,
    reward: Reward<B>,
    terminal: bool,
    extras: Vec<(String, ExtraField<B>)>,
    unit_size: usize,
}

impl<B: Backend> TransitionRecord<B> {
    /// Create a record with only the core fields.
    pub fn new(
        state: FieldMap<B>,
        action: FieldMap<B>,
        next_state: FieldMap<B>,
        reward: impl Into<Reward<B>>,
        terminal: bool,
    ) -> Result<Self, BufferError> {
        Self::with_extras(state, action, next_state, reward, terminal, Vec::new())
    }

    /// Create a record with core fields plus ordered extension fields.
    pub fn with_extras(
        state: FieldMap<B>,
        action: FieldMap<B>,
        next_state: FieldMap<B>,
        reward: impl Into<Reward<B>>,
        terminal: bool,
        extras: Vec<(String, ExtraField<B>)>,
    ) -> Result<Self, BufferError> {
        let reward = reward.into();
        let unit_size = unit_size_of(&reward)?;
        let record = Self {
            state,
            action,
            next_state,
            reward,
            terminal,
            extras,
            unit_size,
        };
        record.validate()?;
        Ok(record)
    }

    fn validate(&self) -> Result<(), BufferError> {
        check_group(STATE, &self.state, self.unit_size)?;
        check_group(ACTION, &self.action, self.unit_size)?;
        check_group(NEXT_STATE, &self.next_state, self.unit_size)?;

        if !self.state.keys().eq(self.next_state.keys()) {
            return Err(BufferError::invalid(
                NEXT_STATE,
                format!(
                    "sub-fields {:?} differ from state sub-fields {:?}",
                    self.next_state.keys().collect::<Vec<_>>(),
                    self.state.keys().collect::<Vec<_>>()
                ),
            ));
        }

        for (i, (name, field)) in self.extras.iter().enumerate() {
            if CORE_FIELDS.contains(&name.as_str()) || name == WILDCARD || name.is_empty() {
                return Err(BufferError::invalid(name.as_str(), "reserved field name"));
            }
            if self.extras[..i].iter().any(|(other, _)| other == name) {
                return Err(BufferError::invalid(name.as_str(), "duplicate field"));
            }
            if let ExtraField::Group(group) = field {
                check_group(name, group, self.unit_size)?;
            }
        }
        Ok(())
    }

    /// Field names, core fields first, then extensions in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        CORE_FIELDS
            .iter()
            .copied()
            .chain(self.extras.iter().map(|(name, _)| name.as_str()))
            .collect()
    }

    /// Whether every name in `fields` is a field of this record.
    pub fn has_keys(&self, fields: &[&str]) -> bool {
        self.missing_keys(fields).is_empty()
    }

    /// Names in `fields` that this record does not carry.
    pub fn missing_keys(&self, fields: &[&str]) -> Vec<String> {
        fields
            .iter()
            .filter(|name| !self.contains(name))
            .map(|name| name.to_string())
            .collect()
    }

    /// Whether the record carries a field called `name`.
    pub fn contains(&self, name: &str) -> bool {
        CORE_FIELDS.contains(&name) || self.extras.iter().any(|(n, _)| n == name)
    }

    /// Number of fields, core fields included.
    pub fn field_count(&self) -> usize {
        CORE_FIELDS.len() + self.extras.len()
    }

    /// Leading batch dimension shared by every tensor in the record.
    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn state(&self) -> &FieldMap<B> {
        &self.state
    }

    pub fn action(&self) -> &FieldMap<B> {
        &self.action
    }

    pub fn next_state(&self) -> &FieldMap<B> {
        &self.next_state
    }

    pub fn reward(&self) -> &Reward<B> {
        &self.reward
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    /// Extension field by name.
    pub fn extra(&self, name: &str) -> Option<&ExtraField<B>> {
        self.extras
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, field)| field)
    }

    /// Extension fields in insertion order.
    pub fn extras(&self) -> &[(String, ExtraField<B>)] {
        &self.extras
    }

    /// Tensor group by name: a core group or a group-valued extension.
    pub fn group(&self, name: &str) -> Option<&FieldMap<B>> {
        match name {
            STATE => Some(&self.state),
            ACTION => Some(&self.action),
            NEXT_STATE => Some(&self.next_state),
            _ => match self.extra(name) {
                Some(ExtraField::Group(group)) => Some(group),
                _ => None,
            },
        }
    }

    /// Move every tensor payload to `device`.
    pub fn to_device(self, device: &B::Device) -> Self {
        let reward = match self.reward {
            Reward::Tensor(t) => Reward::Tensor(t.to_device(device)),
            scalar => scalar,
        };
        let extras = self
            .extras
            .into_iter()
            .map(|(name, field)| {
                let field = match field {
                    ExtraField::Group(group) => ExtraField::Group(group_to_device(group, device)),
                    value => value,
                };
                (name, field)
            })
            .collect();
        Self {
            state: group_to_device(self.state, device),
            action: group_to_device(self.action, device),
            next_state: group_to_device(self.next_state, device),
            reward,
            terminal: self.terminal,
            extras,
            unit_size: self.unit_size,
        }
    }
}

fn unit_size_of<B: Backend>(reward: &Reward<B>) -> Result<usize, BufferError> {
    match reward {
        Reward::Scalar(_) => Ok(1),
        Reward::Tensor(t) => {
            let rows = t.dims()[0];
            if rows == 0 {
                return Err(BufferError::invalid(REWARD, "reward tensor has an empty batch dimension"));
            }
            Ok(rows)
        }
    }
}

fn check_group<B: Backend>(name: &str, group: &FieldMap<B>, unit_size: usize) -> Result<(), BufferError> {
    for (sub, tensor) in group {
        let rows = tensor.dims()[0];
        if rows != unit_size {
            return Err(BufferError::invalid(
                format!("{name}.{sub}"),
                format!("leading dimension {rows} does not match unit size {unit_size}"),
            ));
        }
    }
    Ok(())
}

fn group_to_device<B: Backend>(group: FieldMap<B>, device: &B::Device) -> FieldMap<B> {
    group
        .into_iter()
        .map(|(name, tensor)| (name, tensor.to_device(device)))
        .collect()
}

/// Anything the store can turn into a validated record.
pub trait IntoTransition<B: Backend> {
    fn into_transition(self) -> Result<TransitionRecord<B>, BufferError>;
}

impl<B: Backend> IntoTransition<B> for TransitionRecord<B> {
    fn into_transition(self) -> Result<TransitionRecord<B>, BufferError> {
        Ok(self)
    }
}

#[derive(Debug, Clone)]
enum FieldEntry<B: Backend> {
    Group(FieldMap<B>),
    Reward(Reward<B>),
    Terminal(bool),
    Value(ExtraValue),
}

/// Plain field mapping, converted into a [`TransitionRecord`] on append.
///
/// ```ignore
/// let fields = RecordFields::new()
///     .with_group("state", state)
///     .with_group("action", action)
///     .with_group("next_state", next_state)
///     .with_reward(1.0)
///     .with_terminal(false)
///     .with_extra("value", ExtraValue::Number(0.3));
/// store.append(fields)?;
/// ```
#[derive(Debug, Clone)]
pub struct RecordFields<B: Backend> {
    entries: Vec<(String, FieldEntry<B>)>,
}

impl<B: Backend> Default for RecordFields<B> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<B: Backend> RecordFields<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor group (`state`, `action`, `next_state` or an extension).
    pub fn with_group(mut self, name: impl Into<String>, group: FieldMap<B>) -> Self {
        self.entries.push((name.into(), FieldEntry::Group(group)));
        self
    }

    pub fn with_reward(mut self, reward: impl Into<Reward<B>>) -> Self {
        self.entries.push((REWARD.to_string(), FieldEntry::Reward(reward.into())));
        self
    }

    pub fn with_terminal(mut self, terminal: bool) -> Self {
        self.entries.push((TERMINAL.to_string(), FieldEntry::Terminal(terminal)));
        self
    }

    /// Add a host-side extension value.
    pub fn with_extra(mut self, name: impl Into<String>, value: ExtraValue) -> Self {
        self.entries.push((name.into(), FieldEntry::Value(value)));
        self
    }

    /// Field names in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl<B: Backend> IntoTransition<B> for RecordFields<B> {
    fn into_transition(self) -> Result<TransitionRecord<B>, BufferError> {
        let mut state = None;
        let mut action = None;
        let mut next_state = None;
        let mut reward = None;
        let mut terminal = None;
        let mut extras = Vec::new();

        for (name, entry) in self.entries {
            let core = CORE_FIELDS.iter().position(|field| *field == name);
            let duplicate = match (core, entry) {
                (Some(0), FieldEntry::Group(g)) => state.replace(g).is_some(),
                (Some(1), FieldEntry::Group(g)) => action.replace(g).is_some(),
                (Some(2), FieldEntry::Group(g)) => next_state.replace(g).is_some(),
                (Some(3), FieldEntry::Reward(r)) => reward.replace(r).is_some(),
                (Some(4), FieldEntry::Terminal(t)) => terminal.replace(t).is_some(),
                (Some(_), _) => {
                    return Err(BufferError::invalid(name, "wrong value kind for core field"));
                }
                (None, FieldEntry::Group(g)) => {
                    extras.push((name.clone(), ExtraField::Group(g)));
                    false
                }
                (None, FieldEntry::Value(v)) => {
                    extras.push((name.clone(), ExtraField::Value(v)));
                    false
                }
                (None, _) => {
                    return Err(BufferError::invalid(name, "reward and terminal values are core-only"));
                }
            };
            if duplicate {
                return Err(BufferError::invalid(name, "duplicate field"));
            }
        }

        let missing: Vec<String> = [
            (STATE, state.is_none()),
            (ACTION, action.is_none()),
            (NEXT_STATE, next_state.is_none()),
            (REWARD, reward.is_none()),
            (TERMINAL, terminal.is_none()),
        ]
        .iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| name.to_string())
        .collect();

        match (state, action, next_state, reward, terminal) {
            (Some(state), Some(action), Some(next_state), Some(reward), Some(terminal)) => {
                TransitionRecord::with_extras(state, action, next_state, reward, terminal, extras)
            }
            _ => Err(BufferError::missing(missing)),
        }
    }
}
