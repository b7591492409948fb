//! Batch requests and schema-aware concatenation of sampled records.
//!
//! Batching rule, per requested field:
//!
//! | field kind                      | output                                          |
//! |---------------------------------|-------------------------------------------------|
//! | main field (tensor group)       | per sub-field: `cat` along dim 0, or a list     |
//! | `reward`                        | `[count, *]` tensor, scalars promoted first     |
//! | `terminal`                      | `[count, 1]` tensor of 0/1                      |
//! | extension in `numeric_fields`   | `[count, *]` tensor                             |
//! | other extension                 | plain list aligned by index                     |
//! | `*`                             | every extension not consumed by another selector |

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::buffers::sampling::SampleStrategy;
use crate::core::transition::{
    ExtraField, ExtraValue, FieldMap, Reward, TransitionRecord, CORE_FIELDS, REWARD, TERMINAL,
    WILDCARD,
};
use crate::error::BufferError;

/// Parameters of one `sample_batch` call.
#[derive(Debug, Clone)]
pub struct SampleRequest<B: Backend> {
    /// Requested number of records.
    pub batch_size: usize,
    /// Selection strategy.
    pub strategy: SampleStrategy<B>,
    /// Concatenate main-field tensors, or return them per record.
    pub concatenate: bool,
    /// Output device; `None` keeps the store's location.
    pub device: Option<B::Device>,
    /// Fields to return, in order; `None` returns every field.
    pub fields: Option<Vec<String>>,
    /// Extension fields to stack into numeric tensors.
    pub numeric_fields: Vec<String>,
}

impl<B: Backend> SampleRequest<B> {
    /// Request `batch_size` records with the default strategy (`random_unique`).
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            strategy: SampleStrategy::default(),
            concatenate: true,
            device: None,
            fields: None,
            numeric_fields: Vec::new(),
        }
    }

    /// Request the whole buffer, oldest first.
    pub fn all() -> Self {
        Self::new(0).with_strategy(SampleStrategy::All)
    }

    pub fn with_strategy(mut self, strategy: SampleStrategy<B>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Select a built-in strategy by name.
    pub fn with_strategy_name(self, name: &str) -> Result<Self, BufferError> {
        Ok(self.with_strategy(name.parse()?))
    }

    pub fn with_concatenate(mut self, concatenate: bool) -> Self {
        self.concatenate = concatenate;
        self
    }

    pub fn with_device(mut self, device: B::Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Restrict and order the returned fields. `"*"` selects remaining extensions.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_numeric_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.numeric_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// One sub-field of a batched tensor group.
#[derive(Debug, Clone)]
pub enum GroupColumn<B: Backend> {
    /// Records concatenated along the batch dimension.
    Concatenated(Tensor<B, 2>),
    /// One tensor per sampled record.
    PerRecord(Vec<Tensor<B, 2>>),
}

impl<B: Backend> GroupColumn<B> {
    /// The concatenated tensor, if this column was concatenated.
    pub fn tensor(&self) -> Option<&Tensor<B, 2>> {
        match self {
            GroupColumn::Concatenated(t) => Some(t),
            GroupColumn::PerRecord(_) => None,
        }
    }

    /// Per-record tensors, if this column was not concatenated.
    pub fn per_record(&self) -> Option<&[Tensor<B, 2>]> {
        match self {
            GroupColumn::Concatenated(_) => None,
            GroupColumn::PerRecord(v) => Some(v),
        }
    }
}

/// One field of a sampled batch.
#[derive(Debug, Clone)]
pub enum BatchField<B: Backend> {
    /// A main field, keyed by sub-field name.
    Group(BTreeMap<String, GroupColumn<B>>),
    /// `reward`, `terminal` or a numeric extension, `[count, *]`.
    Tensor(Tensor<B, 2>),
    /// A host-valued extension, one value per record.
    Values(Vec<ExtraValue>),
    /// A group-valued extension outside the main set, one map per record.
    Groups(Vec<FieldMap<B>>),
}

/// Result of a successful sample.
#[derive(Debug, Clone)]
pub struct SampledBatch<B: Backend> {
    count: usize,
    fields: Vec<(String, BatchField<B>)>,
}

impl<B: Backend> SampledBatch<B> {
    /// Number of records actually sampled.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Field names in output order.
    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&BatchField<B>> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, field)| field)
    }

    /// A batched main field.
    pub fn group(&self, name: &str) -> Option<&BTreeMap<String, GroupColumn<B>>> {
        match self.get(name)? {
            BatchField::Group(group) => Some(group),
            _ => None,
        }
    }

    /// A batched numeric column (`reward`, `terminal`, numeric extensions).
    pub fn tensor(&self, name: &str) -> Option<&Tensor<B, 2>> {
        match self.get(name)? {
            BatchField::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// A plain per-record list.
    pub fn values(&self, name: &str) -> Option<&[ExtraValue]> {
        match self.get(name)? {
            BatchField::Values(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_fields(self) -> Vec<(String, BatchField<B>)> {
        self.fields
    }
}

/// Concatenate `records` into a batch according to `request`.
///
/// `records` must be non-empty and share one field set.
pub(crate) fn concatenate_batch<B: Backend>(
    records: &[TransitionRecord<B>],
    request: &SampleRequest<B>,
    main_fields: &[String],
    device: &B::Device,
) -> Result<SampledBatch<B>, BufferError> {
    let first = &records[0];
    let count = records.len();

    let requested: Vec<String> = match &request.fields {
        Some(fields) => fields.clone(),
        None => first.keys().into_iter().map(str::to_string).collect(),
    };

    let missing: Vec<String> = requested
        .iter()
        .filter(|name| name.as_str() != WILDCARD && !first.contains(name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BufferError::missing(missing));
    }

    let is_main = |name: &str| main_fields.iter().any(|m| m == name);
    let is_numeric = |name: &str| request.numeric_fields.iter().any(|m| m == name);

    let mut fields: Vec<(String, BatchField<B>)> = Vec::with_capacity(requested.len());
    let mut used: Vec<String> = Vec::new();

    let batch_field = |name: &str| -> Result<BatchField<B>, BufferError> {
        if is_main(name) {
            Ok(BatchField::Group(batch_group(records, name, request.concatenate, device)?))
        } else if name == REWARD {
            Ok(BatchField::Tensor(batch_reward(records, device)?))
        } else if name == TERMINAL {
            Ok(BatchField::Tensor(batch_terminal(records, device)))
        } else if CORE_FIELDS.contains(&name) {
            // core group left out of the main set
            Ok(BatchField::Groups(collect_groups(records, name, device)?))
        } else {
            batch_extension(records, name, is_numeric(name), device)
        }
    };

    for name in &requested {
        if name == WILDCARD {
            for (extra, _) in first.extras() {
                if used.contains(extra) {
                    continue;
                }
                fields.push((extra.clone(), batch_field(extra)?));
                used.push(extra.clone());
            }
            continue;
        }
        if used.contains(name) {
            continue;
        }
        fields.push((name.clone(), batch_field(name)?));
        used.push(name.clone());
    }

    Ok(SampledBatch { count, fields })
}

fn batch_group<B: Backend>(
    records: &[TransitionRecord<B>],
    name: &str,
    concatenate: bool,
    device: &B::Device,
) -> Result<BTreeMap<String, GroupColumn<B>>, BufferError> {
    let template = records[0].group(name).ok_or_else(|| BufferError::NotStructured {
        field: name.to_string(),
    })?;

    let mut columns = BTreeMap::new();
    for (sub, first_tensor) in template {
        let label = format!("{name}.{sub}");
        let width = first_tensor.dims()[1];
        let mut tensors = Vec::with_capacity(records.len());
        for record in records {
            let group = record.group(name).ok_or_else(|| BufferError::NotStructured {
                field: name.to_string(),
            })?;
            let tensor = group
                .get(sub)
                .ok_or_else(|| BufferError::missing(vec![label.clone()]))?;
            if concatenate && tensor.dims()[1] != width {
                return Err(BufferError::ShapeMismatch {
                    field: label.clone(),
                    expected: width,
                    found: tensor.dims()[1],
                });
            }
            tensors.push(tensor.clone().to_device(device));
        }
        let column = if concatenate {
            GroupColumn::Concatenated(Tensor::cat(tensors, 0))
        } else {
            GroupColumn::PerRecord(tensors)
        };
        columns.insert(sub.clone(), column);
    }
    Ok(columns)
}

fn batch_reward<B: Backend>(records: &[TransitionRecord<B>], device: &B::Device) -> Result<Tensor<B, 2>, BufferError> {
    let count = records.len();
    let rewards: Vec<Tensor<B, 2>> = records
        .iter()
        .map(|record| match record.reward() {
            Reward::Scalar(r) => Tensor::<B, 1>::from_floats([*r], device).reshape([1, 1]),
            Reward::Tensor(t) => t.clone().to_device(device),
        })
        .collect();

    let width = rewards[0].dims()[1];
    if let Some(bad) = rewards.iter().find(|t| t.dims()[1] != width) {
        return Err(BufferError::ShapeMismatch {
            field: REWARD.to_string(),
            expected: width,
            found: bad.dims()[1],
        });
    }

    let stacked = Tensor::cat(rewards, 0);
    let [rows, width] = stacked.dims();
    let elements = rows * width;
    if elements % count != 0 {
        return Err(BufferError::ShapeMismatch {
            field: REWARD.to_string(),
            expected: count,
            found: rows,
        });
    }
    Ok(stacked.reshape([count, elements / count]))
}

fn batch_terminal<B: Backend>(records: &[TransitionRecord<B>], device: &B::Device) -> Tensor<B, 2> {
    let flags: Vec<f32> = records
        .iter()
        .map(|record| if record.terminal() { 1.0 } else { 0.0 })
        .collect();
    Tensor::<B, 1>::from_floats(flags.as_slice(), device).reshape([records.len(), 1])
}

fn batch_extension<B: Backend>(
    records: &[TransitionRecord<B>],
    name: &str,
    numeric: bool,
    device: &B::Device,
) -> Result<BatchField<B>, BufferError> {
    if let Some(ExtraField::Group(_)) = records[0].extra(name) {
        return Ok(BatchField::Groups(collect_groups(records, name, device)?));
    }

    let values = records
        .iter()
        .map(|record| match record.extra(name) {
            Some(ExtraField::Value(v)) => Ok(v),
            Some(ExtraField::Group(_)) => Err(BufferError::NotNumeric {
                field: name.to_string(),
            }),
            None => Err(BufferError::missing(vec![name.to_string()])),
        })
        .collect::<Result<Vec<&ExtraValue>, BufferError>>()?;

    if !numeric {
        return Ok(BatchField::Values(values.into_iter().cloned().collect()));
    }

    let mut width = None;
    let mut flat = Vec::new();
    for value in values {
        let numbers = value.to_numbers().ok_or_else(|| BufferError::NotNumeric {
            field: name.to_string(),
        })?;
        let expected = *width.get_or_insert(numbers.len());
        if numbers.len() != expected {
            return Err(BufferError::ShapeMismatch {
                field: name.to_string(),
                expected,
                found: numbers.len(),
            });
        }
        flat.extend(numbers);
    }
    let width = width.unwrap_or(0);
    Ok(BatchField::Tensor(
        Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([records.len(), width]),
    ))
}

fn collect_groups<B: Backend>(
    records: &[TransitionRecord<B>],
    name: &str,
    device: &B::Device,
) -> Result<Vec<FieldMap<B>>, BufferError> {
    records
        .iter()
        .map(|record| {
            let group = record.group(name).ok_or_else(|| BufferError::NotStructured {
                field: name.to_string(),
            })?;
            Ok(group
                .iter()
                .map(|(sub, t)| (sub.clone(), t.clone().to_device(device)))
                .collect())
        })
        .collect()
}
