//! Sample strategies for [`ExperienceStore::sample_batch`](crate::ExperienceStore::sample_batch).
//!
//! The set of built-in strategies is closed; callers that need something else
//! supply a selection function through [`SampleStrategy::Custom`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use burn::tensor::backend::Backend;
use rand::Rng;

use crate::core::transition::TransitionRecord;
use crate::error::BufferError;

/// Caller-supplied selection: given the stored records (oldest first) and the
/// requested batch size, return the positions to sample. The number of
/// positions returned is the batch's actual size.
pub type SelectFn<B> = Arc<dyn Fn(&[&TransitionRecord<B>], usize) -> Vec<usize> + Send + Sync>;

/// How records are drawn from the store.
#[derive(Clone)]
pub enum SampleStrategy<B: Backend> {
    /// `min(batch_size, len)` distinct records, without replacement.
    RandomUnique,
    /// Exactly `batch_size` independent uniform draws, with replacement.
    Random,
    /// Every stored record, oldest first.
    All,
    /// Caller-supplied selection.
    Custom(SelectFn<B>),
}

impl<B: Backend> SampleStrategy<B> {
    /// Wrap a selection function.
    pub fn custom<F>(select: F) -> Self
    where
        F: Fn(&[&TransitionRecord<B>], usize) -> Vec<usize> + Send + Sync + 'static,
    {
        SampleStrategy::Custom(Arc::new(select))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SampleStrategy::RandomUnique => "random_unique",
            SampleStrategy::Random => "random",
            SampleStrategy::All => "all",
            SampleStrategy::Custom(_) => "custom",
        }
    }

    /// Pick logical positions (0 = oldest) out of `records`.
    pub(crate) fn select<'a, I>(&self, records: I, len: usize, batch_size: usize) -> Result<Vec<usize>, BufferError>
    where
        I: Iterator<Item = &'a TransitionRecord<B>>,
        B: 'a,
    {
        let mut rng = rand::thread_rng();
        match self {
            SampleStrategy::RandomUnique => {
                let amount = batch_size.min(len);
                Ok(rand::seq::index::sample(&mut rng, len, amount).into_vec())
            }
            SampleStrategy::Random => {
                if len == 0 {
                    return Ok(Vec::new());
                }
                Ok((0..batch_size).map(|_| rng.gen_range(0..len)).collect())
            }
            SampleStrategy::All => Ok((0..len).collect()),
            SampleStrategy::Custom(select) => {
                let view: Vec<&TransitionRecord<B>> = records.collect();
                let picked = select(&view, batch_size);
                if let Some(&index) = picked.iter().find(|&&i| i >= view.len()) {
                    return Err(BufferError::InvalidSelection {
                        index,
                        len: view.len(),
                    });
                }
                Ok(picked)
            }
        }
    }
}

impl<B: Backend> Default for SampleStrategy<B> {
    fn default() -> Self {
        SampleStrategy::RandomUnique
    }
}

impl<B: Backend> fmt::Debug for SampleStrategy<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl<B: Backend> FromStr for SampleStrategy<B> {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random_unique" => Ok(SampleStrategy::RandomUnique),
            "random" => Ok(SampleStrategy::Random),
            "all" => Ok(SampleStrategy::All),
            other => Err(BufferError::UnknownSampleStrategy(other.to_string())),
        }
    }
}
