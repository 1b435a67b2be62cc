//! Merge operator for source prefix and target count records
//!
//! The writer never overwrites posting lists or counts: it merges fragments
//! into whatever the index already holds. Merging is associative and
//! commutative, so fragments may be combined in any grouping and any order:
//! - source prefix: byte concatenation of posting lists (consumed as a multiset)
//! - target count: integer addition, an absent operand counts as zero
//! - anything else: not applicable, plain put/get semantics
//!
//! Malformed existing values are reported as corruption instead of being
//! dropped.

use crate::error::Result;
use crate::key::{self, KeyType};
use crate::posting;

/// Stateless merge operator keyed by record type
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeOperator;

impl MergeOperator {
    pub const NAME: &'static str = "MergePositionOperator";

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Whether records under `key` are combined by merging
    pub fn applies_to(&self, key: &[u8]) -> bool {
        matches!(
            key.first().copied().and_then(KeyType::from_tag),
            Some(KeyType::SourcePrefix) | Some(KeyType::TargetCount)
        )
    }

    /// Combines one operand with the existing value.
    ///
    /// Returns `Ok(None)` when the key is not a mergeable record type.
    pub fn merge(&self, key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Result<Option<Vec<u8>>> {
        self.full_merge(key, existing, std::iter::once(operand))
    }

    /// Combines a sequence of operands with the existing value
    pub fn full_merge<'a, I>(&self, key: &[u8], existing: Option<&[u8]>, operands: I) -> Result<Option<Vec<u8>>>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        match key.first().copied().and_then(KeyType::from_tag) {
            Some(KeyType::SourcePrefix) => merge_position_lists(existing, operands).map(Some),
            Some(KeyType::TargetCount) => merge_counts(existing, operands).map(Some),
            _ => Ok(None),
        }
    }
}

fn merge_position_lists<'a, I>(existing: Option<&[u8]>, operands: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut merged = match existing {
        Some(bytes) => {
            posting::validate(bytes)?;
            bytes.to_vec()
        }
        None => Vec::new(),
    };

    for operand in operands {
        posting::validate(operand)?;
        merged.extend_from_slice(operand);
    }

    Ok(merged)
}

fn merge_counts<'a, I>(existing: Option<&[u8]>, operands: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut count = match existing {
        Some(bytes) => key::deserialize_count(bytes)?,
        None => 0,
    };

    for operand in operands {
        count = count.wrapping_add(key::deserialize_count(operand)?);
    }

    Ok(key::serialize_count(count).to_vec())
}
