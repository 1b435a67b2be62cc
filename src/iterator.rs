//! Full scan over the phrase records of the index

use std::sync::Arc;

use crate::error::Result;
use crate::key::{self, KeyType};
use crate::posting::{Posting, PostingList};
use crate::store::IndexStore;
use crate::types::{Domain, WordId};

/// One decoded phrase record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub is_source: bool,
    /// Set for source records only
    pub domain: Option<Domain>,
    pub words: Vec<WordId>,
    /// Postings of a source record, empty for target counts
    pub positions: Vec<Posting>,
    pub count: i64,
}

/// Forward iterator over source prefix and target count records, in key
/// order. Other record kinds are skipped.
pub struct IndexIterator {
    store: Arc<IndexStore>,
    prefix_length: u8,
    iter: Option<fjall::Iter>,
}

impl IndexIterator {
    pub fn new(store: Arc<IndexStore>, prefix_length: u8) -> Self {
        let iter = Some(store.iter());
        Self {
            store,
            prefix_length,
            iter,
        }
    }

    /// Restarts the scan from the first record
    pub fn seek_to_first(&mut self) {
        self.iter = Some(self.store.iter());
    }

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<Option<IndexEntry>> {
        let entry = match key::key_type(key, self.prefix_length) {
            Some(KeyType::SourcePrefix) => {
                let positions = PostingList::decode(value)?;
                IndexEntry {
                    is_source: true,
                    domain: Some(key::domain_from_key(key, self.prefix_length)?),
                    words: key::words_from_key(key, self.prefix_length)?,
                    count: positions.len() as i64,
                    positions,
                }
            }
            Some(KeyType::TargetCount) => IndexEntry {
                is_source: false,
                domain: None,
                words: key::words_from_key(key, self.prefix_length)?,
                positions: Vec::new(),
                count: key::deserialize_count(value)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }
}

impl Iterator for IndexIterator {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.iter.as_mut()?.next()?;
            let (key, value) = match guard.into_inner() {
                Ok(kv) => kv,
                Err(e) => {
                    // Fused after an engine fault
                    self.iter = None;
                    return Some(Err(e.into()));
                }
            };
            match self.decode(&key, &value) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
