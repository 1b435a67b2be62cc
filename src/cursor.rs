//! Cursors over the source prefix keys of one phrase
//!
//! A global cursor scans every domain holding the phrase; a domain cursor
//! reads the single key of one domain. Phrases longer than the prefix length
//! are looked up by their first `L` words.

use std::sync::Arc;

use fjall::Slice;

use crate::error::{Result, SaptError};
use crate::key;
use crate::posting::{self, Posting, PostingList};
use crate::store::IndexStore;
use crate::types::{Domain, WordId};

/// Posting list of one phrase in one domain
#[derive(Clone, Debug)]
pub struct PrefixEntry {
    pub domain: Domain,
    value: Slice,
}

impl PrefixEntry {
    /// Number of postings, without decoding them
    pub fn count(&self) -> Result<usize> {
        posting::count(&self.value)
    }

    /// Decodes the postings, appending to `out`
    pub fn values(&self, out: &mut Vec<Posting>) -> Result<()> {
        PostingList::deserialize(&self.value, out)
    }

    pub fn raw(&self) -> &[u8] {
        &self.value
    }
}

enum Position {
    Unpositioned,
    Scan(fjall::Iter),
    Single(Option<PrefixEntry>),
}

pub struct PrefixCursor {
    store: Arc<IndexStore>,
    prefix_length: u8,
    domain: Option<Domain>,
    position: Position,
}

impl PrefixCursor {
    /// Cursor over every domain
    pub fn global(store: Arc<IndexStore>, prefix_length: u8) -> Self {
        Self {
            store,
            prefix_length,
            domain: None,
            position: Position::Unpositioned,
        }
    }

    /// Cursor restricted to `domain`
    pub fn for_domain(store: Arc<IndexStore>, prefix_length: u8, domain: Domain) -> Self {
        Self {
            store,
            prefix_length,
            domain: Some(domain),
            position: Position::Unpositioned,
        }
    }

    pub fn domain(&self) -> Option<Domain> {
        self.domain
    }

    /// Positions the cursor on `phrase`. The empty phrase matches nothing.
    pub fn seek(&mut self, phrase: &[WordId]) -> Result<()> {
        let length = phrase.len().min(self.prefix_length as usize);
        if length == 0 {
            self.position = Position::Single(None);
            return Ok(());
        }

        self.position = match self.domain {
            None => {
                let scan_key = key::make_prefix_scan_key(self.prefix_length, phrase, 0, length);
                Position::Scan(self.store.prefix(&scan_key))
            }
            Some(domain) => {
                let key = key::make_prefix_key(self.prefix_length, domain, phrase, 0, length);
                let entry = self
                    .store
                    .get(&key)?
                    .map(|value| PrefixEntry { domain, value });
                Position::Single(entry)
            }
        };
        Ok(())
    }

    /// Next matching entry, `None` once the phrase is exhausted
    pub fn next_entry(&mut self) -> Result<Option<PrefixEntry>> {
        match &mut self.position {
            Position::Unpositioned => Err(SaptError::InvalidArgument(
                "prefix cursor used before seek".to_string(),
            )),
            Position::Single(entry) => Ok(entry.take()),
            Position::Scan(iter) => match iter.next() {
                None => Ok(None),
                Some(guard) => {
                    let (key, value) = guard.into_inner()?;
                    let domain = key::domain_from_key(&key, self.prefix_length)?;
                    Ok(Some(PrefixEntry { domain, value }))
                }
            },
        }
    }

    /// Sum of the posting counts of the remaining entries
    pub fn count_remaining(&mut self) -> Result<u64> {
        let mut total = 0u64;
        while let Some(entry) = self.next_entry()? {
            total += entry.count()? as u64;
        }
        Ok(total)
    }
}

impl Iterator for PrefixCursor {
    type Item = Result<PrefixEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
