//! Update batches and ingestion stream watermarks

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Alignment, Domain, SeqId, StreamId, UpdateId, WordId};

/// Last applied sequence number per ingestion stream
///
/// Persisted next to the index on every commit so replays after a crash
/// resume from the right position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    positions: BTreeMap<StreamId, SeqId>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream: StreamId) -> Option<SeqId> {
        self.positions.get(&stream).copied()
    }

    /// Whether the update was already covered by this watermark
    pub fn is_applied(&self, id: UpdateId) -> bool {
        self.get(id.stream).is_some_and(|seq| id.seq <= seq)
    }

    /// Moves the stream watermark forward, never backwards
    pub fn advance(&mut self, id: UpdateId) {
        let entry = self.positions.entry(id.stream).or_insert(id.seq);
        if id.seq > *entry {
            *entry = id.seq;
        }
    }

    /// Moves every stream of `other` forward in this state
    pub fn merge(&mut self, other: &StreamState) {
        for (stream, seq) in other.iter() {
            self.advance(UpdateId::new(stream, seq));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamId, SeqId)> + '_ {
        self.positions.iter().map(|(s, q)| (*s, *q))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a persisted state; an absent value is the empty state
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

impl FromIterator<(StreamId, SeqId)> for StreamState {
    fn from_iter<I: IntoIterator<Item = (StreamId, SeqId)>>(iter: I) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}

/// One sentence pair to index
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchEntry {
    pub domain: Domain,
    pub source: Vec<WordId>,
    pub target: Vec<WordId>,
    pub alignment: Alignment,
}

/// Unit of ingestion: sentence pairs to add, domains to delete and the
/// stream watermark the index reaches once the batch is committed
#[derive(Clone, Debug)]
pub struct UpdateBatch {
    max_size: usize,
    streams: StreamState,
    entries: Vec<BatchEntry>,
    deletions: HashSet<Domain>,
}

impl UpdateBatch {
    /// Creates a batch starting from the currently committed stream state.
    ///
    /// `max_size` bounds the number of additions, 0 means unbounded.
    pub fn new(max_size: usize, streams: StreamState) -> Self {
        Self {
            max_size,
            streams,
            entries: Vec::new(),
            deletions: HashSet::new(),
        }
    }

    /// Queues a sentence pair. Updates already covered by the stream
    /// watermark are skipped and `false` is returned.
    pub fn add(
        &mut self,
        id: UpdateId,
        domain: Domain,
        source: Vec<WordId>,
        target: Vec<WordId>,
        alignment: Alignment,
    ) -> bool {
        if self.streams.is_applied(id) {
            return false;
        }
        self.streams.advance(id);
        self.push(domain, source, target, alignment);
        true
    }

    /// Queues a sentence pair without stream bookkeeping
    pub fn push(&mut self, domain: Domain, source: Vec<WordId>, target: Vec<WordId>, alignment: Alignment) {
        self.entries.push(BatchEntry {
            domain,
            source,
            target,
            alignment,
        });
    }

    /// Marks a domain for deletion
    pub fn delete(&mut self, id: UpdateId, domain: Domain) -> bool {
        if self.streams.is_applied(id) {
            return false;
        }
        self.streams.advance(id);
        self.deletions.insert(domain);
        true
    }

    /// Marks a domain for deletion without stream bookkeeping
    pub fn delete_domain(&mut self, domain: Domain) {
        self.deletions.insert(domain);
    }

    pub fn is_full(&self) -> bool {
        self.max_size > 0 && self.entries.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn deletions(&self) -> &HashSet<Domain> {
        &self.deletions
    }

    /// Stream state once this batch is applied
    pub fn streams(&self) -> &StreamState {
        &self.streams
    }

    /// Empties the batch after a commit, keeping the reached watermark
    pub fn clear(&mut self) {
        self.entries.clear();
        self.deletions.clear();
    }
}
