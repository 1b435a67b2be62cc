//! Core types shared across the index, the corpus storage and the sampler

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deletable partition of the corpus (one per training source)
pub type Domain = u32;

/// Token identifier
pub type WordId = u32;

/// Position inside a sentence
pub type Length = u16;

/// Ingestion channel identifier
pub type StreamId = u16;

/// Sequence number inside a stream
pub type SeqId = i64;

/// A single word alignment link between source and target positions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlignmentPoint {
    pub source: Length,
    pub target: Length,
}

impl AlignmentPoint {
    pub fn new(source: Length, target: Length) -> Self {
        Self { source, target }
    }
}

pub type Alignment = Vec<AlignmentPoint>;

/// Identifies an update on a given ingestion stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateId {
    pub stream: StreamId,
    pub seq: SeqId,
}

impl UpdateId {
    pub fn new(stream: StreamId, seq: SeqId) -> Self {
        Self { stream, seq }
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream, self.seq)
    }
}

/// A stored bilingual sentence pair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentencePair {
    pub domain: Domain,
    pub source: Vec<WordId>,
    pub target: Vec<WordId>,
    pub alignment: Alignment,
}

/// A sentence pair returned by sampling, with every start position of the
/// searched phrase inside `source`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub domain: Domain,
    pub source: Vec<WordId>,
    pub target: Vec<WordId>,
    pub alignment: Alignment,
    pub offsets: Vec<Length>,
}

/// Weight of a domain in the translation context
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextScore {
    pub domain: Domain,
    pub score: f32,
}

impl ContextScore {
    pub fn new(domain: Domain, score: f32) -> Self {
        Self { domain, score }
    }
}

/// Translation context: the domains a sampler should look at first
pub type Context = Vec<ContextScore>;
