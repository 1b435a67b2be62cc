//! Posting list encoding
//!
//! A posting list is a flat concatenation of fixed-width records:
//! - u32 domain (big endian)
//! - i64 corpus offset (big endian)
//! - u16 start position in the source sentence (big endian)
//!
//! Lists merge by plain concatenation, so the decoded count is always
//! `byte_len / POSTING_SIZE`.

use crate::error::{Result, SaptError};
use crate::types::{Domain, Length};

/// Width in bytes of one encoded posting
pub const POSTING_SIZE: usize = 4 + 8 + 2;

/// One occurrence of a source phrase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Posting {
    pub domain: Domain,
    pub offset: i64,
    pub start: Length,
}

impl Posting {
    pub fn new(domain: Domain, offset: i64, start: Length) -> Self {
        Self {
            domain,
            offset,
            start,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.domain.to_be_bytes());
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.start.to_be_bytes());
    }

    fn decode(record: &[u8]) -> Self {
        let mut domain = [0u8; 4];
        let mut offset = [0u8; 8];
        let mut start = [0u8; 2];
        domain.copy_from_slice(&record[0..4]);
        offset.copy_from_slice(&record[4..12]);
        start.copy_from_slice(&record[12..14]);
        Self {
            domain: Domain::from_be_bytes(domain),
            offset: i64::from_be_bytes(offset),
            start: Length::from_be_bytes(start),
        }
    }
}

/// In-memory posting list fragment accumulated during a batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostingList {
    data: Vec<u8>,
}

impl PostingList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, domain: Domain, offset: i64, start: Length) {
        Posting::new(domain, offset, start).encode_into(&mut self.data);
    }

    pub fn push(&mut self, posting: Posting) {
        posting.encode_into(&mut self.data);
    }

    pub fn len(&self) -> usize {
        self.data.len() / POSTING_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Encoded bytes, ready to be merged into a source prefix key
    pub fn serialize(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Decodes an encoded list, appending to `out`
    pub fn deserialize(bytes: &[u8], out: &mut Vec<Posting>) -> Result<()> {
        validate(bytes)?;
        out.reserve(bytes.len() / POSTING_SIZE);
        out.extend(bytes.chunks_exact(POSTING_SIZE).map(Posting::decode));
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Vec<Posting>> {
        let mut out = Vec::new();
        Self::deserialize(bytes, &mut out)?;
        Ok(out)
    }
}

impl FromIterator<Posting> for PostingList {
    fn from_iter<I: IntoIterator<Item = Posting>>(iter: I) -> Self {
        let mut list = PostingList::new();
        for posting in iter {
            list.push(posting);
        }
        list
    }
}

/// Checks that an encoded list holds whole records only
pub fn validate(bytes: &[u8]) -> Result<()> {
    if bytes.len() % POSTING_SIZE != 0 {
        return Err(SaptError::corruption(format!(
            "posting list of {} bytes is not a multiple of {}",
            bytes.len(),
            POSTING_SIZE
        )));
    }
    Ok(())
}

/// Number of postings in an encoded list
pub fn count(bytes: &[u8]) -> Result<usize> {
    validate(bytes)?;
    Ok(bytes.len() / POSTING_SIZE)
}
