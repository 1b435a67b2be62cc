//! Binary key layout of the index keyspace
//!
//! Every key starts with a one-byte type tag, so records of the same kind are
//! contiguous in key order:
//!
//! - `0x00` streams: empty body
//! - `0x01` storage manifest: empty body
//! - `0x02` source prefix: `len:u8 | words:len x u32 BE | domain:u32 BE`
//! - `0x03` target count: `len:u8 | words:len x u32 BE`
//! - `0x04` domain deletion: `domain:u32 BE`
//!
//! The phrase precedes the domain in source prefix keys: scanning with
//! `tag | len | words` visits the postings of one phrase in every domain and
//! nothing else, since the length byte keeps longer phrases out of the range.

use crate::error::{Result, SaptError};
use crate::types::{Domain, WordId};

const WORD_SIZE: usize = std::mem::size_of::<WordId>();
const DOMAIN_SIZE: usize = std::mem::size_of::<Domain>();
const COUNT_SIZE: usize = std::mem::size_of::<i64>();

/// Record kinds stored in the index
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Streams = 0x00,
    StorageManifest = 0x01,
    SourcePrefix = 0x02,
    TargetCount = 0x03,
    DomainDeletion = 0x04,
}

impl KeyType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Unknown tags are reserved for future record kinds
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(KeyType::Streams),
            0x01 => Some(KeyType::StorageManifest),
            0x02 => Some(KeyType::SourcePrefix),
            0x03 => Some(KeyType::TargetCount),
            0x04 => Some(KeyType::DomainDeletion),
            _ => None,
        }
    }

    /// Leading bytes shared by every key of this kind
    pub fn prefix(self) -> [u8; 1] {
        [self.tag()]
    }
}

pub fn make_empty_key(key_type: KeyType) -> Vec<u8> {
    vec![key_type.tag()]
}

fn push_phrase(key: &mut Vec<u8>, phrase: &[WordId]) {
    key.push(phrase.len() as u8);
    for word in phrase {
        key.extend_from_slice(&word.to_be_bytes());
    }
}

fn phrase_slice(prefix_length: u8, sentence: &[WordId], start: usize, length: usize) -> &[WordId] {
    debug_assert!(length > 0 && length <= prefix_length as usize);
    &sentence[start..start + length]
}

/// Key holding the postings of `sentence[start..start + length]` in `domain`
pub fn make_prefix_key(
    prefix_length: u8,
    domain: Domain,
    sentence: &[WordId],
    start: usize,
    length: usize,
) -> Vec<u8> {
    let mut key = make_prefix_scan_key(prefix_length, sentence, start, length);
    key.extend_from_slice(&domain.to_be_bytes());
    key
}

/// Scan prefix covering the postings of one phrase across all domains
pub fn make_prefix_scan_key(
    prefix_length: u8,
    sentence: &[WordId],
    start: usize,
    length: usize,
) -> Vec<u8> {
    let phrase = phrase_slice(prefix_length, sentence, start, length);
    let mut key = Vec::with_capacity(2 + phrase.len() * WORD_SIZE + DOMAIN_SIZE);
    key.push(KeyType::SourcePrefix.tag());
    push_phrase(&mut key, phrase);
    key
}

/// Key holding the target-side occurrence count of a phrase
pub fn make_count_key(prefix_length: u8, sentence: &[WordId], start: usize, length: usize) -> Vec<u8> {
    let phrase = phrase_slice(prefix_length, sentence, start, length);
    let mut key = Vec::with_capacity(2 + phrase.len() * WORD_SIZE);
    key.push(KeyType::TargetCount.tag());
    push_phrase(&mut key, phrase);
    key
}

pub fn make_domain_deletion_key(domain: Domain) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + DOMAIN_SIZE);
    key.push(KeyType::DomainDeletion.tag());
    key.extend_from_slice(&domain.to_be_bytes());
    key
}

/// Type of a key, `None` for empty keys and unknown tags
pub fn key_type(key: &[u8], _prefix_length: u8) -> Option<KeyType> {
    key.first().and_then(|tag| KeyType::from_tag(*tag))
}

/// Validates the phrase section of a prefix or count key and returns it
fn phrase_bytes(key: &[u8], prefix_length: u8, with_domain: bool) -> Result<&[u8]> {
    let Some(&len) = key.get(1) else {
        return Err(SaptError::corruption("key too short for phrase"));
    };
    if len == 0 || len > prefix_length {
        return Err(SaptError::corruption(format!(
            "phrase length {} outside 1..={}",
            len, prefix_length
        )));
    }

    let words_end = 2 + len as usize * WORD_SIZE;
    let expected = if with_domain {
        words_end + DOMAIN_SIZE
    } else {
        words_end
    };
    if key.len() != expected {
        return Err(SaptError::corruption(format!(
            "key length {} does not match phrase length {}",
            key.len(),
            len
        )));
    }

    Ok(&key[2..words_end])
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf)
}

/// Domain of a source prefix key or a domain deletion key
pub fn domain_from_key(key: &[u8], prefix_length: u8) -> Result<Domain> {
    match key_type(key, prefix_length) {
        Some(KeyType::SourcePrefix) => {
            phrase_bytes(key, prefix_length, true)?;
            Ok(read_u32(&key[key.len() - DOMAIN_SIZE..]))
        }
        Some(KeyType::DomainDeletion) => {
            if key.len() != 1 + DOMAIN_SIZE {
                return Err(SaptError::corruption("malformed domain deletion key"));
            }
            Ok(read_u32(&key[1..]))
        }
        other => Err(SaptError::corruption(format!(
            "key of type {:?} carries no domain",
            other
        ))),
    }
}

/// Phrase of a source prefix key or a target count key
pub fn words_from_key(key: &[u8], prefix_length: u8) -> Result<Vec<WordId>> {
    let bytes = match key_type(key, prefix_length) {
        Some(KeyType::SourcePrefix) => phrase_bytes(key, prefix_length, true)?,
        Some(KeyType::TargetCount) => phrase_bytes(key, prefix_length, false)?,
        other => {
            return Err(SaptError::corruption(format!(
                "key of type {:?} carries no phrase",
                other
            )))
        }
    };

    Ok(bytes.chunks_exact(WORD_SIZE).map(read_u32).collect())
}

pub fn serialize_count(count: i64) -> [u8; COUNT_SIZE] {
    count.to_be_bytes()
}

/// Decodes a count value; an empty (absent) value counts as zero
pub fn deserialize_count(bytes: &[u8]) -> Result<i64> {
    match bytes.len() {
        0 => Ok(0),
        COUNT_SIZE => {
            let mut buf = [0u8; COUNT_SIZE];
            buf.copy_from_slice(bytes);
            Ok(i64::from_be_bytes(buf))
        }
        n => Err(SaptError::corruption(format!(
            "count value of {} bytes, expected {}",
            n, COUNT_SIZE
        ))),
    }
}
