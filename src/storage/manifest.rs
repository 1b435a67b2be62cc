//! Storage manifest: the committed shape of the corpus files
//!
//! The manifest is written into the index in the same batch as the postings
//! that point into the corpus, so reopening the storage with the last
//! committed manifest always yields offsets the index knows about.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Manifest entry for one corpus file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// File sequence number
    pub id: u32,
    /// Global offset of the first byte of the file
    pub base_offset: u64,
    /// Flushed size in bytes
    pub size: u64,
}

impl ManifestFile {
    pub fn end_offset(&self) -> u64 {
        self.base_offset + self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageManifest {
    /// Manifest version (for format upgrades)
    pub version: u32,
    /// Corpus files in offset order
    pub files: Vec<ManifestFile>,
}

impl StorageManifest {
    /// Current manifest format version
    pub const VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
            files: Vec::new(),
        }
    }

    /// Total number of committed bytes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get_file(&self, id: u32) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a persisted manifest; an absent value is the empty manifest
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::new());
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Default for StorageManifest {
    fn default() -> Self {
        Self::new()
    }
}
