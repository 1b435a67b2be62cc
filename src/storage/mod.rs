//! Append-only corpus of sentence pairs, addressed by offset

mod corpus;
mod manifest;

pub use corpus::CorporaStorage;
pub use manifest::{ManifestFile, StorageManifest};
