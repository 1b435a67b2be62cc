use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::manifest::{ManifestFile, StorageManifest};
use crate::error::{Result, SaptError};
use crate::types::{Alignment, Domain, SentencePair, WordId};

const FILE_PREFIX: &str = "corpus.";
const FILE_SUFFIX: &str = ".dat";
const HEADER_SIZE: u64 = 8;

fn storage_err(context: &str, err: impl std::fmt::Display) -> SaptError {
    SaptError::Storage(format!("{}: {}", context, err))
}

fn file_name(id: u32) -> String {
    format!("{}{:06}{}", FILE_PREFIX, id, FILE_SUFFIX)
}

fn parse_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

struct CorpusFile {
    id: u32,
    base_offset: u64,
    size: u64,
    dirty: bool,
    file: File,
}

impl CorpusFile {
    fn open(dir: &Path, id: u32, base_offset: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(file_name(id)))?;
        let size = file.metadata()?.len();
        Ok(Self {
            id,
            base_offset,
            size,
            dirty: false,
            file,
        })
    }

    fn contains(&self, offset: u64) -> bool {
        offset >= self.base_offset && offset < self.base_offset + self.size
    }
}

struct StorageInner {
    /// Corpus files in offset order; the last one receives appends
    files: Vec<CorpusFile>,
}

impl StorageInner {
    fn active(&mut self) -> &mut CorpusFile {
        // open() always leaves at least one file
        let last = self.files.len() - 1;
        &mut self.files[last]
    }
}

/// Append-only store of bilingual sentence pairs.
///
/// Record format:
/// - u32 length (little endian)
/// - u32 crc32 of payload
/// - bincode-encoded [`SentencePair`]
///
/// Offsets are global across files: each file starts where the previous one
/// ends. Files roll over once they would grow past `max_file_size`.
pub struct CorporaStorage {
    dir: PathBuf,
    max_file_size: u64,
    inner: Mutex<StorageInner>,
}

impl CorporaStorage {
    /// Open the storage in the state described by `manifest`.
    ///
    /// Bytes appended after the manifest was committed are kept as orphan
    /// data and new appends go after them, so an offset is never handed out
    /// twice. Files shorter than the manifest records, or missing, make the
    /// storage inconsistent with the index.
    pub fn open(dir: &Path, manifest: &StorageManifest, max_file_size: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| storage_err("failed to create storage dir", e))?;

        let mut files = Vec::with_capacity(manifest.file_count().max(1));
        let mut expected_offset = 0u64;
        let last = manifest.file_count().saturating_sub(1);
        for (i, entry) in manifest.files.iter().enumerate() {
            if entry.base_offset != expected_offset {
                return Err(SaptError::Storage(format!(
                    "manifest file {} starts at {}, expected {}",
                    entry.id, entry.base_offset, expected_offset
                )));
            }
            let path = dir.join(file_name(entry.id));
            if !path.exists() {
                return Err(SaptError::Storage(format!(
                    "corpus file {} listed in manifest is missing",
                    path.display()
                )));
            }

            let file = CorpusFile::open(dir, entry.id, entry.base_offset)
                .map_err(|e| storage_err("failed to open corpus file", e))?;
            if file.size < entry.size || (i < last && file.size != entry.size) {
                return Err(SaptError::Storage(format!(
                    "corpus file {} holds {} bytes, manifest expects {}",
                    path.display(),
                    file.size,
                    entry.size
                )));
            }
            if file.size > entry.size {
                warn!(
                    file = %path.display(),
                    orphan_bytes = file.size - entry.size,
                    "keeping corpus appends past the committed manifest"
                );
            }

            expected_offset = entry.base_offset + file.size;
            files.push(file);
        }

        // Files rolled over after the manifest was committed
        let mut next_id = manifest.files.last().map_or(0, |f| f.id + 1);
        while dir.join(file_name(next_id)).exists() {
            let file = CorpusFile::open(dir, next_id, expected_offset)
                .map_err(|e| storage_err("failed to open corpus file", e))?;
            warn!(
                file = next_id,
                base_offset = expected_offset,
                orphan_bytes = file.size,
                "keeping corpus file missing from manifest"
            );
            expected_offset += file.size;
            files.push(file);
            next_id += 1;
        }

        Self::remove_stray_files(dir, &files)?;

        if files.is_empty() {
            files.push(
                CorpusFile::open(dir, 0, 0).map_err(|e| storage_err("failed to create corpus file", e))?,
            );
        }

        info!(
            dir = %dir.display(),
            files = files.len(),
            bytes = expected_offset,
            committed_bytes = manifest.total_size(),
            "opened corpus storage"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_file_size,
            inner: Mutex::new(StorageInner { files }),
        })
    }

    /// Corpus files outside the contiguous run can't hold any indexed offset
    fn remove_stray_files(dir: &Path, files: &[CorpusFile]) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| storage_err("failed to list storage dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| storage_err("failed to list storage dir", e))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_file_name) else {
                continue;
            };
            if !files.iter().any(|f| f.id == id) {
                warn!(file = %entry.path().display(), "removing stray corpus file");
                fs::remove_file(entry.path()).map_err(|e| storage_err("failed to remove stray file", e))?;
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append a sentence pair and return its stable offset
    pub fn append(
        &self,
        domain: Domain,
        source: &[WordId],
        target: &[WordId],
        alignment: &Alignment,
    ) -> Result<i64> {
        let record = SentencePair {
            domain,
            source: source.to_vec(),
            target: target.to_vec(),
            alignment: alignment.clone(),
        };
        let payload = bincode::serialize(&record)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SaptError::Storage(format!("record of {} bytes too large", payload.len())))?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc32 = hasher.finalize();

        let mut inner = self.inner.lock();
        let record_size = HEADER_SIZE + payload.len() as u64;
        if inner.active().size > 0 && inner.active().size + record_size > self.max_file_size {
            self.roll(&mut inner)?;
        }

        let active = inner.active();
        let offset = active.base_offset + active.size;
        let mut buf = Vec::with_capacity(record_size as usize);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc32.to_le_bytes());
        buf.extend_from_slice(&payload);
        active
            .file
            .write_all(&buf)
            .map_err(|e| storage_err("failed to append to corpus", e))?;
        active.size += record_size;
        active.dirty = true;

        Ok(offset as i64)
    }

    fn roll(&self, inner: &mut StorageInner) -> Result<()> {
        let active = inner.active();
        let id = active.id + 1;
        let base_offset = active.base_offset + active.size;
        let file = CorpusFile::open(&self.dir, id, base_offset)
            .map_err(|e| storage_err("failed to create corpus file", e))?;
        info!(file = id, base_offset, "rolled corpus storage file");
        inner.files.push(file);
        Ok(())
    }

    /// Read back the sentence pair stored at `offset`, validating its checksum
    pub fn retrieve(&self, offset: i64) -> Result<SentencePair> {
        let offset = u64::try_from(offset)
            .map_err(|_| SaptError::Storage(format!("invalid corpus offset {}", offset)))?;

        let mut inner = self.inner.lock();
        let idx = inner
            .files
            .partition_point(|f| f.base_offset + f.size <= offset);
        let Some(corpus_file) = inner.files.get_mut(idx).filter(|f| f.contains(offset)) else {
            return Err(SaptError::Storage(format!("corpus offset {} out of range", offset)));
        };

        let position = offset - corpus_file.base_offset;
        let available = corpus_file.size - position;
        let file = &mut corpus_file.file;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| storage_err("failed to seek corpus", e))?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|e| storage_err("failed to read corpus record", e))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if u64::from(len) > available.saturating_sub(HEADER_SIZE) {
            return Err(SaptError::Storage(format!(
                "corpus record at {} claims {} bytes, {} left in file",
                offset,
                len,
                available.saturating_sub(HEADER_SIZE)
            )));
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)
            .map_err(|e| storage_err("failed to read corpus record", e))?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            return Err(SaptError::Storage(format!(
                "corpus record at {} fails checksum",
                offset
            )));
        }

        Ok(bincode::deserialize(&payload)?)
    }

    /// Make every append so far durable
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for file in inner.files.iter_mut().filter(|f| f.dirty) {
            file.file
                .sync_data()
                .map_err(|e| storage_err("failed to flush corpus", e))?;
            file.dirty = false;
        }
        Ok(())
    }

    /// Snapshot of the current files and sizes
    pub fn manifest(&self) -> StorageManifest {
        let inner = self.inner.lock();
        StorageManifest {
            version: StorageManifest::VERSION,
            files: inner
                .files
                .iter()
                .map(|f| ManifestFile {
                    id: f.id,
                    base_offset: f.base_offset,
                    size: f.size,
                })
                .collect(),
        }
    }

    /// Total bytes appended
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.files.iter().map(|f| f.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.inner.lock().files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlignmentPoint;
    use tempfile::TempDir;

    fn open(dir: &Path, manifest: &StorageManifest) -> CorporaStorage {
        CorporaStorage::open(dir, manifest, 1024 * 1024).unwrap()
    }

    #[test]
    fn test_append_and_retrieve() {
        let tmp = TempDir::new().unwrap();
        let storage = open(tmp.path(), &StorageManifest::new());

        let alignment = vec![AlignmentPoint::new(0, 0), AlignmentPoint::new(1, 1)];
        let first = storage.append(1, &[5, 9, 12], &[20, 21], &alignment).unwrap();
        let second = storage.append(2, &[7], &[8], &vec![]).unwrap();
        assert_eq!(first, 0);
        assert!(second > first);

        let pair = storage.retrieve(first).unwrap();
        assert_eq!(pair.domain, 1);
        assert_eq!(pair.source, vec![5, 9, 12]);
        assert_eq!(pair.target, vec![20, 21]);
        assert_eq!(pair.alignment, alignment);
        assert_eq!(storage.retrieve(second).unwrap().domain, 2);

        assert!(storage.retrieve(storage.size() as i64).is_err());
        assert!(storage.retrieve(-1).is_err());
    }

    #[test]
    fn test_reopen_keeps_appends_past_manifest() {
        let tmp = TempDir::new().unwrap();
        let manifest = {
            let storage = open(tmp.path(), &StorageManifest::new());
            storage.append(1, &[1, 2], &[3], &vec![]).unwrap();
            storage.flush().unwrap();
            let manifest = storage.manifest();
            // Not covered by the manifest
            storage.append(1, &[4, 5], &[6], &vec![]).unwrap();
            manifest
        };

        let storage = open(tmp.path(), &manifest);
        let committed = manifest.total_size() as i64;
        assert!(storage.size() > manifest.total_size());
        assert_eq!(storage.retrieve(0).unwrap().source, vec![1, 2]);
        assert_eq!(storage.retrieve(committed).unwrap().source, vec![4, 5]);

        // New appends never reuse an offset
        let next = storage.append(2, &[7], &[8], &vec![]).unwrap();
        assert!(next > committed);
        assert_eq!(storage.retrieve(committed).unwrap().source, vec![4, 5]);
        assert_eq!(storage.retrieve(next).unwrap().source, vec![7]);
    }

    #[test]
    fn test_oversized_record_length_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let storage = open(tmp.path(), &StorageManifest::new());
        let offset = storage.append(1, &[1, 2, 3], &[4], &vec![]).unwrap();

        let mut file = OpenOptions::new()
            .write(true)
            .open(tmp.path().join(file_name(0)))
            .unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.sync_all().unwrap();

        let err = storage.retrieve(offset).unwrap_err();
        assert!(err.is_storage_error());
    }

    #[test]
    fn test_grown_middle_file_is_inconsistent() {
        let tmp = TempDir::new().unwrap();
        let sentence: Vec<WordId> = (0..64).collect();
        let mut manifest = {
            let storage = CorporaStorage::open(tmp.path(), &StorageManifest::new(), 1024).unwrap();
            for d in 0..10 {
                storage.append(d, &sentence, &sentence, &vec![]).unwrap();
            }
            storage.manifest()
        };
        assert!(manifest.file_count() > 1);
        manifest.files[0].size -= 1;
        for file in manifest.files.iter_mut().skip(1) {
            file.base_offset -= 1;
        }

        let err = CorporaStorage::open(tmp.path(), &manifest, 1024).err().unwrap();
        assert!(err.is_storage_error());
    }

    #[test]
    fn test_short_file_is_inconsistent() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = {
            let storage = open(tmp.path(), &StorageManifest::new());
            storage.append(1, &[1], &[1], &vec![]).unwrap();
            storage.manifest()
        };
        manifest.files[0].size += 100;

        let err = CorporaStorage::open(tmp.path(), &manifest, 1024 * 1024)
            .err()
            .unwrap();
        assert!(err.is_storage_error());
    }

    #[test]
    fn test_missing_file_is_inconsistent() {
        let tmp = TempDir::new().unwrap();
        let mut manifest = StorageManifest::new();
        manifest.files.push(ManifestFile {
            id: 0,
            base_offset: 0,
            size: 10,
        });
        assert!(CorporaStorage::open(tmp.path(), &manifest, 1024 * 1024).is_err());
    }

    #[test]
    fn test_files_roll_over() {
        let tmp = TempDir::new().unwrap();
        let sentence: Vec<WordId> = (0..64).collect();
        let (manifest, offsets) = {
            let storage = CorporaStorage::open(tmp.path(), &StorageManifest::new(), 1024).unwrap();
            let offsets: Vec<i64> = (0..20)
                .map(|d| storage.append(d, &sentence, &sentence, &vec![]).unwrap())
                .collect();
            assert!(storage.file_count() > 1);
            storage.flush().unwrap();
            (storage.manifest(), offsets)
        };

        assert!(manifest.file_count() > 1);
        let storage = CorporaStorage::open(tmp.path(), &manifest, 1024).unwrap();
        for (domain, offset) in offsets.into_iter().enumerate() {
            assert_eq!(storage.retrieve(offset).unwrap().domain, domain as u32);
        }
    }

    #[test]
    fn test_uncommitted_files_are_kept() {
        let tmp = TempDir::new().unwrap();
        let sentence: Vec<WordId> = (0..64).collect();
        let (offsets, size) = {
            let storage = CorporaStorage::open(tmp.path(), &StorageManifest::new(), 1024).unwrap();
            let offsets: Vec<i64> = (0..10)
                .map(|d| storage.append(d, &sentence, &sentence, &vec![]).unwrap())
                .collect();
            assert!(storage.file_count() > 1);
            (offsets, storage.size())
        };

        // Nothing was ever committed
        let storage = CorporaStorage::open(tmp.path(), &StorageManifest::new(), 1024).unwrap();
        assert!(storage.file_count() > 1);
        assert_eq!(storage.size(), size);
        for (domain, offset) in offsets.into_iter().enumerate() {
            assert_eq!(storage.retrieve(offset).unwrap().domain, domain as u32);
        }
        assert_eq!(storage.append(99, &[1], &[1], &vec![]).unwrap(), size as i64);
    }

    #[test]
    fn test_stray_files_are_removed() {
        let tmp = TempDir::new().unwrap();
        {
            let storage = open(tmp.path(), &StorageManifest::new());
            storage.append(1, &[1], &[1], &vec![]).unwrap();
        }
        fs::write(tmp.path().join(file_name(7)), b"stray").unwrap();

        let storage = open(tmp.path(), &StorageManifest::new());
        assert_eq!(storage.file_count(), 1);
        assert!(!tmp.path().join(file_name(7)).exists());
        assert_eq!(storage.retrieve(0).unwrap().domain, 1);
    }
}
