use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SaptError};

/// Suffix array configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuffixArrayConfig {
    /// Maximum exactly indexed phrase length (1..=255)
    pub prefix_length: u8,
    /// Garbage collector wake-up interval in seconds
    pub gc_timeout_secs: f64,
    /// Maximum number of keys removed per garbage collection write batch
    pub gc_batch_size: usize,
    /// Favor write throughput and defer manifest durability to compaction
    pub bulk_load: bool,
    /// Corpus storage files roll over past this size
    pub storage_max_file_size: u64,
}

impl Default for SuffixArrayConfig {
    fn default() -> Self {
        Self {
            prefix_length: 4,
            gc_timeout_secs: 120.0,
            gc_batch_size: 10_000,
            bulk_load: false,
            // 512MB
            storage_max_file_size: 512 * 1024 * 1024,
        }
    }
}

impl SuffixArrayConfig {
    /// Create a configuration with the given prefix length
    pub fn new(prefix_length: u8) -> Self {
        Self {
            prefix_length,
            ..Default::default()
        }
    }

    pub fn with_gc_timeout(mut self, timeout: Duration) -> Self {
        self.gc_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_gc_batch_size(mut self, batch_size: usize) -> Self {
        self.gc_batch_size = batch_size;
        self
    }

    pub fn with_bulk_load(mut self, bulk_load: bool) -> Self {
        self.bulk_load = bulk_load;
        self
    }

    pub fn with_storage_max_file_size(mut self, bytes: u64) -> Self {
        self.storage_max_file_size = bytes;
        self
    }

    pub fn gc_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.gc_timeout_secs)
    }

    pub fn tuning(&self) -> IndexTuning {
        if self.bulk_load {
            IndexTuning::BulkLoad
        } else {
            IndexTuning::SteadyState
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix_length == 0 {
            return Err(SaptError::InvalidArgument(
                "prefix length must be in 1..=255".to_string(),
            ));
        }
        if self.gc_batch_size == 0 {
            return Err(SaptError::InvalidArgument(
                "gc batch size must be positive".to_string(),
            ));
        }
        if !self.gc_timeout_secs.is_finite() || self.gc_timeout_secs <= 0.0 {
            return Err(SaptError::InvalidArgument(format!(
                "invalid gc timeout: {}",
                self.gc_timeout_secs
            )));
        }
        if self.storage_max_file_size < 1024 {
            return Err(SaptError::InvalidArgument(format!(
                "storage file size too small: {}",
                self.storage_max_file_size
            )));
        }
        Ok(())
    }

    /// Serialize the configuration to JSON
    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Deserialize configuration from JSON, missing fields take defaults
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: Self = serde_json::from_slice(data)
            .map_err(|e| SaptError::InvalidArgument(format!("malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }
}

/// Key-value engine tuning profiles
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexTuning {
    /// Write throughput first; journal persistence left to explicit flushes
    BulkLoad,
    /// Bounded compaction thresholds for concurrent reads and writes
    SteadyState,
}

const MIB: u64 = 1024 * 1024;

impl IndexTuning {
    /// Background worker threads for flushes and compactions
    pub fn worker_threads(&self) -> usize {
        let cpus = num_cpus::get();
        match self {
            IndexTuning::BulkLoad => cpus.clamp(1, 4),
            IndexTuning::SteadyState => match cpus {
                0 | 1 => 1,
                2..=4 => 2,
                _ => 4,
            },
        }
    }

    pub fn max_memtable_size(&self) -> u64 {
        match self {
            IndexTuning::BulkLoad => 256 * MIB,
            IndexTuning::SteadyState => 64 * MIB,
        }
    }

    /// Number of L0 tables that triggers a compaction into L1
    pub fn l0_threshold(&self) -> u8 {
        match self {
            IndexTuning::BulkLoad => 64,
            IndexTuning::SteadyState => 8,
        }
    }

    pub fn table_target_size(&self) -> u64 {
        match self {
            IndexTuning::BulkLoad => 256 * MIB,
            IndexTuning::SteadyState => 64 * MIB,
        }
    }

    /// Size ratio between consecutive levels
    pub fn level_ratio(&self) -> f32 {
        8.0
    }

    pub fn manual_journal_persist(&self) -> bool {
        matches!(self, IndexTuning::BulkLoad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SuffixArrayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tuning(), IndexTuning::SteadyState);
        assert_eq!(config.gc_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_config() {
        assert!(SuffixArrayConfig::new(0).validate().is_err());
        assert!(SuffixArrayConfig::new(4).with_gc_batch_size(0).validate().is_err());

        let mut config = SuffixArrayConfig::new(4);
        config.gc_timeout_secs = -1.0;
        assert!(matches!(config.validate(), Err(SaptError::InvalidArgument(_))));
    }

    #[test]
    fn test_builder() {
        let config = SuffixArrayConfig::new(6)
            .with_gc_timeout(Duration::from_millis(250))
            .with_gc_batch_size(10)
            .with_bulk_load(true);

        assert_eq!(config.prefix_length, 6);
        assert_eq!(config.gc_timeout(), Duration::from_millis(250));
        assert_eq!(config.tuning(), IndexTuning::BulkLoad);
        assert!(config.tuning().manual_journal_persist());
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let config = SuffixArrayConfig::new(5).with_bulk_load(true);
        let json = config.to_json().unwrap();
        assert_eq!(SuffixArrayConfig::from_json(&json).unwrap(), config);

        let partial = SuffixArrayConfig::from_json(br#"{"prefix_length": 3}"#).unwrap();
        assert_eq!(partial.prefix_length, 3);
        assert_eq!(partial.gc_batch_size, 10_000);

        assert!(SuffixArrayConfig::from_json(br#"{"prefix_length": 0}"#).is_err());
        assert!(SuffixArrayConfig::from_json(b"not json").is_err());
    }

    #[test]
    fn test_tuning_profiles() {
        let steady = IndexTuning::SteadyState;
        assert_eq!(steady.l0_threshold(), 8);
        assert!(steady.worker_threads() >= 1 && steady.worker_threads() <= 4);
        assert!(!steady.manual_journal_persist());
        assert!(IndexTuning::BulkLoad.max_memtable_size() > steady.max_memtable_size());
    }
}
