pub mod batch;
pub mod collector;
pub mod config;
pub mod cursor;
pub mod error;
pub mod gc;
pub mod iterator;
pub mod key;
pub mod merge;
pub mod metrics;
pub mod posting;
pub mod storage;
pub mod store;
pub mod suffix_array;
pub mod types;

pub use batch::{BatchEntry, StreamState, UpdateBatch};
pub use collector::Collector;
pub use config::{IndexTuning, SuffixArrayConfig};
pub use error::{Result, SaptError};
pub use gc::{GarbageCollector, SweepStats};
pub use iterator::{IndexEntry, IndexIterator};
pub use merge::MergeOperator;
pub use metrics::IndexMetrics;
pub use posting::{Posting, PostingList};
pub use storage::{CorporaStorage, StorageManifest};
pub use suffix_array::{IndexStats, SuffixArray};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
