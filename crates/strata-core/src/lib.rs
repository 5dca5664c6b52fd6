//! Shared building blocks for the strata crates: integer geometry, unit tags, validated archives and the small
//! concurrency primitives (promises and worker pools) the tile pipeline is built on.

pub mod archived_buf;
pub mod geometry;
pub mod promise;
pub mod units;
pub mod work_timer;
pub mod worker_pool;

use ahash::{AHashMap, AHashSet};
pub type SmallKeyHashMap<K, V> = AHashMap<K, V>;
pub type SmallKeyHashSet<K> = AHashSet<K>;

pub use archived_buf::{ArchiveError, ArchivedBuf};
pub use geometry::{ColumnPos, CubePos, Extent, ExtentIter, Point};
pub use promise::Promise;
pub use units::{BlockUnits, TileUnits};
pub use work_timer::WorkTimer;
pub use worker_pool::{TaskAborted, TaskHandle, WorkerPool};

// Re-exports.
pub use rkyv;
pub use static_assertions;
