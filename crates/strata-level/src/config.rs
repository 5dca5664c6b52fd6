use strata_core::{Extent, Point};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory of the sled database.
    pub path: PathBuf,
    /// Delete the database when it is dropped. Used by tests and throwaway levels.
    pub temporary: bool,
    pub cache_capacity_bytes: u64,
    /// Requires sled's `compression` feature.
    pub use_compression: bool,
    pub flush_every_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("strata-db"),
            temporary: false,
            cache_capacity_bytes: 64 * 1024 * 1024,
            use_compression: false,
            flush_every_ms: Some(500),
        }
    }
}

impl StoreConfig {
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Default::default()
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn sled_config(&self) -> sled::Config {
        let config = sled::Config::default()
            .cache_capacity(self.cache_capacity_bytes)
            .use_compression(self.use_compression)
            .flush_every_ms(self.flush_every_ms)
            .mode(sled::Mode::LowSpace);
        if self.temporary {
            config.temporary(true)
        } else {
            config.path(&self.path)
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Threads that resolve tile requests (loading, parsing and waiting on generation).
    pub worker_threads: usize,
    /// First sleep while waiting for the generator to become ready. Doubles on each miss.
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            poll_interval_ms: 1,
            max_poll_interval_ms: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LevelConfig {
    /// Tiles are `1 << tile_shift` blocks along each axis.
    pub tile_shift: u32,
    /// Blocks with `|x| < horizontal_radius` and `|z| < horizontal_radius` are inside the level.
    pub horizontal_radius: i32,
    pub min_height: i32,
    /// Exclusive.
    pub max_height: i32,
    pub generation_threads: usize,
    pub cache: CacheConfig,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            tile_shift: 4,
            horizontal_radius: 30_000_000,
            min_height: -64,
            max_height: 320,
            generation_threads: 2,
            cache: CacheConfig::default(),
        }
    }
}

impl LevelConfig {
    /// Block bounds of the level in (x, y, z).
    pub fn cube_bounds(&self) -> Extent<3> {
        let r = self.horizontal_radius;
        Extent::from_min_and_lub(
            Point([-r, self.min_height, -r]),
            Point([r, self.max_height, r]),
        )
    }

    /// Block bounds of the level in (x, z).
    pub fn column_bounds(&self) -> Extent<2> {
        let r = self.horizontal_radius;
        Extent::from_min_and_lub(Point([-r, -r]), Point([r, r]))
    }
}
