//! Strata: tile storage for voxel levels.
//!
//! The engine lives in [`strata_level`]: a columnar store on top of sled, a concurrent tile cache that loads or
//! generates tiles on demand, and a spatial index of which tiles exist. This crate adds the loadable [`Config`] and a
//! reference two-layer terrain ([`CubicLevel`]) built from those pieces.

mod config;
pub mod terrain;

pub use config::{Config, ConfigError};
pub use terrain::*;

pub use strata_level as level;
