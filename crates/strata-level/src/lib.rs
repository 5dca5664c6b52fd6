//! Exact, generation-backed tile storage for a voxel level.
//!
//! # Layers
//!
//! A level is made of tile layers (for example 2-D heightmap columns and 3-D voxel cubes). Each layer owns three pieces:
//!
//! - a [`ConcurrentSpatialIndex`] that records every tile position ever saved, so "is there any data in this box?" can
//!   be answered without touching storage
//! - a [`TileCache`] that turns a position into exactly one in-flight load-or-generate computation, no matter how many
//!   callers ask for it concurrently
//! - a [`TileStorage`] item inside a shared [`ColumnarStore`]
//!
//! [`ExactLevelHolder`] ties them together.
//!
//! # Storage
//!
//! The [`ColumnarStore`] hosts many independently versioned [`StorageItem`]s on one [`sled::Db`]. Each item owns a set
//! of named [`Column`]s, each backed by its own sled tree (a "column family"). The item's schema is negotiated every time
//! it is opened through a [`StorageItemFactory`].

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod index;
pub mod level;

pub use cache::*;
pub use config::*;
pub use database::*;
pub use error::*;
pub use events::*;
pub use index::*;
pub use level::*;

pub use sled;
pub use strata_core as core;
