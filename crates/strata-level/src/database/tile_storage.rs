use super::{Column, ColumnRequirement, ItemConfig, ItemRequirement, StorageItem, StorageItemFactory, TileKey};
use crate::{PersistedBytesStore, StoreError};

use sled::IVec;
use std::error::Error;
use std::marker::PhantomData;
use std::sync::Arc;

/// The single column of a tile storage item.
pub const TILE_COLUMN: &str = "tiles";

/// Raw tile bytes of one layer, keyed by [`TileKey`] in a single column.
pub struct TileStorage<P> {
    item: Arc<StorageItem>,
    tiles: Column,
    marker: PhantomData<fn(P)>,
}

impl<P: TileKey> TileStorage<P> {
    pub fn item(&self) -> &Arc<StorageItem> {
        &self.item
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.item.read(|r| r.len(&self.tiles))
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|n| n == 0)
    }

    /// Visits every saved position in key order. Keys that do not decode as `P` are skipped.
    pub fn for_each_position(&self, mut f: impl FnMut(P)) -> Result<(), StoreError> {
        self.item.read(|r| {
            r.for_each(&self.tiles, |key, _| {
                if let Some(pos) = P::from_key(key) {
                    f(pos);
                } else {
                    log::warn!("Skipping malformed tile key {:?} in {}", key, self.item.name());
                }
            })
        })
    }

    pub fn positions(&self) -> Result<Vec<P>, StoreError> {
        let mut positions = Vec::new();
        self.for_each_position(|p| positions.push(p))?;
        Ok(positions)
    }

    pub fn remove(&self, pos: P) -> Result<(), StoreError> {
        self.item.write_atomic(|w| w.remove(&self.tiles, &pos.to_key()[..]))
    }

    /// Deletes every tile.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.item.clear_columns(&[&self.tiles])
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.item.close()
    }
}

impl<P: TileKey> PersistedBytesStore<P> for TileStorage<P> {
    fn load_raw(&self, pos: P) -> Result<Option<IVec>, StoreError> {
        self.item.read(|r| r.get(&self.tiles, pos.to_key()))
    }

    fn save_raw(&self, pos: P, bytes: &[u8]) -> Result<(), StoreError> {
        self.item
            .write_atomic(|w| w.insert(&self.tiles, &pos.to_key()[..], bytes))
    }
}

/// Opens a [`TileStorage`] whose data is versioned by `token`.
///
/// An existing item with a different token holds tiles in an incompatible format, so it is recreated empty.
pub struct TileStorageFactory<P> {
    token: Vec<u8>,
    marker: PhantomData<fn(P)>,
}

impl<P> TileStorageFactory<P> {
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: token.into(),
            marker: PhantomData,
        }
    }
}

impl<P: TileKey> StorageItemFactory for TileStorageFactory<P> {
    type Item = TileStorage<P>;

    fn configure(&self, config: &mut ItemConfig) -> ItemRequirement {
        let requirement = match config.existing_token() {
            Some(existing) if !config.is_new_item() && existing != self.token.as_slice() => {
                log::warn!(
                    "Discarding tiles saved with token {:?}, expected {:?}",
                    String::from_utf8_lossy(existing),
                    String::from_utf8_lossy(&self.token)
                );
                ItemRequirement::DeleteExistingAndCreate
            }
            _ => ItemRequirement::CreateIfMissing,
        };
        config.set_token(self.token.clone());
        config.register_column(TILE_COLUMN, ColumnRequirement::CreateIfMissing);
        requirement
    }

    fn create(&self, item: Arc<StorageItem>) -> Result<TileStorage<P>, Box<dyn Error + Send + Sync>> {
        let tiles = item
            .column(TILE_COLUMN)
            .cloned()
            .ok_or_else(|| format!("item {} is missing column {}", item.name(), TILE_COLUMN))?;
        Ok(TileStorage {
            item,
            tiles,
            marker: PhantomData,
        })
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
