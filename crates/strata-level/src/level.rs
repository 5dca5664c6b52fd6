mod query;

pub use query::PointsQuery;

use crate::{
    CacheConfig, CacheStats, ColumnarStore, ConcurrentSpatialIndex, Generator, LevelError, ParamSource,
    PersistedBytesStore, SaveEvent, SaveEventBus, StoreError, SubscriptionId, TileCache, TileError, TileKind,
    TilePromise, TileSources, TileStorage, TileStorageFactory,
};
use query::TilePlan;

use strata_core::{BlockUnits, Extent, Point, Promise, TileUnits, WorkerPool};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Static description of one tile layer.
#[derive(Clone, Debug)]
pub struct LayerSpec<K, const D: usize> {
    /// Name of the storage item and the cache's worker threads.
    pub name: String,
    pub kind: K,
    /// Version of the persisted tile format. Tiles saved under another token are discarded on open.
    pub token: Vec<u8>,
    /// Blocks that may hold data.
    pub bounds: BlockUnits<Extent<D>>,
    pub tile_shift: u32,
    pub cache: CacheConfig,
}

/// # Exact Level Holder
///
/// One layer of tiles: a [`ConcurrentSpatialIndex`] of every tile ever saved, a [`TileCache`], and the
/// [`TileStorage`] behind it.
///
/// "Is there any data here?" is answered by the index alone, so large empty regions never touch storage. The index is
/// seeded from storage in the background when the layer opens, and is kept current by the cache's save hook and by
/// [`SaveEvent`]s published on [`ExactLevelHolder::save_events`].
///
/// Tile positions are in tile units; the rest of the API is in blocks.
pub struct ExactLevelHolder<K: TileKind<Pos = Point<D>>, const D: usize> {
    name: String,
    tile_shift: u32,
    bounds: BlockUnits<Extent<D>>,
    index: ConcurrentSpatialIndex<D>,
    cache: Arc<TileCache<K>>,
    storage: Arc<TileStorage<Point<D>>>,
    save_events: Arc<SaveEventBus<Point<D>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    closed: AtomicBool,
}

impl<K: TileKind<Pos = Point<D>>, const D: usize> ExactLevelHolder<K, D> {
    pub fn open(
        store: &ColumnarStore,
        spec: LayerSpec<K, D>,
        generator: Arc<dyn Generator<K>>,
        params: Arc<dyn ParamSource<K>>,
        generation_pool: Arc<WorkerPool>,
    ) -> Result<Self, LevelError> {
        let LayerSpec {
            name,
            kind,
            token,
            bounds,
            tile_shift,
            cache: cache_config,
        } = spec;

        let storage = Arc::new(store.open_or_create_item(&name, &TileStorageFactory::<Point<D>>::new(token))?);

        let seed_source = Arc::clone(&storage);
        let index = ConcurrentSpatialIndex::with_initial_points(move || {
            seed_source
                .positions()
                .map(|positions| positions.into_iter().map(|p| p.0))
        });

        let persisted: Arc<dyn PersistedBytesStore<Point<D>>> = storage.clone();
        let sources = TileSources {
            generator,
            params,
            storage: persisted,
            generation_pool,
        };
        let cache = Arc::new(TileCache::new(&name, kind, sources, cache_config)?);

        let saved_index = index.clone();
        cache.on_saved(move |pos: Point<D>| {
            saved_index.add(pos.0);
        });

        let save_events = Arc::new(SaveEventBus::new());
        let subscription = {
            let index = index.clone();
            let cache = Arc::downgrade(&cache);
            let storage = Arc::clone(&storage);
            let tile_bounds = bounds.covering_tiles(tile_shift);
            save_events.subscribe(move |event: &SaveEvent<Point<D>>| {
                if !tile_bounds.0.contains(event.pos) {
                    log::warn!("Ignoring save event for out of bounds tile {:?}", event.pos);
                    return;
                }
                if let Err(e) = storage.save_raw(event.pos, &event.bytes) {
                    log::error!("Failed to persist notified tile {:?}: {}", event.pos, e);
                }
                // The tile was saved, so it exists.
                index.add(event.pos.0);
                if let Some(cache) = cache.upgrade() {
                    cache.notify_update(event.pos, event.bytes.clone());
                }
            })
        };

        log::info!("Opened level layer {} with bounds {:?}", name, bounds.0);
        Ok(Self {
            name,
            tile_shift,
            bounds,
            index,
            cache,
            storage,
            save_events,
            subscription: Mutex::new(Some(subscription)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tile_shift(&self) -> u32 {
        self.tile_shift
    }

    /// Edge length of a tile in blocks.
    pub fn tile_size(&self) -> i32 {
        1 << self.tile_shift
    }

    pub fn tile_mask(&self) -> i32 {
        self.tile_size() - 1
    }

    pub fn bounds(&self) -> BlockUnits<Extent<D>> {
        self.bounds
    }

    /// Every tile that overlaps the block bounds.
    pub fn tile_bounds(&self) -> TileUnits<Extent<D>> {
        self.bounds.covering_tiles(self.tile_shift)
    }

    pub fn is_valid_position(&self, block: BlockUnits<Point<D>>) -> bool {
        self.bounds.0.contains(block.0)
    }

    pub fn is_valid_tile(&self, tile: TileUnits<Point<D>>) -> bool {
        self.tile_bounds().0.contains(tile.0)
    }

    pub fn index(&self) -> &ConcurrentSpatialIndex<D> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<TileCache<K>> {
        &self.cache
    }

    pub fn storage(&self) -> &Arc<TileStorage<Point<D>>> {
        &self.storage
    }

    /// Publish here when a tile is saved outside of this layer's cache.
    pub fn save_events(&self) -> &Arc<SaveEventBus<Point<D>>> {
        &self.save_events
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Requests a tile without blocking.
    pub fn request_tile(&self, tile: TileUnits<Point<D>>, allow_generation: bool) -> TilePromise<K> {
        if !self.is_valid_tile(tile) {
            return Promise::ready(Err(TileError::OutOfBounds));
        }
        self.cache.get(tile.0, allow_generation)
    }

    /// Fails with [`TileError::GenerationNotAllowed`] if the tile was never saved and `allow_generation` is false.
    pub fn get_tile(&self, tile: TileUnits<Point<D>>, allow_generation: bool) -> Result<Arc<K::Tile>, TileError> {
        self.request_tile(tile, allow_generation).join()?.into_result()
    }

    /// Tiles come back in input order. See [`TileCache::multi_get`].
    pub fn multi_get_tiles(
        &self,
        tiles: &[Point<D>],
        allow_generation: bool,
    ) -> Result<Vec<Arc<K::Tile>>, TileError> {
        if tiles.iter().any(|&t| !self.is_valid_tile(TileUnits(t))) {
            return Err(TileError::OutOfBounds);
        }
        self.cache.multi_get(tiles, allow_generation)
    }

    /// True if any tile in the half-open `tiles` extent was ever saved.
    pub fn contains_any_tiles(&self, tiles: TileUnits<Extent<D>>) -> bool {
        let clipped = tiles.0.intersection(&self.tile_bounds().0);
        !clipped.is_empty()
            && self
                .index
                .contains_any(clipped.minimum.0, clipped.least_upper_bound().0)
    }

    /// True if any tile overlapping the blocks `min..=max` was ever saved. Answered from the index alone.
    pub fn contains_any_data(&self, min: BlockUnits<Point<D>>, max: BlockUnits<Point<D>>) -> bool {
        self.contains_any_tiles(BlockUnits::tiles_between(min, max, self.tile_shift))
    }

    /// The blocks that become available by loading the tiles that overlap `min..=max`, i.e. the box rounded out to
    /// tile boundaries.
    pub fn guaranteed_data_available_volume(
        &self,
        min: BlockUnits<Point<D>>,
        max: BlockUnits<Point<D>>,
    ) -> BlockUnits<Extent<D>> {
        BlockUnits::tiles_between(min, max, self.tile_shift).block_extent(self.tile_shift)
    }

    /// The tiles holding every in-bounds point of `query`, without repeats.
    pub fn tile_positions_to_prefetch(&self, query: &PointsQuery<D>) -> Vec<Point<D>> {
        self.tile_positions_to_prefetch_many(std::slice::from_ref(query))
    }

    pub fn tile_positions_to_prefetch_many(&self, queries: &[PointsQuery<D>]) -> Vec<Point<D>> {
        let mut plan = TilePlan::default();
        for query in queries.iter() {
            plan.add_query(query, &self.bounds.0, self.tile_shift);
        }
        plan.into_tiles()
    }

    /// Loads (or generates) every tile `queries` will touch.
    pub fn prefetch(
        &self,
        queries: &[PointsQuery<D>],
        allow_generation: bool,
    ) -> Result<Vec<Arc<K::Tile>>, TileError> {
        let tiles = self.tile_positions_to_prefetch_many(queries);
        log::debug!("{}: prefetching {} tiles", self.name, tiles.len());
        self.cache.multi_get(&tiles, allow_generation)
    }

    /// Unsubscribes from save events, closes the cache and closes the storage item. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(id) = self.subscription.lock().take() {
            self.save_events.unsubscribe(id);
        }
        self.cache.close();
        self.storage.close()?;
        log::info!("Closed level layer {}", self.name);
        Ok(())
    }
}

impl<K: TileKind<Pos = Point<D>>, const D: usize> Drop for ExactLevelHolder<K, D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close level layer {}: {}", self.name, e);
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
