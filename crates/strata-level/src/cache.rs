mod collaborators;

pub use collaborators::*;

use crate::{CacheConfig, TileError};

use strata_core::{Promise, SmallKeyHashMap, WorkTimer, WorkerPool};

use parking_lot::{Mutex, RwLock};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// What every waiter of one request observes.
pub type TileResult<T> = Result<TileLoad<Arc<T>>, TileError>;

pub type TilePromise<K> = Promise<TileResult<<K as TileKind>::Tile>>;

/// The collaborators a [`TileCache`] resolves tiles with.
pub struct TileSources<K: TileKind> {
    pub generator: Arc<dyn Generator<K>>,
    pub params: Arc<dyn ParamSource<K>>,
    pub storage: Arc<dyn PersistedBytesStore<K::Pos>>,
    /// Generation jobs run here. They never wait on a cache, so one pool can be shared by every layer.
    pub generation_pool: Arc<WorkerPool>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub requests: u64,
    /// Requests that joined a computation already in flight.
    pub joined: u64,
    pub loaded: u64,
    pub generated: u64,
    pub not_generated: u64,
    pub failed: u64,
    pub generation_time: WorkTimer,
}

/// # Tile Cache
///
/// Maps a tile position to a baked, immutable tile, with at most one load-or-generate computation in flight per
/// position. Every caller asking for the same position while it is in flight receives the same [`Promise`].
///
/// ## Resolution
///
/// A request first fetches its [`TileKind::Param`], then tries bytes staged by [`TileCache::notify_update`], then
/// persisted bytes. If none parse to a tile, the request either settles as [`TileLoad::NotGenerated`] or, when
/// generation is allowed, waits for the [`Generator`] to become ready, generates on the generation pool, persists the
/// result and bakes it. A generation that finishes after the position was notified yields to the notified bytes.
///
/// Once a request settles, its in-flight entry is removed, so the next request for the position starts over. Finished
/// tiles are not memoized here.
///
/// A request that allows generation never joins one that doesn't. Instead it upgrades the in-flight entry: the new
/// promise waits for the old one and generates only if the old one found nothing.
pub struct TileCache<K: TileKind> {
    shared: Arc<CacheShared<K>>,
    workers: WorkerPool,
}

struct CacheShared<K: TileKind> {
    name: String,
    kind: K,
    sources: TileSources<K>,
    config: CacheConfig,
    in_flight: Mutex<SmallKeyHashMap<K::Pos, InFlight<K>>>,
    staged: Mutex<SmallKeyHashMap<K::Pos, Arc<[u8]>>>,
    save_listeners: RwLock<Vec<Box<dyn Fn(K::Pos) + Send + Sync>>>,
    stats: Mutex<CacheStats>,
    closed: AtomicBool,
}

struct InFlight<K: TileKind> {
    promise: TilePromise<K>,
    allow_generation: bool,
}

impl<K: TileKind> TileCache<K> {
    pub fn new(name: &str, kind: K, sources: TileSources<K>, config: CacheConfig) -> io::Result<Self> {
        let workers = WorkerPool::new(name, config.worker_threads)?;
        Ok(Self {
            shared: Arc::new(CacheShared {
                name: name.to_owned(),
                kind,
                sources,
                config,
                in_flight: Mutex::new(SmallKeyHashMap::default()),
                staged: Mutex::new(SmallKeyHashMap::default()),
                save_listeners: RwLock::new(Vec::new()),
                stats: Mutex::new(CacheStats::default()),
                closed: AtomicBool::new(false),
            }),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> &K {
        &self.shared.kind
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStats {
        *self.shared.stats.lock()
    }

    pub fn num_in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Calls `listener` after every tile this cache generates and persists.
    pub fn on_saved(&self, listener: impl Fn(K::Pos) + Send + Sync + 'static) {
        self.shared.save_listeners.write().push(Box::new(listener));
    }

    /// Requests the tile at `pos`. Never blocks; the work happens on the cache's workers.
    pub fn get(&self, pos: K::Pos, allow_generation: bool) -> TilePromise<K> {
        if self.is_closed() {
            return Promise::ready(Err(TileError::Closed));
        }
        self.shared.stats.lock().requests += 1;

        let mut in_flight = self.shared.in_flight.lock();
        if let Some(entry) = in_flight.get_mut(&pos) {
            if entry.allow_generation || !allow_generation {
                let promise = entry.promise.clone();
                drop(in_flight);
                self.shared.stats.lock().joined += 1;
                return promise;
            }

            let previous = std::mem::replace(&mut entry.promise, Promise::new());
            entry.allow_generation = true;
            let upgraded = entry.promise.clone();
            drop(in_flight);

            log::debug!("{}: upgrading in-flight request for {:?} to allow generation", self.shared.name, pos);
            let settle = Settle::new(&self.shared, pos, upgraded.clone());
            self.workers.spawn(move || {
                let result = match previous.join() {
                    Ok(TileLoad::NotGenerated) => settle.shared.resolve(pos, true),
                    other => other,
                };
                settle.complete(result);
            });
            return upgraded;
        }

        let promise = Promise::new();
        in_flight.insert(
            pos,
            InFlight {
                promise: promise.clone(),
                allow_generation,
            },
        );
        drop(in_flight);

        let settle = Settle::new(&self.shared, pos, promise.clone());
        self.workers.spawn(move || {
            let result = settle.shared.resolve(pos, allow_generation);
            settle.complete(result);
        });
        promise
    }

    /// Blocking form of [`TileCache::get`] that reports [`TileLoad::NotGenerated`] as
    /// [`TileError::GenerationNotAllowed`].
    pub fn get_tile(&self, pos: K::Pos, allow_generation: bool) -> Result<Arc<K::Tile>, TileError> {
        self.get(pos, allow_generation).join()?.into_result()
    }

    /// Requests every position before waiting on any of them. Tiles come back in input order.
    ///
    /// Every request is awaited even after one fails. A real failure is reported ahead of
    /// [`TileError::GenerationNotAllowed`].
    pub fn multi_get(&self, positions: &[K::Pos], allow_generation: bool) -> Result<Vec<Arc<K::Tile>>, TileError> {
        let promises: Vec<_> = positions.iter().map(|&p| self.get(p, allow_generation)).collect();
        let results: Vec<_> = promises.iter().map(Promise::join).collect();
        gather(results)
    }

    /// Like [`TileCache::multi_get`], but awaits instead of blocking.
    pub async fn multi_get_async(
        &self,
        positions: &[K::Pos],
        allow_generation: bool,
    ) -> Result<Vec<Arc<K::Tile>>, TileError> {
        let promises: Vec<_> = positions.iter().map(|&p| self.get(p, allow_generation)).collect();
        let mut results = Vec::with_capacity(promises.len());
        for promise in promises {
            results.push(promise.await);
        }
        gather(results)
    }

    /// Records that `bytes` were just saved for `pos` by someone other than this cache.
    ///
    /// Every later resolution of `pos` uses `bytes` instead of reading storage, until `pos` is notified again. A
    /// request already in flight is detached, so later requests start fresh. The detached request still settles, and
    /// if it was generating, it settles with the notified tile and does not persist its own.
    pub fn notify_update(&self, pos: K::Pos, bytes: impl Into<Arc<[u8]>>) {
        if self.is_closed() {
            return;
        }
        self.shared.staged.lock().insert(pos, bytes.into());
        if self.shared.in_flight.lock().remove(&pos).is_some() {
            log::debug!("{}: detached in-flight request for updated tile {:?}", self.shared.name, pos);
        }
    }

    /// Fails new requests and any request still waiting for the generator. Requests already loading or generating
    /// finish normally. Listeners are dropped.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.save_listeners.write().clear();
        self.shared.staged.lock().clear();
        log::info!("Closed tile cache {}", self.shared.name);
    }
}

impl<K: TileKind> Drop for TileCache<K> {
    fn drop(&mut self) {
        self.close();
    }
}

fn gather<T>(results: Vec<TileResult<T>>) -> Result<Vec<Arc<T>>, TileError> {
    let mut tiles = Vec::with_capacity(results.len());
    let mut not_generated = false;
    for result in results {
        match result? {
            TileLoad::Found(tile) => tiles.push(tile),
            TileLoad::NotGenerated => not_generated = true,
        }
    }
    if not_generated {
        return Err(TileError::GenerationNotAllowed);
    }
    Ok(tiles)
}

impl<K: TileKind> CacheShared<K> {
    fn resolve(&self, pos: K::Pos, allow_generation: bool) -> TileResult<K::Tile> {
        let result = self.try_resolve(pos, allow_generation);
        let mut stats = self.stats.lock();
        match &result {
            Ok(TileLoad::NotGenerated) => stats.not_generated += 1,
            Ok(TileLoad::Found(_)) => {}
            Err(e) => {
                stats.failed += 1;
                log::debug!("{}: request for {:?} failed: {}", self.name, pos, e);
            }
        }
        result
    }

    fn try_resolve(&self, pos: K::Pos, allow_generation: bool) -> TileResult<K::Tile> {
        let param = match self.sources.params.param_for(pos, allow_generation)? {
            TileLoad::Found(param) => param,
            TileLoad::NotGenerated => return Ok(TileLoad::NotGenerated),
        };

        let staged = self.staged.lock().get(&pos).cloned();
        let parsed = match staged {
            Some(bytes) => self.kind.parse(pos, &bytes)?,
            None => match self.sources.storage.load_raw(pos)? {
                Some(bytes) => self.kind.parse(pos, &bytes)?,
                None => None,
            },
        };
        if let Some(raw) = parsed {
            self.stats.lock().loaded += 1;
            return Ok(TileLoad::Found(Arc::new(self.kind.bake(pos, &param, raw))));
        }

        if !allow_generation {
            return Ok(TileLoad::NotGenerated);
        }
        self.wait_until_ready(pos)?;

        log::debug!("{}: generating {:?}", self.name, pos);
        let generator = Arc::clone(&self.sources.generator);
        let generation_param = param.clone();
        let (raw, elapsed) = self
            .sources
            .generation_pool
            .spawn_with_result(move || {
                let start = Instant::now();
                let raw = generator.generate(pos, &generation_param);
                (raw, start.elapsed())
            })
            .join()?;
        let raw = raw?;
        {
            let mut stats = self.stats.lock();
            stats.generated += 1;
            stats.generation_time.complete_item(elapsed);
        }

        if let Some(bytes) = self.staged.lock().get(&pos).cloned() {
            if let Some(notified) = self.kind.parse(pos, &bytes)? {
                log::debug!("{}: {:?} was updated while generating, discarding the generated tile", self.name, pos);
                return Ok(TileLoad::Found(Arc::new(self.kind.bake(pos, &param, notified))));
            }
        }

        let bytes = self.kind.encode(pos, &raw)?;
        self.sources.storage.save_raw(pos, &bytes)?;
        for listener in self.save_listeners.read().iter() {
            listener(pos);
        }

        Ok(TileLoad::Found(Arc::new(self.kind.bake(pos, &param, raw))))
    }

    fn wait_until_ready(&self, pos: K::Pos) -> Result<(), TileError> {
        let max_interval = Duration::from_millis(self.config.max_poll_interval_ms.max(1));
        let mut interval = Duration::from_millis(self.config.poll_interval_ms.max(1)).min(max_interval);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TileError::Closed);
            }
            if self.sources.generator.poll_readiness(pos) == Readiness::Ready {
                return Ok(());
            }
            log::trace!("{}: generator not ready for {:?}, sleeping {:?}", self.name, pos, interval);
            thread::sleep(interval);
            interval = (interval * 2).min(max_interval);
        }
    }

    /// Removes the in-flight entry for `pos` if it still belongs to `promise`.
    fn forget(&self, pos: K::Pos, promise: &TilePromise<K>) {
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&pos)
            .map_or(false, |entry| Promise::ptr_eq(&entry.promise, promise))
        {
            in_flight.remove(&pos);
        }
    }
}

/// Settles one in-flight promise exactly once: the entry is forgotten, then the promise completed. If the job unwinds
/// before completing, waiters see [`TileError::WorkerPanicked`].
struct Settle<K: TileKind> {
    shared: Arc<CacheShared<K>>,
    pos: K::Pos,
    promise: TilePromise<K>,
    result: Option<TileResult<K::Tile>>,
}

impl<K: TileKind> Settle<K> {
    fn new(shared: &Arc<CacheShared<K>>, pos: K::Pos, promise: TilePromise<K>) -> Self {
        Self {
            shared: Arc::clone(shared),
            pos,
            promise,
            result: None,
        }
    }

    fn complete(mut self, result: TileResult<K::Tile>) {
        self.result = Some(result);
    }
}

impl<K: TileKind> Drop for Settle<K> {
    fn drop(&mut self) {
        self.shared.forget(self.pos, &self.promise);
        let result = self.result.take().unwrap_or_else(|| {
            log::error!("{}: worker panicked while resolving {:?}", self.shared.name, self.pos);
            Err(TileError::WorkerPanicked)
        });
        self.promise.complete(result);
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
