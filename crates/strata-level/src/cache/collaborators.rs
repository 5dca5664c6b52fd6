use super::TileCache;
use crate::database::TileKey;
use crate::{StoreError, TileError};

use sled::IVec;
use std::sync::Arc;

/// Describes one layer of tiles: how persisted bytes map to values and how values bake into tiles.
pub trait TileKind: Send + Sync + 'static {
    type Pos: TileKey;
    /// The persisted (and generated) value of one tile.
    type Raw: Send + 'static;
    /// Auxiliary input required for baking and generation.
    type Param: Clone + Send + Sync + 'static;
    type Tile: Send + Sync + 'static;

    /// `Ok(None)` means the bytes carry no tile; the position is treated as never saved.
    fn parse(&self, pos: Self::Pos, bytes: &[u8]) -> Result<Option<Self::Raw>, TileError>;

    fn encode(&self, pos: Self::Pos, raw: &Self::Raw) -> Result<Vec<u8>, TileError>;

    /// Must be pure: baking the same input twice gives equal tiles.
    fn bake(&self, pos: Self::Pos, param: &Self::Param, raw: Self::Raw) -> Self::Tile;
}

/// The outcome of a tile (or parameter) request that did not fail.
#[derive(Clone, Debug)]
pub enum TileLoad<T> {
    Found(T),
    /// Nothing was ever saved for the position and generation was not allowed.
    NotGenerated,
}

impl<T> TileLoad<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, TileLoad::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            TileLoad::Found(value) => Some(value),
            TileLoad::NotGenerated => None,
        }
    }

    /// Converts [`TileLoad::NotGenerated`] into [`TileError::GenerationNotAllowed`].
    pub fn into_result(self) -> Result<T, TileError> {
        self.found().ok_or(TileError::GenerationNotAllowed)
    }

    pub fn map<S>(self, f: impl FnOnce(T) -> S) -> TileLoad<S> {
        match self {
            TileLoad::Found(value) => TileLoad::Found(f(value)),
            TileLoad::NotGenerated => TileLoad::NotGenerated,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Readiness {
    Ready,
    NotReady,
}

/// Produces new tiles. Generation only starts once [`Generator::poll_readiness`] reports [`Readiness::Ready`].
pub trait Generator<K: TileKind>: Send + Sync + 'static {
    /// Polled repeatedly, with backoff, until ready.
    fn poll_readiness(&self, pos: K::Pos) -> Readiness;

    /// Must give the same answer if called again for a position that was already generated.
    fn generate(&self, pos: K::Pos, param: &K::Param) -> Result<K::Raw, TileError>;
}

/// Supplies the [`TileKind::Param`] of a position.
pub trait ParamSource<K: TileKind>: Send + Sync + 'static {
    fn param_for(&self, pos: K::Pos, allow_generation: bool) -> Result<TileLoad<K::Param>, TileError>;
}

/// Raw tile bytes, keyed by position.
pub trait PersistedBytesStore<P>: Send + Sync + 'static {
    fn load_raw(&self, pos: P) -> Result<Option<IVec>, StoreError>;

    fn save_raw(&self, pos: P, bytes: &[u8]) -> Result<(), StoreError>;
}

/// For tile kinds that bake without any auxiliary input.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoParam;

impl<K: TileKind<Param = ()>> ParamSource<K> for NoParam {
    fn param_for(&self, _pos: K::Pos, _allow_generation: bool) -> Result<TileLoad<()>, TileError> {
        Ok(TileLoad::Found(()))
    }
}

/// Uses the tile of a parent layer as the parameter, e.g. the column above a cube.
///
/// The parent cache must be a different layer that never depends on the child, so parameter loads cannot wait on
/// themselves.
pub struct ParentTileSource<P: TileKind, C> {
    parent: Arc<TileCache<P>>,
    parent_of: fn(C) -> P::Pos,
}

impl<P: TileKind, C> ParentTileSource<P, C> {
    pub fn new(parent: Arc<TileCache<P>>, parent_of: fn(C) -> P::Pos) -> Self {
        Self { parent, parent_of }
    }

    pub fn parent(&self) -> &Arc<TileCache<P>> {
        &self.parent
    }
}

impl<K, P> ParamSource<K> for ParentTileSource<P, K::Pos>
where
    K: TileKind<Param = Arc<P::Tile>>,
    P: TileKind,
{
    fn param_for(&self, pos: K::Pos, allow_generation: bool) -> Result<TileLoad<Arc<P::Tile>>, TileError> {
        self.parent.get((self.parent_of)(pos), allow_generation).join()
    }
}
