//! A small two-layer terrain model: heightmap columns, and voxel cubes baked against the column above them.

use strata_level::core::{BlockUnits, ColumnPos, CubePos, Extent, Point, TileUnits, WorkerPool};
use strata_level::{
    ColumnarStore, ExactLevelHolder, Generator, LayerSpec, LevelConfig, LevelError, NoParam, ParentTileSource,
    PointsQuery, Readiness, StoreError, TileError, TileKind,
};

use bytemuck::{Pod, Zeroable};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Voxel(pub u8);

impl Voxel {
    pub const AIR: Self = Self(0);
    pub const STONE: Self = Self(1);

    pub fn is_solid(self) -> bool {
        self != Self::AIR
    }
}

/// Surface heights of one column tile, indexed `[z][x]` in row-major order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Heightmap {
    edge: usize,
    heights: Vec<i16>,
}

impl Heightmap {
    pub fn new(tile_shift: u32, heights: Vec<i16>) -> Option<Self> {
        let edge = 1usize << tile_shift;
        (heights.len() == edge * edge).then(|| Self { edge, heights })
    }

    pub fn height(&self, x: usize, z: usize) -> i16 {
        self.heights[z * self.edge + x]
    }

    pub fn heights(&self) -> &[i16] {
        &self.heights
    }

    pub fn max_height(&self) -> i16 {
        self.heights.iter().copied().max().unwrap_or(i16::MIN)
    }
}

fn compress(mut bytes: &[u8]) -> Result<Vec<u8>, TileError> {
    let mut encoder = FrameEncoder::new(Vec::new());
    io::copy(&mut bytes, &mut encoder).map_err(TileError::generation)?;
    encoder.finish().map_err(TileError::generation)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, TileError> {
    let mut decoder = FrameDecoder::new(bytes);
    let mut out = Vec::new();
    io::copy(&mut decoder, &mut out).map_err(TileError::parse)?;
    Ok(out)
}

/// Column tiles: one little-endian `i16` height per (x, z), in an LZ4 frame.
#[derive(Clone, Copy, Debug)]
pub struct ColumnKind {
    pub tile_shift: u32,
}

impl TileKind for ColumnKind {
    type Pos = ColumnPos;
    type Raw = Heightmap;
    type Param = ();
    type Tile = Heightmap;

    fn parse(&self, _pos: ColumnPos, bytes: &[u8]) -> Result<Option<Heightmap>, TileError> {
        let raw = decompress(bytes)?;
        let heights = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Heightmap::new(self.tile_shift, heights)
            .map(Some)
            .ok_or_else(|| TileError::parse("heightmap has the wrong size"))
    }

    fn encode(&self, _pos: ColumnPos, raw: &Heightmap) -> Result<Vec<u8>, TileError> {
        let bytes: Vec<u8> = raw.heights.iter().flat_map(|h| h.to_le_bytes()).collect();
        compress(&bytes)
    }

    fn bake(&self, _pos: ColumnPos, _param: &(), raw: Heightmap) -> Heightmap {
        raw
    }
}

/// A baked cube tile.
#[derive(Clone, Debug)]
pub struct Cube {
    pub pos: CubePos,
    /// Indexed `[y][z][x]`.
    pub voxels: Vec<Voxel>,
    pub column: Arc<Heightmap>,
    pub num_solid: usize,
}

impl Cube {
    /// True if the cube lies entirely above the surface of its column.
    pub fn is_above_surface(&self, tile_shift: u32) -> bool {
        i32::from(self.column.max_height()) <= self.pos.0[1] << tile_shift
    }
}

/// Cube tiles: one byte per voxel, in an LZ4 frame. Baked against the parent column.
#[derive(Clone, Copy, Debug)]
pub struct CubeKind {
    pub tile_shift: u32,
}

impl CubeKind {
    fn volume(&self) -> usize {
        1 << (3 * self.tile_shift)
    }
}

impl TileKind for CubeKind {
    type Pos = CubePos;
    type Raw = Vec<Voxel>;
    type Param = Arc<Heightmap>;
    type Tile = Cube;

    fn parse(&self, _pos: CubePos, bytes: &[u8]) -> Result<Option<Vec<Voxel>>, TileError> {
        let raw = decompress(bytes)?;
        if raw.len() != self.volume() {
            return Err(TileError::parse(format!(
                "expected {} voxels, found {}",
                self.volume(),
                raw.len()
            )));
        }
        Ok(Some(bytemuck::cast_slice::<u8, Voxel>(&raw).to_vec()))
    }

    fn encode(&self, _pos: CubePos, raw: &Vec<Voxel>) -> Result<Vec<u8>, TileError> {
        compress(bytemuck::cast_slice(raw))
    }

    fn bake(&self, pos: CubePos, param: &Arc<Heightmap>, raw: Vec<Voxel>) -> Cube {
        let num_solid = raw.iter().filter(|v| v.is_solid()).count();
        Cube {
            pos,
            voxels: raw,
            column: Arc::clone(param),
            num_solid,
        }
    }
}

/// Deterministic terrain from an integer hash of the block position.
pub struct HashTerrainGenerator {
    seed: u64,
    base_height: i32,
    amplitude: u32,
    tile_shift: u32,
    ready: AtomicBool,
    columns_generated: AtomicUsize,
    cubes_generated: AtomicUsize,
}

impl HashTerrainGenerator {
    pub fn new(seed: u64, tile_shift: u32) -> Self {
        Self {
            seed,
            base_height: 32,
            amplitude: 24,
            tile_shift,
            ready: AtomicBool::new(true),
            columns_generated: AtomicUsize::new(0),
            cubes_generated: AtomicUsize::new(0),
        }
    }

    /// While not ready, generation requests wait.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn columns_generated(&self) -> usize {
        self.columns_generated.load(Ordering::Relaxed)
    }

    pub fn cubes_generated(&self) -> usize {
        self.cubes_generated.load(Ordering::Relaxed)
    }

    pub fn surface_height(&self, x: i32, z: i32) -> i16 {
        let h = splitmix64(self.seed ^ (((x as u32 as u64) << 32) | (z as u32 as u64)));
        (self.base_height + (h % u64::from(self.amplitude.max(1))) as i32) as i16
    }

    fn readiness(&self) -> Readiness {
        if self.ready.load(Ordering::Acquire) {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl Generator<ColumnKind> for HashTerrainGenerator {
    fn poll_readiness(&self, _pos: ColumnPos) -> Readiness {
        self.readiness()
    }

    fn generate(&self, pos: ColumnPos, _param: &()) -> Result<Heightmap, TileError> {
        let edge = 1i32 << self.tile_shift;
        let [min_x, min_z] = pos.shl(self.tile_shift).0;
        let mut heights = Vec::with_capacity((edge * edge) as usize);
        for z in 0..edge {
            for x in 0..edge {
                heights.push(self.surface_height(min_x + x, min_z + z));
            }
        }
        self.columns_generated.fetch_add(1, Ordering::Relaxed);
        Heightmap::new(self.tile_shift, heights).ok_or_else(|| TileError::generation("BUG: heightmap size mismatch"))
    }
}

impl Generator<CubeKind> for HashTerrainGenerator {
    fn poll_readiness(&self, _pos: CubePos) -> Readiness {
        self.readiness()
    }

    fn generate(&self, pos: CubePos, column: &Arc<Heightmap>) -> Result<Vec<Voxel>, TileError> {
        let edge = 1usize << self.tile_shift;
        let min_y = pos.0[1] << self.tile_shift;
        let mut voxels = Vec::with_capacity(edge * edge * edge);
        for y in 0..edge as i32 {
            for z in 0..edge {
                for x in 0..edge {
                    let solid = min_y + y < i32::from(column.height(x, z));
                    voxels.push(if solid { Voxel::STONE } else { Voxel::AIR });
                }
            }
        }
        self.cubes_generated.fetch_add(1, Ordering::Relaxed);
        Ok(voxels)
    }
}

/// The column above a cube.
pub fn column_of(cube: CubePos) -> ColumnPos {
    Point([cube.0[0], cube.0[2]])
}

/// Columns and cubes of one level. Cubes take their column as the baking parameter.
pub struct CubicLevel {
    pub columns: ExactLevelHolder<ColumnKind, 2>,
    pub cubes: ExactLevelHolder<CubeKind, 3>,
    tile_shift: u32,
}

impl CubicLevel {
    pub fn open(
        store: &ColumnarStore,
        config: &LevelConfig,
        generator: Arc<HashTerrainGenerator>,
    ) -> Result<Self, LevelError> {
        let shift = config.tile_shift;
        let generation_pool = Arc::new(WorkerPool::new("strata-gen", config.generation_threads)?);

        let columns = ExactLevelHolder::open(
            store,
            LayerSpec {
                name: "columns".into(),
                kind: ColumnKind { tile_shift: shift },
                token: format!("columns-v1-shift{}", shift).into_bytes(),
                bounds: BlockUnits(config.column_bounds()),
                tile_shift: shift,
                cache: config.cache,
            },
            generator.clone(),
            Arc::new(NoParam),
            Arc::clone(&generation_pool),
        )?;

        let parent_columns = ParentTileSource::new(Arc::clone(columns.cache()), column_of);
        let cubes = ExactLevelHolder::open(
            store,
            LayerSpec {
                name: "cubes".into(),
                kind: CubeKind { tile_shift: shift },
                token: format!("cubes-v1-shift{}", shift).into_bytes(),
                bounds: BlockUnits(config.cube_bounds()),
                tile_shift: shift,
                cache: config.cache,
            },
            generator,
            Arc::new(parent_columns),
            generation_pool,
        )?;

        Ok(Self {
            columns,
            cubes,
            tile_shift: shift,
        })
    }

    pub fn tile_shift(&self) -> u32 {
        self.tile_shift
    }

    pub fn get_cube(&self, pos: CubePos, allow_generation: bool) -> Result<Arc<Cube>, TileError> {
        self.cubes.get_tile(TileUnits(pos), allow_generation)
    }

    pub fn get_column(&self, pos: ColumnPos, allow_generation: bool) -> Result<Arc<Heightmap>, TileError> {
        self.columns.get_tile(TileUnits(pos), allow_generation)
    }

    /// True if any cube overlapping the blocks `min..=max` was ever saved.
    pub fn contains_any_data(&self, min: BlockUnits<CubePos>, max: BlockUnits<CubePos>) -> bool {
        self.cubes.contains_any_data(min, max)
    }

    /// Loads every cube touched by the dense block box `blocks`.
    pub fn prefetch_blocks(
        &self,
        blocks: BlockUnits<Extent<3>>,
        allow_generation: bool,
    ) -> Result<Vec<Arc<Cube>>, TileError> {
        self.cubes.prefetch(&[PointsQuery::dense(blocks)], allow_generation)
    }

    /// Closes the cube layer before the column layer it depends on.
    pub fn close(&self) -> Result<(), StoreError> {
        self.cubes.close()?;
        self.columns.close()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
