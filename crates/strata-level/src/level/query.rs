use strata_core::{BlockUnits, Extent, Point, SmallKeyHashSet};

use itertools::Itertools;

/// A set of block positions that a caller is about to read, used to plan which tiles to prefetch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PointsQuery<const D: usize> {
    Single(Point<D>),
    /// Along axis `i`, `size[i]` points starting at `origin[i]`, spaced `stride[i]` blocks apart. A stride of 1 is a
    /// dense box.
    OriginSizeStride {
        origin: Point<D>,
        size: [u32; D],
        stride: [u32; D],
    },
    Multi(Vec<Point<D>>),
}

impl<const D: usize> PointsQuery<D> {
    pub fn dense(extent: BlockUnits<Extent<D>>) -> Self {
        let shape = extent.0.shape();
        PointsQuery::OriginSizeStride {
            origin: extent.0.minimum,
            size: shape.0.map(|s| s.max(0) as u32),
            stride: [1; D],
        }
    }

    /// Number of points, counting repeats.
    pub fn count(&self) -> u64 {
        match self {
            PointsQuery::Single(_) => 1,
            PointsQuery::OriginSizeStride { size, .. } => size.iter().map(|&s| s as u64).product(),
            PointsQuery::Multi(points) => points.len() as u64,
        }
    }
}

/// Tile positions in first-seen order, without repeats.
#[derive(Default)]
pub(crate) struct TilePlan<const D: usize> {
    seen: SmallKeyHashSet<[i32; D]>,
    tiles: Vec<Point<D>>,
}

impl<const D: usize> TilePlan<D> {
    pub fn into_tiles(self) -> Vec<Point<D>> {
        self.tiles
    }

    fn push(&mut self, tile: Point<D>) {
        if self.seen.insert(tile.0) {
            self.tiles.push(tile);
        }
    }

    /// Adds the tiles containing every point of `query` that lies within `bounds`.
    pub fn add_query(&mut self, query: &PointsQuery<D>, bounds: &Extent<D>, tile_shift: u32) {
        match query {
            PointsQuery::Single(p) => self.add_point(*p, bounds, tile_shift),
            PointsQuery::Multi(points) => {
                for p in points.iter() {
                    self.add_point(*p, bounds, tile_shift);
                }
            }
            PointsQuery::OriginSizeStride { origin, size, stride } => {
                let mut axes: [Vec<i32>; D] = std::array::from_fn(|_| Vec::new());
                for (i, axis) in axes.iter_mut().enumerate() {
                    *axis = axis_tiles(
                        origin.0[i],
                        size[i],
                        stride[i],
                        bounds.minimum.0[i],
                        bounds.least_upper_bound().0[i],
                        tile_shift,
                    );
                    if axis.is_empty() {
                        // No valid point along this axis, so none at all.
                        return;
                    }
                }
                for coords in axes.iter().map(|a| a.iter().copied()).multi_cartesian_product() {
                    let mut tile = [0; D];
                    tile.copy_from_slice(&coords);
                    self.push(Point(tile));
                }
            }
        }
    }

    fn add_point(&mut self, p: Point<D>, bounds: &Extent<D>, tile_shift: u32) {
        if bounds.contains(p) {
            self.push(p.shr(tile_shift));
        }
    }
}

/// Ascending tile coordinates hit by the valid points `origin + k * stride` for `k < size`, where valid means within
/// `[min, lub)`.
fn axis_tiles(origin: i32, size: u32, stride: u32, min: i32, lub: i32, tile_shift: u32) -> Vec<i32> {
    let mut tiles = Vec::new();
    if size == 0 || min >= lub {
        return tiles;
    }
    let (origin, min, lub) = (origin as i64, min as i64, lub as i64);
    let last = origin + (size as i64 - 1) * stride as i64;

    if stride <= 1 {
        // Dense: every tile between the clipped ends.
        let first = origin.max(min);
        let last = last.min(lub - 1);
        if first <= last {
            let (a, b) = ((first >> tile_shift) as i32, (last >> tile_shift) as i32);
            tiles.extend(a..=b);
        }
        return tiles;
    }

    // Skip straight to the first valid point.
    let skip = if origin < min {
        (min - origin + stride as i64 - 1) / stride as i64
    } else {
        0
    };
    let mut pos = origin + skip * stride as i64;
    while pos <= last && pos < lub {
        let tile = (pos >> tile_shift) as i32;
        if tiles.last() != Some(&tile) {
            tiles.push(tile);
        }
        pos += stride as i64;
    }
    tiles
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    fn plan<const D: usize>(queries: &[PointsQuery<D>], bounds: Extent<D>, shift: u32) -> Vec<Point<D>> {
        let mut plan = TilePlan::default();
        for q in queries {
            plan.add_query(q, &bounds, shift);
        }
        plan.into_tiles()
    }

    #[test]
    fn axis_tiles_clip_and_dedup() {
        // Dense, clipped to [0, 40) with 16-block tiles.
        assert_eq!(axis_tiles(-10, 100, 1, 0, 40, 4), vec![0, 1, 2]);
        // Sparse with stride larger than a tile: 0, 20, 40, 60 -> tiles 0, 1, 2, 3.
        assert_eq!(axis_tiles(0, 4, 20, 0, 1000, 4), vec![0, 1, 2, 3]);
        // Sparse with stride smaller than a tile: 0, 5, 10, 15, 20 -> tiles 0, 1.
        assert_eq!(axis_tiles(0, 5, 5, 0, 1000, 4), vec![0, 1]);
        // Every point out of bounds.
        assert!(axis_tiles(-100, 3, 10, 0, 16, 4).is_empty());
        // Negative coordinates round toward negative infinity.
        assert_eq!(axis_tiles(-17, 2, 1, -100, 100, 4), vec![-2, -1]);
        // A zero stride repeats the origin.
        assert_eq!(axis_tiles(3, 10, 0, 0, 16, 4), vec![0]);
    }

    #[test]
    fn sparse_grid_matches_brute_force() {
        let bounds = Extent::from_min_and_lub(Point([-50, 0]), Point([50, 64]));
        let query = PointsQuery::OriginSizeStride {
            origin: Point([-70, -3]),
            size: [12, 9],
            stride: [13, 7],
        };
        let mut expected = Vec::new();
        for i in 0..12 {
            for j in 0..9 {
                let p = Point([-70 + 13 * i, -3 + 7 * j]);
                if bounds.contains(p) && !expected.contains(&p.shr(3)) {
                    expected.push(p.shr(3));
                }
            }
        }
        let mut planned = plan(&[query], bounds, 3);
        planned.sort();
        expected.sort();
        assert_eq!(planned, expected);
    }

    #[test]
    fn several_queries_share_tiles() {
        let bounds = Extent::from_min_and_lub(Point([0, 0, 0]), Point([64, 64, 64]));
        let queries = [
            PointsQuery::Single(Point([1, 1, 1])),
            PointsQuery::Multi(vec![Point([2, 2, 2]), Point([20, 1, 1]), Point([-1, 0, 0])]),
            PointsQuery::dense(BlockUnits(Extent::from_min_and_max(Point([0, 0, 0]), Point([31, 15, 15])))),
        ];
        assert_eq!(
            plan(&queries, bounds, 4),
            vec![Point([0, 0, 0]), Point([1, 0, 0])]
        );
        assert_eq!(queries[2].count(), 32 * 16 * 16);
    }
}
