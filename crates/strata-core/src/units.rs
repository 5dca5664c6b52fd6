use crate::geometry::{Extent, Point};

macro_rules! def_units {
    ($t: ident, $unit: literal) => {
        #[doc = concat!("Denotes that the inner `T` is given in units of ", $unit, ".")]
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
        pub struct $t<T>(pub T);

        impl<T> $t<T> {
            pub fn into_inner(self) -> T {
                self.0
            }

            pub fn map<S>(self, mut f: impl FnMut(T) -> S) -> $t<S> {
                $t(f(self.0))
            }

            pub fn combine<S, R>(u1: Self, u2: $t<S>, mut f: impl FnMut(T, S) -> R) -> $t<R> {
                $t(f(u1.into_inner(), u2.into_inner()))
            }
        }
    };
}

def_units!(BlockUnits, "blocks");
def_units!(TileUnits, "tiles");

impl<const N: usize> BlockUnits<Point<N>> {
    /// The tile containing this block, for tiles with edge length `1 << tile_shift`.
    pub fn containing_tile(self, tile_shift: u32) -> TileUnits<Point<N>> {
        TileUnits(self.0.shr(tile_shift))
    }

    /// The tiles overlapping the inclusive block box `min..=max`. Computed from the tiles of the corners, so a `max` of
    /// `i32::MAX` still counts.
    pub fn tiles_between(min: Self, max: Self, tile_shift: u32) -> TileUnits<Extent<N>> {
        TileUnits(Extent::from_min_and_lub(
            min.containing_tile(tile_shift).0,
            max.containing_tile(tile_shift).0.map(|c| c.saturating_add(1)),
        ))
    }
}

impl<const N: usize> BlockUnits<Extent<N>> {
    /// The smallest extent of tiles that covers every block in `self`.
    pub fn covering_tiles(self, tile_shift: u32) -> TileUnits<Extent<N>> {
        TileUnits(self.0.shr_round_out(tile_shift))
    }
}

impl<const N: usize> TileUnits<Point<N>> {
    /// The minimum block of this tile.
    pub fn min_block(self, tile_shift: u32) -> BlockUnits<Point<N>> {
        BlockUnits(self.0.shl(tile_shift))
    }

    /// Every block in this tile.
    pub fn block_extent(self, tile_shift: u32) -> BlockUnits<Extent<N>> {
        BlockUnits(Extent::from_min_and_shape(
            self.0.shl(tile_shift),
            Point::fill(1 << tile_shift),
        ))
    }
}

impl<const N: usize> TileUnits<Extent<N>> {
    pub fn block_extent(self, tile_shift: u32) -> BlockUnits<Extent<N>> {
        BlockUnits(Extent::from_min_and_lub(
            self.0.minimum.shl(tile_shift),
            self.0.least_upper_bound().saturating_shl(tile_shift),
        ))
    }
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

    #[test]
    fn negative_blocks_round_toward_negative_tiles() {
        let block = BlockUnits(Point([-1, 15, 16]));
        assert_eq!(block.containing_tile(4), TileUnits(Point([-1, 0, 1])));
    }

    #[test]
    fn tiles_between_includes_the_last_block_of_the_range() {
        let tiles = BlockUnits::tiles_between(BlockUnits(Point([-17, 0])), BlockUnits(Point([i32::MAX, 15])), 4);
        assert_eq!(
            tiles.0,
            Extent::from_min_and_lub(Point([-2, 0]), Point([(i32::MAX >> 4) + 1, 1]))
        );
        assert!(tiles.0.contains(Point([i32::MAX >> 4, 0])));
        assert_eq!(tiles.block_extent(4).0.least_upper_bound(), Point([i32::MAX, 16]));
    }

    #[test]
    fn covering_tiles_round_out() {
        let blocks = BlockUnits(Extent::from_min_and_lub(Point([-3, 0]), Point([17, 16])));
        let tiles = blocks.covering_tiles(4);
        assert_eq!(tiles.0, Extent::from_min_and_lub(Point([-1, 0]), Point([2, 1])));
        assert_eq!(
            tiles.block_extent(4).0,
            Extent::from_min_and_lub(Point([-16, 0]), Point([32, 16]))
        );
    }
}
