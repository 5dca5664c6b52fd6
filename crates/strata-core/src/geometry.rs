use std::ops::{Add, Sub};

/// An `N`-dimensional integer lattice point.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Point<const N: usize>(pub [i32; N]);

/// Position of a 2-D (x, z) column tile.
pub type ColumnPos = Point<2>;
/// Position of a 3-D (x, y, z) cube tile.
pub type CubePos = Point<3>;

static_assertions::assert_eq_size!(CubePos, [i32; 3]);

impl<const N: usize> Default for Point<N> {
    fn default() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> From<[i32; N]> for Point<N> {
    fn from(coords: [i32; N]) -> Self {
        Self(coords)
    }
}

impl<const N: usize> Point<N> {
    pub const fn new(coords: [i32; N]) -> Self {
        Self(coords)
    }

    pub const fn fill(value: i32) -> Self {
        Self([value; N])
    }

    pub const fn coords(&self) -> [i32; N] {
        self.0
    }

    pub fn map(self, mut f: impl FnMut(i32) -> i32) -> Self {
        Self(self.0.map(&mut f))
    }

    pub fn zip_map(self, other: Self, mut f: impl FnMut(i32, i32) -> i32) -> Self {
        Self(std::array::from_fn(|i| f(self.0[i], other.0[i])))
    }

    pub fn all(&self, other: &Self, mut f: impl FnMut(i32, i32) -> bool) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(&a, &b)| f(a, b))
    }

    pub fn min(self, other: Self) -> Self {
        self.zip_map(other, i32::min)
    }

    pub fn max(self, other: Self) -> Self {
        self.zip_map(other, i32::max)
    }

    /// Arithmetic shift right on every coordinate (rounds toward negative infinity).
    pub fn shr(self, shift: u32) -> Self {
        self.map(|c| c >> shift)
    }

    pub fn shl(self, shift: u32) -> Self {
        self.map(|c| c.wrapping_shl(shift))
    }

    /// Shift left, clamping to the `i32` range instead of wrapping.
    pub fn saturating_shl(self, shift: u32) -> Self {
        self.map(|c| (i64::from(c) << shift.min(32)).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
    }
}

impl<const N: usize> Add for Point<N> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.zip_map(rhs, |a, b| a.wrapping_add(b))
    }
}

impl<const N: usize> Sub for Point<N> {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.zip_map(rhs, |a, b| a.wrapping_sub(b))
    }
}

/// A half-open `N`-dimensional box `[minimum, least_upper_bound)`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Extent<const N: usize> {
    pub minimum: Point<N>,
    lub: Point<N>,
}

impl<const N: usize> Extent<N> {
    pub fn from_min_and_lub(minimum: Point<N>, lub: Point<N>) -> Self {
        Self { minimum, lub }
    }

    /// `max` is inclusive. A bound of `i32::MAX` has no representable successor, so it is clamped to `i32::MAX - 1`.
    pub fn from_min_and_max(minimum: Point<N>, max: Point<N>) -> Self {
        Self {
            minimum,
            lub: max.map(|c| c.saturating_add(1)),
        }
    }

    pub fn from_min_and_shape(minimum: Point<N>, shape: Point<N>) -> Self {
        Self {
            minimum,
            lub: minimum + shape,
        }
    }

    pub fn least_upper_bound(&self) -> Point<N> {
        self.lub
    }

    /// The inclusive maximum. Meaningless for empty extents.
    pub fn max(&self) -> Point<N> {
        self.lub - Point::fill(1)
    }

    pub fn shape(&self) -> Point<N> {
        self.lub - self.minimum
    }

    pub fn is_empty(&self) -> bool {
        !self.minimum.all(&self.lub, |min, lub| min < lub)
    }

    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.minimum
            .0
            .iter()
            .zip(self.lub.0.iter())
            .map(|(&min, &lub)| (lub as i64 - min as i64) as u64)
            .product()
    }

    pub fn contains(&self, p: Point<N>) -> bool {
        self.minimum.all(&p, |min, c| min <= c) && p.all(&self.lub, |c, lub| c < lub)
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            minimum: self.minimum.max(other.minimum),
            lub: self.lub.min(other.lub),
        }
    }

    /// The extent of all cells of size `1 << shift` that overlap `self`.
    pub fn shr_round_out(&self, shift: u32) -> Self {
        let minimum = self.minimum.shr(shift);
        if self.is_empty() {
            return Self::from_min_and_lub(minimum, minimum);
        }
        Self::from_min_and_lub(minimum, self.max().shr(shift).map(|c| c.saturating_add(1)))
    }

    /// Snaps both bounds outward onto multiples of `1 << shift`, clamped to the `i32` range.
    pub fn round_out_to_multiple(&self, shift: u32) -> Self {
        let rounded = self.shr_round_out(shift);
        Self::from_min_and_lub(rounded.minimum.shl(shift), rounded.lub.saturating_shl(shift))
    }

    /// Visits every point with the last axis varying fastest.
    pub fn iter(&self) -> ExtentIter<N> {
        ExtentIter {
            extent: *self,
            next: (!self.is_empty()).then(|| self.minimum),
        }
    }
}

pub struct ExtentIter<const N: usize> {
    extent: Extent<N>,
    next: Option<Point<N>>,
}

impl<const N: usize> Iterator for ExtentIter<N> {
    type Item = Point<N>;

    fn next(&mut self) -> Option<Point<N>> {
        let current = self.next?;
        let mut advanced = current;
        let mut axis = N;
        self.next = loop {
            if axis == 0 {
                break None;
            }
            axis -= 1;
            advanced.0[axis] += 1;
            if advanced.0[axis] < self.extent.lub.0[axis] {
                break Some(advanced);
            }
            advanced.0[axis] = self.extent.minimum.0[axis];
        };
        Some(current)
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
    fn iter_visits_every_point_once() {
        let extent = Extent::from_min_and_shape(Point([-1, 2, 0]), Point([2, 3, 4]));
        let points: Vec<_> = extent.iter().collect();
        assert_eq!(points.len() as u64, extent.volume());
        assert_eq!(points[0], Point([-1, 2, 0]));
        assert_eq!(points[1], Point([-1, 2, 1]));
        assert_eq!(*points.last().unwrap(), Point([0, 4, 3]));
        assert!(points.iter().all(|&p| extent.contains(p)));
    }

    #[test]
    fn empty_extent_has_no_points() {
        let extent = Extent::from_min_and_lub(Point([0, 5]), Point([3, 5]));
        assert!(extent.is_empty());
        assert_eq!(extent.volume(), 0);
        assert_eq!(extent.iter().count(), 0);
    }

    #[test]
    fn intersection_of_disjoint_extents_is_empty() {
        let a = Extent::from_min_and_max(Point([0, 0]), Point([3, 3]));
        let b = Extent::from_min_and_max(Point([4, 0]), Point([7, 3]));
        assert!(a.intersection(&b).is_empty());

        let c = Extent::from_min_and_max(Point([2, 2]), Point([5, 5]));
        assert_eq!(
            a.intersection(&c),
            Extent::from_min_and_max(Point([2, 2]), Point([3, 3]))
        );
    }

    #[test]
    fn inclusive_max_at_the_edge_of_the_range_is_not_empty() {
        let extent = Extent::from_min_and_max(Point([0, 0]), Point([i32::MAX, 10]));
        assert!(!extent.is_empty());
        assert_eq!(extent.volume(), i32::MAX as u64 * 11);
        assert!(extent.contains(Point([i32::MAX - 1, 10])));

        let tiles = extent.shr_round_out(4);
        assert_eq!(tiles.least_upper_bound(), Point([(i32::MAX >> 4) + 1, 1]));
        assert_eq!(extent.round_out_to_multiple(4).least_upper_bound(), Point([i32::MAX, 16]));
    }

    #[test]
    fn saturating_shl_clamps() {
        let p = Point([1 << 28, -(1 << 28), 3]).saturating_shl(4);
        assert_eq!(p, Point([i32::MAX, i32::MIN, 48]));
    }

    #[test]
    fn round_out_to_multiple_snaps_outward() {
        let extent = Extent::from_min_and_lub(Point([-17, 1, 16]), Point([-16, 2, 33]));
        assert_eq!(
            extent.round_out_to_multiple(4),
            Extent::from_min_and_lub(Point([-32, 0, 16]), Point([-16, 16, 48]))
        );
    }
}
