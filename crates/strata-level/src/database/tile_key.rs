use strata_core::Point;

use smallvec::SmallVec;
use std::fmt::Debug;
use std::hash::Hash;

/// A tile position that can be used as a [`sled`] key.
///
/// We implement the encoding manually (without rkyv) so we have control over the [`Ord`] as interpreted by [`sled`]:
/// the sign bit of every coordinate is flipped and the result written big-endian, so byte order equals coordinate
/// order, axis by axis.
pub trait TileKey: Copy + Debug + Eq + Hash + Send + Sync + 'static {
    fn to_key(&self) -> SmallVec<[u8; 16]>;

    /// `None` if `bytes` is not a key of this type.
    fn from_key(bytes: &[u8]) -> Option<Self>;
}

impl<const N: usize> TileKey for Point<N> {
    fn to_key(&self) -> SmallVec<[u8; 16]> {
        let mut key = SmallVec::with_capacity(4 * N);
        for c in self.0 {
            key.extend_from_slice(&flip_sign(c).to_be_bytes());
        }
        key
    }

    fn from_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 4 * N {
            return None;
        }
        let mut coords = [0; N];
        for (c, chunk) in coords.iter_mut().zip(bytes.chunks_exact(4)) {
            let mut be = [0; 4];
            be.copy_from_slice(chunk);
            *c = unflip_sign(u32::from_be_bytes(be));
        }
        Some(Point(coords))
    }
}

fn flip_sign(c: i32) -> u32 {
    (c as u32) ^ (1 << 31)
}

fn unflip_sign(u: u32) -> i32 {
    (u ^ (1 << 31)) as i32
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
    fn key_order_matches_coordinate_order() {
        let mut points = vec![
            Point([0, 0]),
            Point([-1, 5]),
            Point([i32::MIN, 0]),
            Point([3, -7]),
            Point([3, i32::MAX]),
            Point([-1, -5]),
        ];
        let mut by_key = points.clone();
        by_key.sort_by_key(|p| p.to_key());
        points.sort();
        assert_eq!(points, by_key);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let key = Point([1, -2, 3]).to_key();
        assert_eq!(Point::<3>::from_key(&key), Some(Point([1, -2, 3])));
        assert_eq!(Point::<2>::from_key(&key), None);
    }
}
