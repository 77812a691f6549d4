//! Coordinate types.
//!
//! Dimensions are indexed by one of the primitive types below, all sharing
//! the [`CoordType`] trait. Integral coordinates additionally implement
//! [`DenseCoord`], which carries the cell arithmetic dense arrays need;
//! real-valued domains never get a dense read path because no such
//! implementation exists for `f32`/`f64`.
//!
//! Runtime dispatch from a [`Datatype`] happens once per query through
//! [`match_each_coord_type`].

use std::fmt::Debug;

use tessera_error::TesseraExpect;

use crate::datatype::Datatype;

mod private {
    pub trait Sealed {}
}

/// A primitive type usable as a dimension coordinate.
pub trait CoordType:
    private::Sealed + Copy + PartialEq + PartialOrd + Default + Debug + Send + Sync + 'static
{
    const DATATYPE: Datatype;

    /// Width of one coordinate in bytes.
    const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    fn to_f64(self) -> f64;

    /// Decode one coordinate from little-endian bytes.
    fn from_le(bytes: &[u8]) -> Self;

    /// Append the little-endian encoding of `self`.
    fn put_le(self, out: &mut Vec<u8>);

    /// The smallest representable value strictly greater than `self`
    /// (saturating at the type's maximum).
    fn successor(self) -> Self;

    /// A value `m` with `lo <= m < hi` splitting `[lo, hi]` into
    /// `[lo, m]` and `[successor(m), hi]`, biased toward `lo`. `None` when
    /// the interval cannot be split.
    fn split_point(lo: Self, hi: Self) -> Option<Self>;

    /// Index of `self` within the tile starting at `origin` with the given
    /// extent.
    fn tile_index(self, origin: Self, extent: Self) -> u64;

    /// Extent of the closed interval `[lo, hi]` as a real number: the cell
    /// count for integral types, the width for real ones.
    fn span_f64(lo: Self, hi: Self) -> f64;

    /// Exact cell count of `[lo, hi]`; `None` for real types, whose
    /// intervals hold no countable cells.
    fn cells_between(lo: Self, hi: Self) -> Option<u64> {
        let _ = (lo, hi);
        None
    }
}

/// Coordinate types over which dense arrays are defined.
///
/// Dense cell arithmetic requires exact successor/offset computations, so
/// only the integral coordinate types qualify.
pub trait DenseCoord: CoordType + Eq + Ord + std::hash::Hash {
    /// Zero-based offset of `self` from `origin`; requires `origin <= self`.
    fn index_from(self, origin: Self) -> u64;

    /// The coordinate `n` cells above `origin`.
    fn offset_by(origin: Self, n: u64) -> Self;

    /// A (positive) tile extent expressed as a cell count.
    fn extent_cells(self) -> u64;
}

macro_rules! integral_coord {
    ($t:ty, $u:ty, $dt:ident) => {
        impl private::Sealed for $t {}

        impl CoordType for $t {
            const DATATYPE: Datatype = Datatype::$dt;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().tessera_expect("coordinate width"))
            }

            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn successor(self) -> Self {
                self.saturating_add(1)
            }

            fn split_point(lo: Self, hi: Self) -> Option<Self> {
                (lo < hi).then(|| {
                    let half = (hi as $u).wrapping_sub(lo as $u) / 2;
                    lo.wrapping_add(half as $t)
                })
            }

            fn tile_index(self, origin: Self, extent: Self) -> u64 {
                self.index_from(origin) / extent.extent_cells()
            }

            fn span_f64(lo: Self, hi: Self) -> f64 {
                ((hi as $u).wrapping_sub(lo as $u) as u64 as f64) + 1.0
            }

            fn cells_between(lo: Self, hi: Self) -> Option<u64> {
                Some(hi.index_from(lo) + 1)
            }
        }

        impl DenseCoord for $t {
            fn index_from(self, origin: Self) -> u64 {
                (self as $u).wrapping_sub(origin as $u) as u64
            }

            fn offset_by(origin: Self, n: u64) -> Self {
                (origin as $u).wrapping_add(n as $u) as $t
            }

            fn extent_cells(self) -> u64 {
                debug_assert!(self > 0 as $t);
                self as $u as u64
            }
        }
    };
}

integral_coord!(i8, u8, Int8);
integral_coord!(u8, u8, UInt8);
integral_coord!(i16, u16, Int16);
integral_coord!(u16, u16, UInt16);
integral_coord!(i32, u32, Int32);
integral_coord!(u32, u32, UInt32);
integral_coord!(i64, u64, Int64);
integral_coord!(u64, u64, UInt64);

macro_rules! real_coord {
    ($t:ty, $dt:ident) => {
        impl private::Sealed for $t {}

        impl CoordType for $t {
            const DATATYPE: Datatype = Datatype::$dt;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().tessera_expect("coordinate width"))
            }

            fn put_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn successor(self) -> Self {
                <$t>::next_up(self)
            }

            fn split_point(lo: Self, hi: Self) -> Option<Self> {
                if !(lo < hi) {
                    return None;
                }
                let mid = lo + (hi - lo) / 2.0;
                Some(if mid < lo || mid >= hi { lo } else { mid })
            }

            fn tile_index(self, origin: Self, extent: Self) -> u64 {
                ((self - origin) / extent).floor() as u64
            }

            fn span_f64(lo: Self, hi: Self) -> f64 {
                ((hi - lo) as f64).max(0.0)
            }
        }
    };
}

real_coord!(f32, Float32);
real_coord!(f64, Float64);

/// Dispatch a [`Datatype`] to a generic body, binding the matching
/// [`CoordType`].
///
/// ```ignore
/// match_each_coord_type!(datatype, |$T| {
///     process::<$T>(args)
/// })
/// ```
///
/// Callers must have validated the datatype as a coordinate type; `Char`
/// is unreachable here because schemas reject it for dimensions.
#[macro_export]
macro_rules! match_each_coord_type {
    ($dt:expr, | $_:tt $t:ident | $($body:tt)*) => {{
        macro_rules! __with__ {( $_ $t:ident ) => ( $($body)* )}
        match $dt {
            $crate::Datatype::Int8 => __with__! { i8 },
            $crate::Datatype::UInt8 => __with__! { u8 },
            $crate::Datatype::Int16 => __with__! { i16 },
            $crate::Datatype::UInt16 => __with__! { u16 },
            $crate::Datatype::Int32 => __with__! { i32 },
            $crate::Datatype::UInt32 => __with__! { u32 },
            $crate::Datatype::Int64 => __with__! { i64 },
            $crate::Datatype::UInt64 => __with__! { u64 },
            $crate::Datatype::Float32 => __with__! { f32 },
            $crate::Datatype::Float64 => __with__! { f64 },
            $crate::Datatype::Char => unreachable!("char dimensions are rejected at schema build"),
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_point_biases_low() {
        assert_eq!(i32::split_point(1, 4), Some(2));
        assert_eq!(i32::split_point(1, 2), Some(1));
        assert_eq!(i32::split_point(3, 3), None);
        assert_eq!(u8::split_point(0, u8::MAX), Some(127));
        assert_eq!(i64::split_point(i64::MIN, i64::MAX), Some(-1));
    }

    #[test]
    fn real_split_point_stays_inside() {
        let mid = f64::split_point(0.0, 1.0).unwrap();
        assert!((0.0..1.0).contains(&mid));
        assert!(f64::split_point(2.5, 2.5).is_none());
        // Adjacent floats collapse onto the lower bound.
        let lo = 1.0f64;
        let hi = lo.next_up();
        assert_eq!(f64::split_point(lo, hi), Some(lo));
    }

    #[test]
    fn index_round_trips() {
        assert_eq!((-3i16).index_from(-5), 2);
        assert_eq!(i16::offset_by(-5, 2), -3);
        assert_eq!(u64::MAX.index_from(0), u64::MAX);
    }

    #[test]
    fn tile_index_floors() {
        assert_eq!(5i32.tile_index(1, 2), 2);
        assert_eq!(2.5f64.tile_index(0.0, 1.0), 2);
    }

    #[test]
    fn dispatch_reaches_every_width() {
        let width = match_each_coord_type!(Datatype::UInt16, |$T| <$T as CoordType>::SIZE);
        assert_eq!(width, 2);
    }
}
