use std::fmt;
use std::marker::PhantomData;

/// Type-level marker for the buffer coordinate space.
///
/// Source crops are expressed in this space, relative to the pixel
/// contents of the client buffer.
#[derive(Debug)]
pub struct Buffer;

/// Type-level marker for the physical coordinate space.
///
/// Destination frames and display bounds are expressed in this space,
/// in pixels of the active display mode.
#[derive(Debug)]
pub struct Physical;

/// Trait for types serving as a coordinate for the geometry utils.
pub trait Coordinate:
    Sized
    + std::ops::Add<Self, Output = Self>
    + std::ops::Sub<Self, Output = Self>
    + PartialOrd
    + Default
    + Copy
    + fmt::Debug
{
    /// A Coordinate that is 0
    const ZERO: Self;
    /// Convert the coordinate to a f64
    fn to_f64(self) -> f64;
    /// Convert to this coordinate from a f64
    fn from_f64(v: f64) -> Self;
    /// Compare and return the smaller one
    fn min(self, other: Self) -> Self {
        if self < other {
            self
        } else {
            other
        }
    }
    /// Compare and return the larger one
    fn max(self, other: Self) -> Self {
        if self > other {
            self
        } else {
            other
        }
    }
}

macro_rules! coordinate_impl {
    ($($ty:ty),*) => {
        $(
            impl Coordinate for $ty {
                const ZERO: $ty = 0 as $ty;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(v: f64) -> Self {
                    v as Self
                }
            }
        )*
    };
}

coordinate_impl!(i32, u32, u64, f64);

/// A point in a coordinate space `Kind`.
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

/// A two-dimensional extent in a coordinate space `Kind`.
pub struct Size<N, Kind> {
    /// width
    pub w: N,
    /// height
    pub h: N,
    _kind: PhantomData<Kind>,
}

/// An axis-aligned rectangle in a coordinate space `Kind`.
pub struct Rectangle<N, Kind> {
    /// Location of the top-left corner
    pub loc: Point<N, Kind>,
    /// Extent of the rectangle
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Point<N, Kind> {
    /// Convert this point to f64 coordinates
    #[inline]
    pub fn to_f64(self) -> Point<f64, Kind> {
        Point {
            x: self.x.to_f64(),
            y: self.y.to_f64(),
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Whether either dimension is zero or negative
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w <= N::ZERO || self.h <= N::ZERO
    }

    /// Convert this size to f64 coordinates
    #[inline]
    pub fn to_f64(self) -> Size<f64, Kind> {
        Size {
            w: self.w.to_f64(),
            h: self.h.to_f64(),
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// Create a rectangle from a location and a size
    #[inline]
    pub fn from_loc_and_size(loc: impl Into<Point<N, Kind>>, size: impl Into<Size<N, Kind>>) -> Self {
        Rectangle {
            loc: loc.into(),
            size: size.into(),
        }
    }

    /// Create a rectangle from the coordinates of its top-left and bottom-right corners
    pub fn from_extremities(
        topleft: impl Into<Point<N, Kind>>,
        bottomright: impl Into<Point<N, Kind>>,
    ) -> Self {
        let topleft = topleft.into();
        let bottomright = bottomright.into();
        Rectangle {
            size: Size {
                w: bottomright.x - topleft.x,
                h: bottomright.y - topleft.y,
                _kind: PhantomData,
            },
            loc: topleft,
        }
    }

    /// A rectangle of zero location and extent
    #[inline]
    pub fn zero() -> Self {
        Rectangle {
            loc: Point::default(),
            size: Size::default(),
        }
    }

    /// Whether this rectangle has a zero or negative extent
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    /// Checks whether a given point is inside the rectangle
    pub fn contains(self, point: impl Into<Point<N, Kind>>) -> bool {
        let p = point.into();
        (p.x >= self.loc.x)
            && (p.x < self.loc.x + self.size.w)
            && (p.y >= self.loc.y)
            && (p.y < self.loc.y + self.size.h)
    }

    /// Checks whether a given rectangle is fully inside this one
    pub fn contains_rect(self, rect: impl Into<Rectangle<N, Kind>>) -> bool {
        let r = rect.into();
        !r.is_empty()
            && r.loc.x >= self.loc.x
            && r.loc.y >= self.loc.y
            && r.loc.x + r.size.w <= self.loc.x + self.size.w
            && r.loc.y + r.size.h <= self.loc.y + self.size.h
    }

    /// Checks whether this rectangle overlaps another one
    pub fn overlaps(self, other: impl Into<Rectangle<N, Kind>>) -> bool {
        let other = other.into();
        self.loc.x < other.loc.x + other.size.w
            && other.loc.x < self.loc.x + self.size.w
            && self.loc.y < other.loc.y + other.size.h
            && other.loc.y < self.loc.y + self.size.h
    }

    /// Computes the intersection of this rectangle and another one, if any
    pub fn intersection(self, other: impl Into<Rectangle<N, Kind>>) -> Option<Self> {
        let other = other.into();
        if !self.overlaps(other) {
            return None;
        }
        Some(Rectangle::from_extremities(
            (self.loc.x.max(other.loc.x), self.loc.y.max(other.loc.y)),
            (
                (self.loc.x + self.size.w).min(other.loc.x + other.size.w),
                (self.loc.y + self.size.h).min(other.loc.y + other.size.h),
            ),
        ))
    }

    /// Convert this rectangle to f64 coordinates
    #[inline]
    pub fn to_f64(self) -> Rectangle<f64, Kind> {
        Rectangle {
            loc: self.loc.to_f64(),
            size: self.size.to_f64(),
        }
    }
}

impl<N: Copy, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Self {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Self {
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

macro_rules! forward_impls {
    ($ty:ident; $($field:ident),+) => {
        impl<N: fmt::Debug, Kind> fmt::Debug for $ty<N, Kind> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))+
                    .finish()
            }
        }

        impl<N: Clone, Kind> Clone for $ty<N, Kind> {
            #[inline]
            fn clone(&self) -> Self {
                $ty {
                    $($field: self.$field.clone(),)+
                    _kind: PhantomData,
                }
            }
        }

        impl<N: Copy, Kind> Copy for $ty<N, Kind> {}

        impl<N: PartialEq, Kind> PartialEq for $ty<N, Kind> {
            #[inline]
            fn eq(&self, other: &Self) -> bool {
                $(self.$field == other.$field)&&+
            }
        }

        impl<N: Eq, Kind> Eq for $ty<N, Kind> {}

        impl<N: Default, Kind> Default for $ty<N, Kind> {
            #[inline]
            fn default() -> Self {
                $ty {
                    $($field: N::default(),)+
                    _kind: PhantomData,
                }
            }
        }
    };
}

forward_impls!(Point; x, y);
forward_impls!(Size; w, h);

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rectangle")
            .field("x", &self.loc.x)
            .field("y", &self.loc.y)
            .field("w", &self.size.w)
            .field("h", &self.size.h)
            .finish()
    }
}

impl<N: Clone, Kind> Clone for Rectangle<N, Kind> {
    #[inline]
    fn clone(&self) -> Self {
        Rectangle {
            loc: self.loc.clone(),
            size: self.size.clone(),
        }
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}

impl<N: Default, Kind> Default for Rectangle<N, Kind> {
    #[inline]
    fn default() -> Self {
        Rectangle {
            loc: Point::default(),
            size: Size::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_contains_itself() {
        let rect: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((10, 20), (30, 40));
        assert!(rect.contains_rect(rect));
    }

    #[test]
    fn touching_rectangles_do_not_overlap() {
        let a: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((0, 0), (10, 10));
        let b: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((10, 0), (10, 10));
        assert!(!a.overlaps(b));
        assert!(a.intersection(b).is_none());
    }

    #[test]
    fn intersection_is_clipped() {
        let a: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((0, 0), (10, 10));
        let b: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((5, 5), (10, 10));
        assert_eq!(
            a.intersection(b),
            Some(Rectangle::from_loc_and_size((5, 5), (5, 5)))
        );
    }

    #[test]
    fn empty_rectangle_is_contained_nowhere() {
        let bounds: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((0, 0), (100, 100));
        let empty: Rectangle<i32, Physical> = Rectangle::from_loc_and_size((10, 10), (0, 0));
        assert!(!bounds.contains_rect(empty));
    }
}
