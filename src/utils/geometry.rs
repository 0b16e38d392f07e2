use std::fmt;
use std::marker::PhantomData;
use std::ops::Sub;

/// Marker for coordinates in the global compositor space
#[derive(Debug)]
pub struct Logical;

/// Marker for coordinates in pixels of a crtc or buffer
#[derive(Debug)]
pub struct Physical;

/// Numeric types usable as coordinates
pub trait Coordinate: Sized + Sub<Self, Output = Self> + PartialOrd + Default + Copy + fmt::Debug {
    /// The origin
    const ZERO: Self;
    /// Whether the value can describe an extent
    fn non_negative(self) -> bool;
}

impl Coordinate for u32 {
    const ZERO: u32 = 0;
    fn non_negative(self) -> bool {
        true
    }
}

impl Coordinate for i32 {
    const ZERO: i32 = 0;
    fn non_negative(self) -> bool {
        self >= 0
    }
}

/// A location, tagged with its coordinate space
pub struct Point<N, Kind> {
    /// horizontal coordinate
    pub x: N,
    /// vertical coordinate
    pub y: N,
    _kind: PhantomData<Kind>,
}

impl<N: fmt::Debug, Kind> fmt::Debug for Point<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?})", self.x, self.y)
    }
}

impl<N, Kind> From<(N, N)> for Point<N, Kind> {
    #[inline]
    fn from((x, y): (N, N)) -> Point<N, Kind> {
        Point {
            x,
            y,
            _kind: PhantomData,
        }
    }
}

impl<N: Coordinate, Kind> Sub for Point<N, Kind> {
    type Output = Point<N, Kind>;
    #[inline]
    fn sub(self, other: Point<N, Kind>) -> Point<N, Kind> {
        (self.x - other.x, self.y - other.y).into()
    }
}

impl<N: Copy, Kind> Clone for Point<N, Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Copy, Kind> Copy for Point<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Point<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl<N: Eq, Kind> Eq for Point<N, Kind> {}

impl<N: Default, Kind> Default for Point<N, Kind> {
    fn default() -> Self {
        (N::default(), N::default()).into()
    }
}

/// An extent, tagged with its coordinate space
///
/// Created through `From<(N, N)>`, which asserts in debug builds that neither side is
/// negative.
pub struct Size<N, Kind> {
    /// width
    pub w: N,
    /// height
    pub h: N,
    _kind: PhantomData<Kind>,
}

impl<N: Coordinate, Kind> Size<N, Kind> {
    /// Returns true if the width or the height is zero
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w == N::ZERO || self.h == N::ZERO
    }

    /// Whether `other` fits into this size on both axes
    #[inline]
    pub fn contains(&self, other: Size<N, Kind>) -> bool {
        other.w <= self.w && other.h <= self.h
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Size<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}x{:?}", self.w, self.h)
    }
}

impl<N: Coordinate, Kind> From<(N, N)> for Size<N, Kind> {
    #[inline]
    fn from((w, h): (N, N)) -> Size<N, Kind> {
        debug_assert!(w.non_negative() && h.non_negative(), "negative size {:?}x{:?}", w, h);
        Size {
            w,
            h,
            _kind: PhantomData,
        }
    }
}

impl<N: Copy, Kind> Clone for Size<N, Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Copy, Kind> Copy for Size<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Size<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.w == other.w && self.h == other.h
    }
}

impl<N: Eq, Kind> Eq for Size<N, Kind> {}

impl<N: Default, Kind> Default for Size<N, Kind> {
    fn default() -> Self {
        Size {
            w: N::default(),
            h: N::default(),
            _kind: PhantomData,
        }
    }
}

/// Top-left corner and extent of a plane source or destination
pub struct Rectangle<N, Kind> {
    /// Top-left corner
    pub loc: Point<N, Kind>,
    /// Extent
    pub size: Size<N, Kind>,
}

impl<N: Coordinate, Kind> Rectangle<N, Kind> {
    /// A rectangle at `loc`
    #[inline]
    pub fn new(loc: Point<N, Kind>, size: Size<N, Kind>) -> Self {
        Rectangle { loc, size }
    }

    /// A rectangle at the origin
    #[inline]
    pub fn from_size(size: Size<N, Kind>) -> Self {
        Rectangle::new((N::ZERO, N::ZERO).into(), size)
    }
}

impl<N: fmt::Debug, Kind> fmt::Debug for Rectangle<N, Kind> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}+{:?}", self.size, self.loc)
    }
}

impl<N: Copy, Kind> Clone for Rectangle<N, Kind> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N: Copy, Kind> Copy for Rectangle<N, Kind> {}

impl<N: PartialEq, Kind> PartialEq for Rectangle<N, Kind> {
    fn eq(&self, other: &Self) -> bool {
        self.loc == other.loc && self.size == other.size
    }
}

impl<N: Eq, Kind> Eq for Rectangle<N, Kind> {}

/// Rotation and reflection of an output, counter-clockwise
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub enum Transform {
    /// Unaltered
    #[default]
    Normal,
    /// Rotated by 90 degrees
    _90,
    /// Rotated by 180 degrees
    _180,
    /// Rotated by 270 degrees
    _270,
    /// Reflected
    Flipped,
    /// Reflected, then rotated by 90 degrees
    Flipped90,
    /// Reflected, then rotated by 180 degrees
    Flipped180,
    /// Reflected, then rotated by 270 degrees
    Flipped270,
}
