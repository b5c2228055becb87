//! Integer geometry shared by the calculator, the cache and the manager.
//!
//! All rectangles are half-open: `left..right` by `top..bottom`. Tile rectangles
//! live in *unrotated source-image space*; [`ExifOrientation`] converts between
//! that space and the display space the viewport reasons in.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// IntSize
// =============================================================================

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntSize {
    pub width: u32,
    pub height: u32,
}

impl IntSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels.
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size after decoding with the given sample size (rounded up).
    pub fn sampled(&self, sample_size: u32) -> IntSize {
        let s = sample_size.max(1);
        IntSize::new(self.width.div_ceil(s), self.height.div_ceil(s))
    }

    /// Swap width and height.
    pub const fn transposed(&self) -> IntSize {
        IntSize::new(self.height, self.width)
    }
}

impl fmt::Display for IntSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// =============================================================================
// IntRect
// =============================================================================

/// Axis-aligned integer rectangle, right and bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl IntRect {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle covering `(0, 0)` to `size`.
    pub const fn from_size(size: IntSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub const fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub const fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub const fn size(&self) -> IntSize {
        IntSize::new(self.width(), self.height())
    }

    pub const fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }

    pub const fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// True when the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &IntRect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// Overlapping region, or `None` when disjoint.
    pub fn intersection(&self, other: &IntRect) -> Option<IntRect> {
        let rect = IntRect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        (!rect.is_empty()).then_some(rect)
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &IntRect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }

    /// Grow every edge by `margin`, clamped to `bounds`.
    pub fn expanded_within(&self, margin: u32, bounds: IntSize) -> IntRect {
        IntRect::new(
            self.left.saturating_sub(margin),
            self.top.saturating_sub(margin),
            self.right.saturating_add(margin).min(bounds.width),
            self.bottom.saturating_add(margin).min(bounds.height),
        )
    }

    /// Clamp to `(0, 0)`..`bounds`.
    pub fn clamped(&self, bounds: IntSize) -> IntRect {
        IntRect::new(
            self.left.min(bounds.width),
            self.top.min(bounds.height),
            self.right.min(bounds.width),
            self.bottom.min(bounds.height),
        )
    }
}

impl fmt::Display for IntRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{} - {},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

// =============================================================================
// ExifOrientation
// =============================================================================

/// Stored rotation/flip metadata.
///
/// Discriminants follow the EXIF `Orientation` tag (1..=8). The transform
/// describes how source pixels must be moved to appear upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExifOrientation {
    #[default]
    Normal = 1,
    FlipHorizontal = 2,
    Rotate180 = 3,
    FlipVertical = 4,
    Transpose = 5,
    Rotate90 = 6,
    Transverse = 7,
    Rotate270 = 8,
}

impl ExifOrientation {
    /// All eight orientations (four rotations, with and without a flip).
    pub const ALL: [ExifOrientation; 8] = [
        ExifOrientation::Normal,
        ExifOrientation::FlipHorizontal,
        ExifOrientation::Rotate180,
        ExifOrientation::FlipVertical,
        ExifOrientation::Transpose,
        ExifOrientation::Rotate90,
        ExifOrientation::Transverse,
        ExifOrientation::Rotate270,
    ];

    /// Parse an EXIF tag value. Unknown values map to `None`.
    pub fn from_exif(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|o| *o as u16 == value)
    }

    pub const fn to_exif(self) -> u16 {
        self as u16
    }

    /// True when display width/height are the source height/width.
    pub const fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            ExifOrientation::Transpose
                | ExifOrientation::Rotate90
                | ExifOrientation::Transverse
                | ExifOrientation::Rotate270
        )
    }

    /// Size of the image once the orientation is applied.
    pub const fn display_size(self, source: IntSize) -> IntSize {
        if self.swaps_dimensions() {
            source.transposed()
        } else {
            source
        }
    }

    /// Map a source-space rectangle to display space.
    ///
    /// `source` is the unrotated image size.
    pub fn source_to_display(self, rect: IntRect, source: IntSize) -> IntRect {
        let (w, h) = (source.width, source.height);
        let (l, t, r, b) = (rect.left, rect.top, rect.right, rect.bottom);
        match self {
            ExifOrientation::Normal => rect,
            ExifOrientation::FlipHorizontal => IntRect::new(w - r, t, w - l, b),
            ExifOrientation::Rotate180 => IntRect::new(w - r, h - b, w - l, h - t),
            ExifOrientation::FlipVertical => IntRect::new(l, h - b, r, h - t),
            ExifOrientation::Transpose => IntRect::new(t, l, b, r),
            ExifOrientation::Rotate90 => IntRect::new(h - b, l, h - t, r),
            ExifOrientation::Transverse => IntRect::new(h - b, w - r, h - t, w - l),
            ExifOrientation::Rotate270 => IntRect::new(t, w - r, b, w - l),
        }
    }

    /// Map a display-space rectangle back to source space.
    ///
    /// `source` is the unrotated image size; `rect` must lie within
    /// [`display_size`](Self::display_size).
    pub fn display_to_source(self, rect: IntRect, source: IntSize) -> IntRect {
        let (w, h) = (source.width, source.height);
        let (l, t, r, b) = (rect.left, rect.top, rect.right, rect.bottom);
        match self {
            ExifOrientation::Normal => rect,
            ExifOrientation::FlipHorizontal => IntRect::new(w - r, t, w - l, b),
            ExifOrientation::Rotate180 => IntRect::new(w - r, h - b, w - l, h - t),
            ExifOrientation::FlipVertical => IntRect::new(l, h - b, r, h - t),
            ExifOrientation::Transpose => IntRect::new(t, l, b, r),
            ExifOrientation::Rotate90 => IntRect::new(t, h - r, b, h - l),
            ExifOrientation::Transverse => IntRect::new(w - b, h - r, w - t, h - l),
            ExifOrientation::Rotate270 => IntRect::new(w - b, l, w - t, r),
        }
    }
}
