//! Read-only viewport state consumed by the tile manager.
//!
//! The gesture/transform engine owns this state; the engine only reads it.
//! Sizes and rectangles here are in *display* space: `content_size` is the
//! on-screen size of the whole image at scale 1 (fitted into the container),
//! and `content_visible_rect` is the part of that content currently visible,
//! in unscaled content coordinates.

use serde::{Deserialize, Serialize};

use crate::config::GestureKind;

use super::geometry::{IntRect, IntSize};

/// Snapshot of the external viewport contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// User zoom on top of the fitted content size
    pub scale: f32,

    /// Zoom at or below which tiles are not worth decoding
    pub min_scale: f32,

    /// User rotation in degrees
    pub rotation_degrees: i32,

    /// Fitted size of the whole image at scale 1
    pub content_size: IntSize,

    /// Size of the viewport widget
    pub container_size: IntSize,

    /// Visible part of the content, unscaled content coordinates
    pub content_visible_rect: IntRect,

    /// Continuous gesture in progress, if any
    pub gesture: Option<GestureKind>,
}

impl Viewport {
    /// Viewport showing the whole image fitted into `container` at scale 1.
    pub fn fit(container: IntSize, image_display: IntSize) -> Self {
        let content = fit_content(image_display, container);
        Self {
            scale: 1.0,
            min_scale: 1.0,
            rotation_degrees: 0,
            content_size: content,
            container_size: container,
            content_visible_rect: IntRect::from_size(content),
            gesture: None,
        }
    }

    /// Same viewport zoomed to `scale`, keeping the visible rect centered on
    /// the content.
    pub fn zoomed(&self, scale: f32) -> Self {
        let center_x = self.content_size.width as f32 / 2.0;
        let center_y = self.content_size.height as f32 / 2.0;
        self.zoomed_at(scale, center_x, center_y)
    }

    /// Same viewport zoomed to `scale` around a content-space point.
    ///
    /// The visible rect is the container projected back into content space,
    /// shifted to stay inside the content.
    pub fn zoomed_at(&self, scale: f32, center_x: f32, center_y: f32) -> Self {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        let content = self.content_size;
        let visible_w = (self.container_size.width as f32 / scale).min(content.width as f32);
        let visible_h = (self.container_size.height as f32 / scale).min(content.height as f32);
        let left = (center_x - visible_w / 2.0).clamp(0.0, content.width as f32 - visible_w);
        let top = (center_y - visible_h / 2.0).clamp(0.0, content.height as f32 - visible_h);

        let rect = IntRect::new(
            left.floor() as u32,
            top.floor() as u32,
            (left + visible_w).ceil() as u32,
            (top + visible_h).ceil() as u32,
        )
        .clamped(content);

        Self {
            scale,
            content_visible_rect: rect,
            ..self.clone()
        }
    }

    pub fn with_gesture(mut self, gesture: Option<GestureKind>) -> Self {
        self.gesture = gesture;
        self
    }

    /// Whether tiles should be shown for this viewport at all.
    ///
    /// False at or below the minimum zoom, for non-right-angle rotations and
    /// for empty sizes or visible rects.
    pub fn wants_tiles(&self) -> bool {
        self.scale.is_finite()
            && self.scale > self.min_scale
            && self.rotation_degrees % 90 == 0
            && !self.content_size.is_empty()
            && !self.container_size.is_empty()
            && !self.content_visible_rect.clamped(self.content_size).is_empty()
    }

    /// Visible rect mapped into display-image pixels.
    pub fn visible_image_rect(&self, image_display: IntSize) -> IntRect {
        if self.content_size.is_empty() {
            return IntRect::default();
        }
        let visible = self.content_visible_rect.clamped(self.content_size);
        let sx = image_display.width as f64 / self.content_size.width as f64;
        let sy = image_display.height as f64 / self.content_size.height as f64;
        IntRect::new(
            (visible.left as f64 * sx).floor() as u32,
            (visible.top as f64 * sy).floor() as u32,
            (visible.right as f64 * sx).ceil() as u32,
            (visible.bottom as f64 * sy).ceil() as u32,
        )
        .clamped(image_display)
    }

    /// Whether only the container size differs from `other`.
    pub fn is_resize_of(&self, other: &Viewport) -> bool {
        self.container_size != other.container_size
            && Viewport {
                container_size: other.container_size,
                ..self.clone()
            } == *other
    }
}

/// Largest size with the image's aspect ratio that fits `container`.
pub fn fit_content(image: IntSize, container: IntSize) -> IntSize {
    if image.is_empty() || container.is_empty() {
        return IntSize::default();
    }
    let (iw, ih) = (image.width as u64, image.height as u64);
    let (cw, ch) = (container.width as u64, container.height as u64);
    // Integer cross-multiplication keeps the limiting edge exact
    if iw * ch >= cw * ih {
        IntSize::new(container.width, ((ih * cw / iw) as u32).max(1))
    } else {
        IntSize::new(((iw * ch / ih) as u32).max(1), container.height)
    }
}
