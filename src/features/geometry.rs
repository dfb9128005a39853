//! Coordinate spaces of the field editor and the transforms between them.
//!
//! * Pointer space: CSS pixels relative to the page surface's on-screen box.
//! * Backing-store space: pixels of the surface bitmap.
//! * PDF space: points on the page viewport at scale 1, top-left origin.
//!   This is the only space stored on a field.
//!
//! Every transform is derived from a [`SurfaceMetrics`] measured for the
//! event at hand. Nothing here caches a projection across events.

use serde::{Deserialize, Serialize};

/// Size of a freshly placed field, in screen pixels at the moment of placement.
pub const DEFAULT_FIELD_SCREEN_WIDTH: f64 = 150.0;
pub const DEFAULT_FIELD_SCREEN_HEIGHT: f64 = 60.0;

/// Resize floor, in stored (PDF point) units.
pub const MIN_FIELD_WIDTH: f64 = 50.0;
pub const MIN_FIELD_HEIGHT: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackingPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdfPoint {
    pub x: f64,
    pub y: f64,
}

impl PointerPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl PdfPoint {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Field rectangle in PDF points, top-left origin, y grows downward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdfRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl PdfRect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn centered_on(center: PdfPoint, width: f64, height: f64) -> Self {
        Self::new(center.x - width / 2.0, center.y - height / 2.0, width, height)
    }

    pub fn center(&self) -> PdfPoint {
        PdfPoint::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// On-screen projection of a field, in pointer-space pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl ScreenRect {
    pub fn center(&self) -> PointerPoint {
        PointerPoint::new(self.left + self.width / 2.0, self.top + self.height / 2.0)
    }
}

/// Measurements of one page surface, taken when an event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfaceMetrics {
    /// On-screen bounding box of the surface, CSS pixels.
    pub bbox_width: f64,
    pub bbox_height: f64,
    /// Pixel buffer of the surface.
    pub backing_width: u32,
    pub backing_height: u32,
    pub device_pixel_ratio: f64,
    pub scale: f64,
}

impl SurfaceMetrics {
    /// `None` while the surface is not laid out (any zero or non-finite
    /// dimension). Callers skip the event and wait for the next pass.
    pub fn projection(&self) -> Option<Projection> {
        let usable = |v: f64| v.is_finite() && v > 0.0;
        let cw = f64::from(self.backing_width);
        let ch = f64::from(self.backing_height);
        if !(usable(self.bbox_width)
            && usable(self.bbox_height)
            && usable(cw)
            && usable(ch)
            && usable(self.device_pixel_ratio)
            && usable(self.scale))
        {
            return None;
        }
        Some(Projection {
            backing_per_pointer_x: cw / self.bbox_width,
            backing_per_pointer_y: ch / self.bbox_height,
            points_per_backing: 1.0 / (self.device_pixel_ratio * self.scale),
        })
    }
}

/// Transform pair for one surface measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    backing_per_pointer_x: f64,
    backing_per_pointer_y: f64,
    points_per_backing: f64,
}

impl Projection {
    /// Screen pixels per PDF point along x and y.
    pub fn screen_per_point(&self) -> (f64, f64) {
        (
            1.0 / (self.backing_per_pointer_x * self.points_per_backing),
            1.0 / (self.backing_per_pointer_y * self.points_per_backing),
        )
    }

    pub fn pointer_to_backing(&self, p: PointerPoint) -> BackingPoint {
        BackingPoint {
            x: p.x * self.backing_per_pointer_x,
            y: p.y * self.backing_per_pointer_y,
        }
    }

    pub fn backing_to_pdf(&self, b: BackingPoint) -> PdfPoint {
        PdfPoint::new(b.x * self.points_per_backing, b.y * self.points_per_backing)
    }

    /// Forward transform used at placement time.
    pub fn pointer_to_pdf(&self, p: PointerPoint) -> PdfPoint {
        self.backing_to_pdf(self.pointer_to_backing(p))
    }

    /// Reverse transform used for every render of an existing field.
    pub fn pdf_to_pointer(&self, p: PdfPoint) -> PointerPoint {
        let (sx, sy) = self.screen_per_point();
        PointerPoint::new(p.x * sx, p.y * sy)
    }

    pub fn rect_to_screen(&self, r: &PdfRect) -> ScreenRect {
        let (sx, sy) = self.screen_per_point();
        ScreenRect {
            left: r.x * sx,
            top: r.y * sy,
            width: r.width * sx,
            height: r.height * sy,
        }
    }

    pub fn screen_delta_to_pdf(&self, dx: f64, dy: f64) -> (f64, f64) {
        let (sx, sy) = self.screen_per_point();
        (dx / sx, dy / sy)
    }

    /// Default field rectangle centered on a placement click.
    pub fn placement_rect(&self, click: PointerPoint) -> PdfRect {
        let (w, h) = self.screen_delta_to_pdf(DEFAULT_FIELD_SCREEN_WIDTH, DEFAULT_FIELD_SCREEN_HEIGHT);
        PdfRect::centered_on(self.pointer_to_pdf(click), w, h)
    }
}

/// Corner handle held during a resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "top_left" | "tl" => Some(Corner::TopLeft),
            "top_right" | "tr" => Some(Corner::TopRight),
            "bottom_left" | "bl" => Some(Corner::BottomLeft),
            "bottom_right" | "br" => Some(Corner::BottomRight),
            _ => None,
        }
    }

    fn is_left(self) -> bool {
        matches!(self, Corner::TopLeft | Corner::BottomLeft)
    }

    fn is_top(self) -> bool {
        matches!(self, Corner::TopLeft | Corner::TopRight)
    }
}

/// New origin for a dragged field. `grab_offset` is the pointer-to-field-origin
/// offset captured at pointer-down, in screen pixels.
pub fn dragged_origin(projection: &Projection, pointer: PointerPoint, grab_offset: (f64, f64)) -> PdfPoint {
    let (sx, sy) = projection.screen_per_point();
    PdfPoint::new(
        ((pointer.x - grab_offset.0) / sx).max(0.0),
        ((pointer.y - grab_offset.1) / sy).max(0.0),
    )
}

/// Rectangle after moving `corner` from `start_pointer` to `pointer`.
/// The origin stays put; only the size changes, floored at the minimum.
pub fn resized_rect(
    projection: &Projection,
    start: &PdfRect,
    corner: Corner,
    start_pointer: PointerPoint,
    pointer: PointerPoint,
) -> PdfRect {
    let (dx, dy) = projection.screen_delta_to_pdf(pointer.x - start_pointer.x, pointer.y - start_pointer.y);
    let width = if corner.is_left() { start.width - dx } else { start.width + dx };
    let height = if corner.is_top() { start.height - dy } else { start.height + dy };
    PdfRect::new(
        start.x,
        start.y,
        width.max(MIN_FIELD_WIDTH),
        height.max(MIN_FIELD_HEIGHT),
    )
}

/// Clockwise display rotation of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageRotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl PageRotation {
    pub fn from_degrees(raw: i64) -> Self {
        match raw.rem_euclid(360) {
            90 => PageRotation::Deg90,
            180 => PageRotation::Deg180,
            270 => PageRotation::Deg270,
            _ => PageRotation::Deg0,
        }
    }
}

/// Media box plus rotation of one page: enough to map between the top-left
/// viewport the editor works in and PDF user space (bottom-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageFrame {
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: PageRotation,
}

impl PageFrame {
    pub fn from_media_box(llx: f64, lly: f64, urx: f64, ury: f64, rotation: PageRotation) -> Self {
        Self {
            origin_x: llx.min(urx),
            origin_y: lly.min(ury),
            width: (urx - llx).abs(),
            height: (ury - lly).abs(),
            rotation,
        }
    }

    /// Width and height of the page as displayed at scale 1.
    pub fn viewport_size(&self) -> (f64, f64) {
        match self.rotation {
            PageRotation::Deg90 | PageRotation::Deg270 => (self.height, self.width),
            PageRotation::Deg0 | PageRotation::Deg180 => (self.width, self.height),
        }
    }

    /// Viewport point (top-left origin) to PDF user space (bottom-left origin).
    pub fn viewport_to_user(&self, p: PdfPoint) -> (f64, f64) {
        let (u, v) = (p.x, p.y);
        let (x, y) = match self.rotation {
            PageRotation::Deg0 => (u, self.height - v),
            PageRotation::Deg90 => (v, u),
            PageRotation::Deg180 => (self.width - u, v),
            PageRotation::Deg270 => (self.width - v, self.height - u),
        };
        (self.origin_x + x, self.origin_y + y)
    }

    /// Affine matrix `[a b c d e f]` mapping the unit square onto `rect` so an
    /// image drawn with it appears upright in the viewport.
    pub fn placement_matrix(&self, rect: &PdfRect) -> [f64; 6] {
        let p0 = self.viewport_to_user(PdfPoint::new(rect.x, rect.y + rect.height));
        let p1 = self.viewport_to_user(PdfPoint::new(rect.x + rect.width, rect.y + rect.height));
        let p2 = self.viewport_to_user(PdfPoint::new(rect.x, rect.y));
        [
            p1.0 - p0.0,
            p1.1 - p0.1,
            p2.0 - p0.0,
            p2.1 - p0.1,
            p0.0,
            p0.1,
        ]
    }
}
