use crate::error::SignatureError;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut, draw_polygon_mut};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use uuid::Uuid;

const INK: Rgba<u8> = Rgba([20, 24, 48, 255]);
const MAX_TRACE_SIDE: u32 = 2048;
const DEFAULT_STROKE_WIDTH: f32 = 3.0;

/// Light pixels at or above this mean brightness become transparent.
const PAPER_BRIGHTNESS: u32 = 200;
/// Low-saturation pixels at or above this brightness are treated as paper shadow.
const SHADOW_BRIGHTNESS: u32 = 150;
const SHADOW_MAX_CHROMA: u8 = 24;
const INK_DARKEN: f32 = 0.6;

/// Standard-14 faces a typed signature can use, so nothing needs embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureFont {
    Helvetica,
    HelveticaOblique,
    #[default]
    TimesItalic,
    Courier,
}

impl SignatureFont {
    /// Unknown identifiers (decorative script faces the shell may offer) fall
    /// back to the italic serif.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "helvetica" | "sans" | "sans_serif" => SignatureFont::Helvetica,
            "helvetica_oblique" | "sans_italic" => SignatureFont::HelveticaOblique,
            "courier" | "mono" | "monospace" => SignatureFont::Courier,
            _ => SignatureFont::TimesItalic,
        }
    }

    pub fn base_font(self) -> &'static str {
        match self {
            SignatureFont::Helvetica => "Helvetica",
            SignatureFont::HelveticaOblique => "Helvetica-Oblique",
            SignatureFont::TimesItalic => "Times-Italic",
            SignatureFont::Courier => "Courier",
        }
    }

    /// Average advance width as a fraction of the font size, used to cap the
    /// size of typed signatures so they fit their field.
    pub fn average_advance(self) -> f64 {
        match self {
            SignatureFont::Courier => 0.6,
            SignatureFont::TimesItalic => 0.45,
            SignatureFont::Helvetica | SignatureFont::HelveticaOblique => 0.52,
        }
    }
}

/// What gets burned into a field. Immutable once built; fields hold a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignaturePayload {
    /// Freehand trace rendered to a transparent PNG.
    Draw {
        #[serde(with = "b64_bytes")]
        png: Vec<u8>,
        label: String,
    },
    /// Literal text drawn with a standard font at burn-in.
    Type {
        text: String,
        font: SignatureFont,
        label: String,
    },
    /// Uploaded image after background stripping, as PNG.
    Image {
        #[serde(with = "b64_bytes")]
        png: Vec<u8>,
        label: String,
    },
}

impl SignaturePayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SignaturePayload::Draw { .. } => "draw",
            SignaturePayload::Type { .. } => "type",
            SignaturePayload::Image { .. } => "image",
        }
    }

    pub fn label(&self) -> &str {
        match self {
            SignaturePayload::Draw { label, .. }
            | SignaturePayload::Type { label, .. }
            | SignaturePayload::Image { label, .. } => label,
        }
    }

    /// Accepts a trace the shell already rasterized (any decodable format).
    pub fn draw_from_image_bytes(bytes: &[u8], label: &str) -> Result<Self, SignatureError> {
        let img = decode_rgba(bytes)?;
        Ok(SignaturePayload::Draw {
            png: encode_png(&img)?,
            label: label_or(label, "Drawn signature"),
        })
    }

    /// Rasterizes pointer strokes, each a polyline in pad pixels.
    pub fn draw_from_strokes(
        strokes: &[Vec<(f64, f64)>],
        width: u32,
        height: u32,
        label: &str,
    ) -> Result<Self, SignatureError> {
        let img = rasterize_strokes(strokes, width, height, DEFAULT_STROKE_WIDTH)?;
        Ok(SignaturePayload::Draw {
            png: encode_png(&img)?,
            label: label_or(label, "Drawn signature"),
        })
    }

    pub fn typed(text: &str, font: SignatureFont, label: &str) -> Result<Self, SignatureError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SignatureError::EmptyText);
        }
        Ok(SignaturePayload::Type {
            text: text.to_string(),
            font,
            label: label_or(label, text),
        })
    }

    pub fn image_from_upload(bytes: &[u8], label: &str) -> Result<Self, SignatureError> {
        let img = decode_rgba(bytes)?;
        let cleaned = strip_background(&img);
        Ok(SignaturePayload::Image {
            png: encode_png(&cleaned)?,
            label: label_or(label, "Uploaded signature"),
        })
    }
}

fn label_or(label: &str, fallback: &str) -> String {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, SignatureError> {
    let raw = data
        .split_once(";base64,")
        .map(|(_, rest)| rest)
        .unwrap_or(data);
    B64.decode(raw.trim().as_bytes())
        .map_err(|e| SignatureError::Decode(e.to_string()))
}

fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, SignatureError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| SignatureError::Image(e.to_string()))
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, SignatureError> {
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
        .map_err(|e| SignatureError::Encode(e.to_string()))?;
    Ok(out)
}

/// Paper becomes transparent; ink gets darker.
pub fn strip_background(input: &RgbaImage) -> RgbaImage {
    let mut out = input.clone();
    for pixel in out.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        let brightness = (u32::from(r) + u32::from(g) + u32::from(b)) / 3;
        let chroma = r.max(g).max(b) - r.min(g).min(b);
        let is_paper = brightness >= PAPER_BRIGHTNESS
            || (brightness >= SHADOW_BRIGHTNESS && chroma <= SHADOW_MAX_CHROMA);
        *pixel = if is_paper {
            Rgba([r, g, b, 0])
        } else {
            let darken = |c: u8| (f32::from(c) * INK_DARKEN).round() as u8;
            Rgba([darken(r), darken(g), darken(b), a])
        };
    }
    out
}

fn rasterize_strokes(
    strokes: &[Vec<(f64, f64)>],
    width: u32,
    height: u32,
    stroke_width: f32,
) -> Result<RgbaImage, SignatureError> {
    if strokes.iter().all(|s| s.is_empty()) {
        return Err(SignatureError::EmptyTrace);
    }
    let width = width.clamp(1, MAX_TRACE_SIDE);
    let height = height.clamp(1, MAX_TRACE_SIDE);
    let mut img = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    let radius = (stroke_width / 2.0).max(0.5);

    for stroke in strokes {
        let points: Vec<(f32, f32)> = stroke.iter().map(|&(x, y)| (x as f32, y as f32)).collect();
        for pair in points.windows(2) {
            draw_thick_segment(&mut img, pair[0], pair[1], radius);
        }
        // Round caps and joints.
        for &(x, y) in &points {
            let center = (x.round() as i32, y.round() as i32);
            draw_filled_circle_mut(&mut img, center, radius.round() as i32, INK);
        }
    }
    Ok(img)
}

/// A segment `2 * radius` wide, drawn as a quad around the centerline.
fn draw_thick_segment(img: &mut RgbaImage, from: (f32, f32), to: (f32, f32), radius: f32) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let length = (dx * dx + dy * dy).sqrt();
    if length < 1.0 {
        return;
    }
    if radius <= 1.0 {
        draw_line_segment_mut(img, from, to, INK);
        return;
    }
    let (nx, ny) = (-dy / length * radius, dx / length * radius);
    let corner = |x: f32, y: f32| Point::new(x.round() as i32, y.round() as i32);
    let quad = [
        corner(from.0 + nx, from.1 + ny),
        corner(to.0 + nx, to.1 + ny),
        corner(to.0 - nx, to.1 - ny),
        corner(from.0 - nx, from.1 - ny),
    ];
    if quad[0] != quad[3] {
        draw_polygon_mut(img, &quad, INK);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSignature {
    pub id: Uuid,
    pub payload: SignaturePayload,
    pub created_at: DateTime<Utc>,
}

/// The user's saved signatures. Fields take copies, so removing or replacing
/// an entry here never touches fields already placed.
#[derive(Debug, Clone, Default)]
pub struct SignaturePalette {
    entries: Vec<SavedSignature>,
}

impl SignaturePalette {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, payload: SignaturePayload) -> Uuid {
        let id = Uuid::new_v4();
        self.entries.push(SavedSignature {
            id,
            payload,
            created_at: Utc::now(),
        });
        id
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn get(&self, id: Uuid) -> Option<&SavedSignature> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn copy_payload(&self, id: Uuid) -> Option<SignaturePayload> {
        self.get(id).map(|e| e.payload.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &SavedSignature> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

mod b64_bytes {
    use super::B64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        B64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, _| {
        if x % 2 == 0 {
            Rgba([10, 10, 10, 255])
        } else {
            Rgba([250, 250, 250, 255])
        }
    });
    encode_png(&img).expect("png encodes")
}
