//! Page renderer: decodes a PDF, sizes one surface per page for a
//! `{scale, device_pixel_ratio}` request and rasterizes into it.
//!
//! A render session hands out monotonically increasing tokens. Every batch
//! carries the token it was started with and checks it before each page; a
//! batch that finishes after a newer one was started is discarded, never
//! applied.

use crate::error::RenderError;
use crate::features::geometry::{PageFrame, PageRotation, SurfaceMetrics};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use log::{debug, info, warn};
use lopdf::{Dictionary, Document, Object, ObjectId};
use pdfium_render::prelude::{PdfRenderConfig, Pdfium};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// A4 portrait, used when a page carries no usable MediaBox.
const FALLBACK_PAGE_SIZE: (f64, f64) = (595.0, 842.0);
/// Longest backing-store side any page may get. Requests are fitted to the
/// document so that no page exceeds it.
pub const MAX_BACKING_SIDE: f64 = 8192.0;
pub const MIN_SCALE: f64 = 0.1;
pub const MAX_SCALE: f64 = 8.0;
const PAPER: Rgba<u8> = Rgba([255, 255, 255, 255]);
const PAPER_EDGE: Rgba<u8> = Rgba([218, 220, 224, 255]);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderRequest {
    pub scale: f64,
    pub device_pixel_ratio: f64,
}

impl RenderRequest {
    /// Rejects non-finite or non-positive values. A usable scale is clamped
    /// into `MIN_SCALE..=MAX_SCALE`.
    pub fn new(scale: f64, device_pixel_ratio: f64) -> Result<Self, RenderError> {
        let usable = |v: f64| v.is_finite() && v > 0.0;
        if usable(scale) && usable(device_pixel_ratio) {
            Ok(Self {
                scale: scale.clamp(MIN_SCALE, MAX_SCALE),
                device_pixel_ratio,
            })
        } else {
            Err(RenderError::InvalidRequest)
        }
    }

    /// Lowers the scale until every page of `document` fits the backing-store
    /// limit. CSS and backing sizes keep following the same scale, so the
    /// pointer transform stays exact.
    pub fn fitted_to(self, document: &DecodedDocument) -> Self {
        let limit = document.max_scale(self.device_pixel_ratio);
        if self.scale <= limit {
            self
        } else {
            debug!("render: scale {} lowered to {limit} to fit the page limit", self.scale);
            Self {
                scale: limit,
                ..self
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    /// 1-based, as in the PDF page tree.
    pub page_number: u32,
    pub frame: PageFrame,
}

impl PageGeometry {
    /// Intrinsic size at scale 1, rotation applied.
    pub fn viewport_size(&self) -> (f64, f64) {
        self.frame.viewport_size()
    }

    pub fn css_size(&self, request: &RenderRequest) -> (f64, f64) {
        let (w, h) = self.viewport_size();
        (w * request.scale, h * request.scale)
    }

    pub fn backing_size(&self, request: &RenderRequest) -> (u32, u32) {
        let (w, h) = self.viewport_size();
        let factor = request.scale * request.device_pixel_ratio;
        ((w * factor).floor() as u32, (h * factor).floor() as u32)
    }
}

/// A parsed document and the geometry of each of its pages. The source bytes
/// are kept for rasterizers that parse the file themselves.
pub struct DecodedDocument {
    pub pages: Vec<PageGeometry>,
    bytes: Arc<[u8]>,
}

impl std::fmt::Debug for DecodedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedDocument")
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl DecodedDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, page_number: u32) -> Option<&PageGeometry> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Largest scale at which every page stays within `MAX_BACKING_SIDE`.
    pub fn max_scale(&self, device_pixel_ratio: f64) -> f64 {
        self.pages
            .iter()
            .map(|p| {
                let (w, h) = p.viewport_size();
                MAX_BACKING_SIDE / (w.max(h) * device_pixel_ratio)
            })
            .fold(f64::INFINITY, f64::min)
    }
}

pub fn decode_document(bytes: &[u8]) -> Result<DecodedDocument, RenderError> {
    let document = Document::load_mem(bytes).map_err(|e| RenderError::Decode(e.to_string()))?;
    let pages: Vec<PageGeometry> = document
        .get_pages()
        .into_iter()
        .map(|(page_number, page_id)| PageGeometry {
            page_number,
            frame: read_page_frame(&document, page_id),
        })
        .collect();
    if pages.is_empty() {
        return Err(RenderError::NoPages);
    }
    Ok(DecodedDocument {
        pages,
        bytes: Arc::from(bytes),
    })
}

/// MediaBox and Rotate of a page, following inheritance up the page tree.
pub fn read_page_frame(doc: &Document, page_id: ObjectId) -> PageFrame {
    let mut media_box: Option<[f64; 4]> = None;
    let mut rotate: Option<i64> = None;
    let mut current = Some(page_id);
    let mut hops = 0;
    while let Some(id) = current {
        let Ok(dict) = doc.get_object(id).and_then(|o| o.as_dict()) else {
            break;
        };
        if media_box.is_none() {
            media_box = extract_media_box(doc, dict);
        }
        if rotate.is_none() {
            rotate = dict.get(b"Rotate").ok().and_then(|o| resolve(doc, o).as_i64().ok());
        }
        if media_box.is_some() && rotate.is_some() {
            break;
        }
        hops += 1;
        if hops > 64 {
            break;
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok();
    }
    let rotation = PageRotation::from_degrees(rotate.unwrap_or(0));
    match media_box {
        Some([llx, lly, urx, ury]) if (urx - llx).abs() > 0.0 && (ury - lly).abs() > 0.0 => {
            PageFrame::from_media_box(llx, lly, urx, ury, rotation)
        }
        _ => PageFrame::from_media_box(0.0, 0.0, FALLBACK_PAGE_SIZE.0, FALLBACK_PAGE_SIZE.1, rotation),
    }
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

fn extract_media_box(doc: &Document, dict: &Dictionary) -> Option<[f64; 4]> {
    let raw = dict.get(b"MediaBox").ok()?;
    let arr = resolve(doc, raw).as_array().ok()?;
    if arr.len() != 4 {
        return None;
    }
    Some([
        obj_to_f64(resolve(doc, &arr[0]))?,
        obj_to_f64(resolve(doc, &arr[1]))?,
        obj_to_f64(resolve(doc, &arr[2]))?,
        obj_to_f64(resolve(doc, &arr[3]))?,
    ])
}

pub(crate) fn obj_to_f64(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some(f64::from(*f)),
        _ => None,
    }
}

/// One rendered page: a bitmap plus the coordinate frame it was drawn in.
#[derive(Debug, Clone)]
pub struct PageSurface {
    pub geometry: PageGeometry,
    pub request: RenderRequest,
    pub css_width: f64,
    pub css_height: f64,
    pub pixels: RgbaImage,
}

impl PageSurface {
    pub fn page_number(&self) -> u32 {
        self.geometry.page_number
    }

    pub fn backing_size(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Metrics for a pointer event, using the box the shell measured.
    /// Missing measurements fall back to the nominal CSS size.
    pub fn metrics(&self, bbox_width: Option<f64>, bbox_height: Option<f64>) -> SurfaceMetrics {
        let (backing_width, backing_height) = self.backing_size();
        SurfaceMetrics {
            bbox_width: bbox_width.unwrap_or(self.css_width),
            bbox_height: bbox_height.unwrap_or(self.css_height),
            backing_width,
            backing_height,
            device_pixel_ratio: self.request.device_pixel_ratio,
            scale: self.request.scale,
        }
    }

    pub fn to_png(&self) -> Result<Vec<u8>, RenderError> {
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(self.pixels.clone())
            .write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)
            .map_err(|e| RenderError::PageFailed {
                page: self.page_number(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

/// Draws one page into a bitmap already sized for the request.
pub trait PageRasterizer: Send + Sync {
    fn rasterize(
        &self,
        document: &DecodedDocument,
        page: &PageGeometry,
        request: &RenderRequest,
        target: &mut RgbaImage,
    ) -> Result<(), RenderError>;
}

/// Draws page content through PDFium.
pub struct PdfiumRasterizer {
    pdfium: Pdfium,
}

impl std::fmt::Debug for PdfiumRasterizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PdfiumRasterizer")
    }
}

impl PdfiumRasterizer {
    /// Binds a PDFium library from `dir` (or the working directory), then
    /// falls back to the system library.
    fn bind(dir: Option<&Path>) -> Result<Self, RenderError> {
        let dir = dir.unwrap_or_else(|| Path::new("./"));
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| RenderError::Rasterizer(format!("{e:?}")))?;
        Ok(Self {
            pdfium: Pdfium::new(bindings),
        })
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn rasterize(
        &self,
        document: &DecodedDocument,
        page: &PageGeometry,
        _request: &RenderRequest,
        target: &mut RgbaImage,
    ) -> Result<(), RenderError> {
        let failed = |reason: String| RenderError::PageFailed {
            page: page.page_number,
            reason,
        };
        let pdf = self
            .pdfium
            .load_pdf_from_byte_slice(document.bytes(), None)
            .map_err(|e| failed(format!("{e:?}")))?;
        let index = page.page_number.saturating_sub(1) as usize;
        let pdf_page = pdf
            .pages()
            .iter()
            .nth(index)
            .ok_or_else(|| failed("page_out_of_range".into()))?;

        let (w, h) = target.dimensions();
        let config = PdfRenderConfig::new()
            .set_target_width(w as i32)
            .set_target_height(h as i32)
            .render_form_data(true)
            .render_annotations(true);
        let bitmap = pdf_page
            .render_with_config(&config)
            .map_err(|e| failed(format!("{e:?}")))?;
        let rendered = bitmap.as_image().into_rgba8();
        *target = if rendered.dimensions() == (w, h) {
            rendered
        } else {
            imageops::resize(&rendered, w, h, FilterType::Triangle)
        };
        Ok(())
    }
}

static PDFIUM: OnceLock<Option<Arc<PdfiumRasterizer>>> = OnceLock::new();

/// The process-wide PDFium binding. The first call decides where the library
/// is looked up; later calls share its outcome.
pub fn pdfium_rasterizer(pdfium_dir: Option<&Path>) -> Option<Arc<PdfiumRasterizer>> {
    PDFIUM
        .get_or_init(|| match PdfiumRasterizer::bind(pdfium_dir) {
            Ok(pdfium) => {
                info!("render: pdfium bound");
                Some(Arc::new(pdfium))
            }
            Err(e) => {
                warn!("render: pdfium unavailable ({e}), pages render as blank paper");
                None
            }
        })
        .clone()
}

/// PDFium when it can be bound, blank paper otherwise.
pub fn default_rasterizer(pdfium_dir: Option<&Path>) -> Arc<dyn PageRasterizer> {
    match pdfium_rasterizer(pdfium_dir) {
        Some(pdfium) => pdfium as Arc<dyn PageRasterizer>,
        None => Arc::new(PaperRasterizer),
    }
}

/// Paints blank paper with a hairline edge. Used when PDFium is missing, and
/// by shells that draw page content themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct PaperRasterizer;

impl PageRasterizer for PaperRasterizer {
    fn rasterize(
        &self,
        _document: &DecodedDocument,
        _page: &PageGeometry,
        _request: &RenderRequest,
        target: &mut RgbaImage,
    ) -> Result<(), RenderError> {
        let (w, h) = target.dimensions();
        for (x, y, pixel) in target.enumerate_pixels_mut() {
            let edge = x == 0 || y == 0 || x + 1 == w || y + 1 == h;
            *pixel = if edge { PAPER_EDGE } else { PAPER };
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RenderToken(u64);

impl RenderToken {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Read side of the session's token counter, held by in-flight batches.
#[derive(Debug, Clone)]
pub struct TokenWatch(Arc<AtomicU64>);

impl TokenWatch {
    pub fn is_current(&self, token: RenderToken) -> bool {
        self.0.load(Ordering::SeqCst) == token.0
    }
}

/// Work for one render pass. For a load the document is decoded first.
pub struct RenderBatch {
    token: RenderToken,
    watch: TokenWatch,
    request: RenderRequest,
    source: BatchSource,
}

enum BatchSource {
    Decoded(Arc<DecodedDocument>),
    Bytes(Vec<u8>),
}

/// A pending load whose bytes have not been read yet.
pub struct LoadTicket {
    token: RenderToken,
    watch: TokenWatch,
    request: RenderRequest,
}

impl LoadTicket {
    pub fn token(&self) -> RenderToken {
        self.token
    }

    pub fn with_bytes(self, bytes: Vec<u8>) -> RenderBatch {
        RenderBatch {
            token: self.token,
            watch: self.watch,
            request: self.request,
            source: BatchSource::Bytes(bytes),
        }
    }

    /// Result for a load that failed before decoding, e.g. an unreadable path.
    pub fn fail(self, error: RenderError) -> BatchResult {
        BatchResult {
            token: self.token,
            document: None,
            outcome: BatchOutcome::Failed(error),
        }
    }
}

#[derive(Debug)]
pub enum BatchOutcome {
    Rendered(Vec<PageSurface>),
    Superseded,
    Failed(RenderError),
}

#[derive(Debug)]
pub struct BatchResult {
    pub token: RenderToken,
    /// Set when the batch decoded a new document.
    pub document: Option<Arc<DecodedDocument>>,
    pub outcome: BatchOutcome,
}

impl RenderBatch {
    pub fn token(&self) -> RenderToken {
        self.token
    }

    pub fn is_current(&self) -> bool {
        self.watch.is_current(self.token)
    }

    pub fn run(self, rasterizer: &dyn PageRasterizer) -> BatchResult {
        let token = self.token;
        let (document, decoded_here) = match self.source {
            BatchSource::Decoded(doc) => (doc, false),
            BatchSource::Bytes(bytes) => {
                if !self.watch.is_current(token) {
                    return BatchResult {
                        token,
                        document: None,
                        outcome: BatchOutcome::Superseded,
                    };
                }
                match decode_document(&bytes) {
                    Ok(doc) => (Arc::new(doc), true),
                    Err(e) => {
                        return BatchResult {
                            token,
                            document: None,
                            outcome: BatchOutcome::Failed(e),
                        }
                    }
                }
            }
        };

        let request = self.request.fitted_to(&document);
        let mut surfaces = Vec::with_capacity(document.page_count());
        let mut outcome = None;
        for page in &document.pages {
            if !self.watch.is_current(token) {
                outcome = Some(BatchOutcome::Superseded);
                break;
            }
            match render_page(&document, page, &request, rasterizer) {
                Ok(surface) => surfaces.push(surface),
                Err(e) => {
                    outcome = Some(BatchOutcome::Failed(e));
                    break;
                }
            }
        }
        let outcome = outcome.unwrap_or_else(|| {
            if self.watch.is_current(token) {
                BatchOutcome::Rendered(surfaces)
            } else {
                BatchOutcome::Superseded
            }
        });
        BatchResult {
            token,
            document: decoded_here.then_some(document),
            outcome,
        }
    }
}

pub fn render_page(
    document: &DecodedDocument,
    page: &PageGeometry,
    request: &RenderRequest,
    rasterizer: &dyn PageRasterizer,
) -> Result<PageSurface, RenderError> {
    let (bw, bh) = page.backing_size(request);
    if bw == 0 || bh == 0 {
        return Err(RenderError::PageFailed {
            page: page.page_number,
            reason: "empty_surface".into(),
        });
    }
    if f64::from(bw.max(bh)) > MAX_BACKING_SIDE {
        return Err(RenderError::PageFailed {
            page: page.page_number,
            reason: "surface_too_large".into(),
        });
    }
    let (css_width, css_height) = page.css_size(request);
    let mut pixels = RgbaImage::new(bw, bh);
    rasterizer
        .rasterize(document, page, request, &mut pixels)
        .map_err(|e| match e {
            failed @ RenderError::PageFailed { .. } => failed,
            other => RenderError::PageFailed {
                page: page.page_number,
                reason: other.to_string(),
            },
        })?;
    Ok(PageSurface {
        geometry: *page,
        request: *request,
        css_width,
        css_height,
        pixels,
    })
}

#[derive(Debug, PartialEq)]
pub enum CommitStatus {
    Applied { pages: usize },
    Discarded,
    Failed(RenderError),
}

/// Owns the decoded document, the committed page surfaces and the token.
pub struct RenderSession {
    latest: Arc<AtomicU64>,
    document: Option<Arc<DecodedDocument>>,
    document_id: Option<Uuid>,
    surfaces: Vec<PageSurface>,
    request: RenderRequest,
}

impl RenderSession {
    pub fn new(request: RenderRequest) -> Self {
        Self {
            latest: Arc::new(AtomicU64::new(0)),
            document: None,
            document_id: None,
            surfaces: Vec::new(),
            request,
        }
    }

    pub fn current_token(&self) -> RenderToken {
        RenderToken(self.latest.load(Ordering::SeqCst))
    }

    /// Invalidates every in-flight batch. They exit at their next page.
    pub fn cancel_in_flight(&mut self) -> RenderToken {
        RenderToken(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn watch(&self) -> TokenWatch {
        TokenWatch(Arc::clone(&self.latest))
    }

    /// Releases the current document and surfaces and invalidates in-flight
    /// work. The returned ticket becomes a batch once the bytes are read.
    pub fn begin_load(&mut self, document_id: Uuid) -> LoadTicket {
        self.release();
        self.document_id = Some(document_id);
        let token = self.cancel_in_flight();
        info!("render: load of {document_id} started with token {}", token.0);
        LoadTicket {
            token,
            watch: self.watch(),
            request: self.request,
        }
    }

    /// Re-renders the loaded document at a new request. Surfaces committed
    /// at the old request stay until the new batch commits.
    pub fn begin_render(&mut self, request: RenderRequest) -> Result<RenderBatch, RenderError> {
        let request = match &self.document {
            Some(document) => request.fitted_to(document),
            None => request,
        };
        self.set_request(request);
        let document = self.document.clone().ok_or(RenderError::NoDocument)?;
        let token = self.cancel_in_flight();
        debug!(
            "render: batch {} at scale {} dpr {}",
            token.0, request.scale, request.device_pixel_ratio
        );
        Ok(RenderBatch {
            token,
            watch: self.watch(),
            request,
            source: BatchSource::Decoded(document),
        })
    }

    /// Adopts a decoded document if `token` is still current. Returns whether
    /// it was adopted; a stale document is dropped.
    pub fn install_document(&mut self, token: RenderToken, document: Arc<DecodedDocument>) -> bool {
        if token != self.current_token() {
            return false;
        }
        info!("render: installed document with {} pages", document.page_count());
        self.request = self.request.fitted_to(&document);
        self.document = Some(document);
        true
    }

    pub fn commit(&mut self, result: BatchResult) -> CommitStatus {
        if result.token != self.current_token() {
            debug!(
                "render: discarding stale batch {} (current {})",
                result.token.0,
                self.current_token().0
            );
            return CommitStatus::Discarded;
        }
        if let Some(document) = result.document {
            self.install_document(result.token, document);
        }
        match result.outcome {
            BatchOutcome::Rendered(surfaces) => {
                let pages = surfaces.len();
                self.surfaces = surfaces;
                CommitStatus::Applied { pages }
            }
            BatchOutcome::Superseded => CommitStatus::Discarded,
            BatchOutcome::Failed(err) => {
                // A load failure keeps nothing; a page failure keeps the
                // document so a retry at another scale can work.
                if matches!(err, RenderError::Read(_) | RenderError::Decode(_) | RenderError::NoPages) {
                    self.release();
                }
                self.surfaces.clear();
                CommitStatus::Failed(err)
            }
        }
    }

    /// Unmount: drops the document and surfaces and stops in-flight work.
    pub fn teardown(&mut self) {
        self.release();
        self.cancel_in_flight();
    }

    fn release(&mut self) {
        self.document = None;
        self.document_id = None;
        self.surfaces.clear();
    }

    pub fn request(&self) -> RenderRequest {
        self.request
    }

    /// Request used by the next load or render. In-flight work keeps its own.
    pub fn set_request(&mut self, request: RenderRequest) {
        self.request = request;
    }

    pub fn document(&self) -> Option<&DecodedDocument> {
        self.document.as_deref()
    }

    pub fn document_id(&self) -> Option<Uuid> {
        self.document_id
    }

    pub fn surfaces(&self) -> &[PageSurface] {
        &self.surfaces
    }

    pub fn surface(&self, page_number: u32) -> Option<&PageSurface> {
        self.surfaces.iter().find(|s| s.page_number() == page_number)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::geometry::PointerPoint;

    struct FailOn(u32);

    impl PageRasterizer for FailOn {
        fn rasterize(
            &self,
            _document: &DecodedDocument,
            page: &PageGeometry,
            _request: &RenderRequest,
            _target: &mut RgbaImage,
        ) -> Result<(), RenderError> {
            if page.page_number == self.0 {
                Err(RenderError::Decode("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    fn session() -> RenderSession {
        RenderSession::new(RenderRequest::new(0.75, 2.0).unwrap())
    }

    #[test]
    fn request_rejects_nonsense() {
        assert_eq!(RenderRequest::new(0.0, 1.0), Err(RenderError::InvalidRequest));
        assert_eq!(RenderRequest::new(1.0, f64::INFINITY), Err(RenderError::InvalidRequest));
    }

    #[test]
    fn inherited_media_box_and_rotation_are_decoded() {
        let doc = decode_document(&test_pdf::build(&[0, 90])).unwrap();
        assert_eq!(doc.page_count(), 2);
        assert_eq!(doc.page(1).unwrap().viewport_size(), (612.0, 792.0));
        assert_eq!(doc.page(2).unwrap().viewport_size(), (792.0, 612.0));
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        let err = decode_document(b"%PDF-1.4 garbage").unwrap_err();
        assert!(err.to_string().starts_with("decode_failed:"), "{err:?}");
    }

    #[test]
    fn surfaces_use_two_tier_sizing() {
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        let status = s.commit(batch.run(&PaperRasterizer));
        assert_eq!(status, CommitStatus::Applied { pages: 2 });
        let page = s.surface(1).unwrap();
        assert_eq!(page.backing_size(), (918, 1188));
        assert_eq!((page.css_width, page.css_height), (459.0, 594.0));
        assert_eq!(page.pixels.get_pixel(10, 10), &PAPER);
    }

    #[test]
    fn fractional_sizes_floor_the_backing_store() {
        let geometry = PageGeometry {
            page_number: 1,
            frame: PageFrame::from_media_box(0.0, 0.0, 100.5, 50.25, PageRotation::Deg0),
        };
        let request = RenderRequest::new(1.0, 1.5).unwrap();
        assert_eq!(geometry.backing_size(&request), (150, 75));
        assert_eq!(geometry.css_size(&request), (100.5, 50.25));
    }

    #[test]
    fn newer_batch_supersedes_in_flight_one() {
        let mut s = session();
        let load = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        s.commit(load.run(&PaperRasterizer));

        let a = s.begin_render(RenderRequest::new(1.0, 1.0).unwrap()).unwrap();
        let b = s.begin_render(RenderRequest::new(2.0, 1.0).unwrap()).unwrap();
        assert!(!a.is_current());

        let a_result = a.run(&PaperRasterizer);
        assert!(matches!(a_result.outcome, BatchOutcome::Superseded));
        assert_eq!(s.commit(a_result), CommitStatus::Discarded);

        assert_eq!(s.commit(b.run(&PaperRasterizer)), CommitStatus::Applied { pages: 2 });
        assert_eq!(s.surface(1).unwrap().backing_size(), (1224, 1584));
    }

    #[test]
    fn completed_but_stale_batch_is_not_applied() {
        let mut s = session();
        let load = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        s.commit(load.run(&PaperRasterizer));

        let a = s.begin_render(RenderRequest::new(1.0, 1.0).unwrap()).unwrap();
        let a_result = a.run(&PaperRasterizer);
        let _b = s.begin_render(RenderRequest::new(0.5, 1.0).unwrap()).unwrap();
        let before = s.surface(1).unwrap().backing_size();
        assert_eq!(s.commit(a_result), CommitStatus::Discarded);
        assert_eq!(s.surface(1).unwrap().backing_size(), before);
    }

    #[test]
    fn loading_another_document_cancels_the_previous_load() {
        let mut s = session();
        let first = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        let second_id = Uuid::new_v4();
        let second = s.begin_load(second_id).with_bytes(test_pdf::build(&[0]));
        assert_eq!(s.commit(first.run(&PaperRasterizer)), CommitStatus::Discarded);
        assert!(s.document().is_none());
        assert_eq!(s.commit(second.run(&PaperRasterizer)), CommitStatus::Applied { pages: 1 });
        assert_eq!(s.document_id(), Some(second_id));
    }

    #[test]
    fn page_failure_leaves_no_partial_pages() {
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::build(&[0, 0, 0]));
        let status = s.commit(batch.run(&FailOn(2)));
        match status {
            CommitStatus::Failed(err) => assert_eq!(err.to_string(), "render_failed"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(s.surfaces().is_empty());
        assert!(s.document().is_some());
    }

    #[test]
    fn decode_failure_retains_nothing() {
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(b"nope".to_vec());
        assert!(matches!(s.commit(batch.run(&PaperRasterizer)), CommitStatus::Failed(RenderError::Decode(_))));
        assert!(s.document().is_none());
        assert!(s.document_id().is_none());
    }

    #[test]
    fn unreadable_source_fails_the_load() {
        let mut s = session();
        let ticket = s.begin_load(Uuid::new_v4());
        let result = ticket.fail(RenderError::Read("gone".into()));
        assert_eq!(
            s.commit(result),
            CommitStatus::Failed(RenderError::Read("gone".into()))
        );
        assert!(s.document_id().is_none());
    }

    #[test]
    fn teardown_releases_and_invalidates() {
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        s.teardown();
        assert_eq!(s.commit(batch.run(&PaperRasterizer)), CommitStatus::Discarded);
        assert!(s.document().is_none());
        assert!(s.begin_render(s.request()).is_err());
    }

    #[test]
    fn pdfium_draws_page_content() {
        let Some(rasterizer) = pdfium_rasterizer(None) else {
            eprintln!("pdfium library not found, skipping content check");
            return;
        };
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        assert_eq!(s.commit(batch.run(rasterizer.as_ref())), CommitStatus::Applied { pages: 2 });
        let page = s.surface(1).unwrap();
        assert_eq!(page.backing_size(), (918, 1188));
        let (w, h) = page.backing_size();
        let inked = page
            .pixels
            .enumerate_pixels()
            .filter(|(x, y, _)| *x > 2 && *y > 2 && *x + 3 < w && *y + 3 < h)
            .filter(|(_, _, p)| p.0[0] < 128 && p.0[3] > 0)
            .count();
        assert!(inked > 50, "expected the page label to be drawn, got {inked} dark pixels");
    }

    #[test]
    fn default_rasterizer_always_paints_the_page() {
        let rasterizer = default_rasterizer(None);
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        assert_eq!(s.commit(batch.run(rasterizer.as_ref())), CommitStatus::Applied { pages: 2 });
        assert_eq!(s.surface(2).unwrap().backing_size(), (918, 1188));
    }

    #[test]
    fn scale_is_clamped_into_range() {
        assert_eq!(RenderRequest::new(50.0, 1.0).unwrap().scale, MAX_SCALE);
        assert_eq!(RenderRequest::new(0.001, 1.0).unwrap().scale, MIN_SCALE);
    }

    #[test]
    fn oversized_requests_are_fitted_so_the_transform_stays_exact() {
        let mut s = session();
        let load = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        s.commit(load.run(&PaperRasterizer));

        let batch = s.begin_render(RenderRequest::new(12.0, 2.0).unwrap()).unwrap();
        assert_eq!(s.commit(batch.run(&PaperRasterizer)), CommitStatus::Applied { pages: 2 });
        let page = s.surface(1).unwrap();
        let request = page.request;
        assert!(request.scale < MAX_SCALE);
        assert_eq!(s.request(), request);

        let (bw, bh) = page.backing_size();
        assert!(f64::from(bw.max(bh)) <= MAX_BACKING_SIDE);
        assert_eq!(bh, (792.0 * request.scale * 2.0).floor() as u32);
        assert_eq!(page.css_height, 792.0 * request.scale);

        let projection = page.metrics(None, None).projection().unwrap();
        let clicked = projection.pointer_to_pdf(PointerPoint::new(100.0 * request.scale, 100.0 * request.scale));
        assert!((clicked.x - 100.0).abs() < 0.05, "{clicked:?}");
        assert!((clicked.y - 100.0).abs() < 0.05, "{clicked:?}");
    }

    #[test]
    fn loads_fit_the_pending_request_to_the_document() {
        let mut s = RenderSession::new(RenderRequest::new(8.0, 3.0).unwrap());
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        assert_eq!(s.commit(batch.run(&PaperRasterizer)), CommitStatus::Applied { pages: 2 });
        let fitted = s.surface(1).unwrap().request;
        assert_eq!(s.request(), fitted);
        assert_eq!(fitted.scale, MAX_BACKING_SIDE / (792.0 * 3.0));
    }

    #[test]
    fn surface_metrics_fall_back_to_nominal_box() {
        let mut s = session();
        let batch = s.begin_load(Uuid::new_v4()).with_bytes(test_pdf::two_pages());
        s.commit(batch.run(&PaperRasterizer));
        let m = s.surface(2).unwrap().metrics(None, Some(300.0));
        assert_eq!(m.bbox_width, 459.0);
        assert_eq!(m.bbox_height, 300.0);
        assert_eq!((m.backing_width, m.backing_height), (918, 1188));
    }
}
