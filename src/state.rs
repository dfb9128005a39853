use crate::config::AppConfig;
use crate::features::placement::FieldEditor;
use crate::features::renderer::{default_rasterizer, PageRasterizer, RenderRequest, RenderSession};
use crate::features::signature::SignaturePalette;
use crate::features::signing::{SaveOutcome, SignatureInfo, VerifyReport};
use crate::features::workspace::Workspace;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Screen {
    Home,
    Editor,
    Loading,
}

/// What the last successful signing produced, kept for the result panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignSummary {
    pub document_id: Uuid,
    pub signed_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub placed: usize,
    pub fallbacks: usize,
    pub skipped: usize,
    pub info: SignatureInfo,
}

pub struct AppState {
    pub nav_stack: Vec<Screen>,
    pub config: AppConfig,
    pub workspace: Workspace,
    pub renderer: RenderSession,
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub editor: FieldEditor,
    pub palette: SignaturePalette,
    pub open_document: Option<Uuid>,
    pub last_error: Option<String>,
    pub loading_message: Option<String>,
    pub status: Option<String>,
    pub last_sign: Option<SignSummary>,
    pub last_save: Option<SaveOutcome>,
    pub last_verify: Option<VerifyReport>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let request = initial_request(&config);
        let rasterizer = default_rasterizer(config.pdfium_dir.as_deref());
        Self {
            nav_stack: Vec::new(),
            config,
            workspace: Workspace::new(),
            renderer: RenderSession::new(request),
            rasterizer,
            editor: FieldEditor::new(),
            palette: SignaturePalette::new(),
            open_document: None,
            last_error: None,
            loading_message: None,
            status: None,
            last_sign: None,
            last_save: None,
            last_verify: None,
        }
    }

    pub fn ensure_navigation(&mut self) {
        if self.nav_stack.is_empty() {
            self.nav_stack.push(Screen::Home);
        }
    }

    pub fn current_screen(&self) -> Screen {
        self.nav_stack.last().copied().unwrap_or(Screen::Home)
    }

    pub fn push_screen(&mut self, screen: Screen) {
        self.ensure_navigation();
        if self.current_screen() != screen {
            self.nav_stack.push(screen);
        }
    }

    pub fn replace_current(&mut self, screen: Screen) {
        self.ensure_navigation();
        if let Some(last) = self.nav_stack.last_mut() {
            *last = screen;
        } else {
            self.nav_stack.push(screen);
        }
    }

    pub fn pop_screen(&mut self) {
        self.ensure_navigation();
        if self.nav_stack.len() > 1 {
            self.nav_stack.pop();
        }
    }

    pub fn reset_navigation(&mut self) {
        self.nav_stack.clear();
        self.nav_stack.push(Screen::Home);
    }

    /// Leaves the editor: stops rendering and drops the decoded document.
    /// Fields stay with their document.
    pub fn close_document(&mut self) {
        self.renderer.teardown();
        self.editor.cancel_gesture();
        self.editor.disarm();
        self.editor.deselect();
        self.open_document = None;
        self.loading_message = None;
    }

    pub fn reset_runtime(&mut self) {
        self.renderer.teardown();
        let config = self.config.clone();
        let rasterizer = Arc::clone(&self.rasterizer);
        *self = Self::new(config);
        self.rasterizer = rasterizer;
    }
}

fn initial_request(config: &AppConfig) -> RenderRequest {
    RenderRequest::new(config.default_scale, config.device_pixel_ratio).unwrap_or(RenderRequest {
        scale: crate::config::DEFAULT_SCALE,
        device_pixel_ratio: 1.0,
    })
}
