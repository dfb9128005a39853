use crate::config::{AppConfig, SignerProfile};
use crate::error::{EditorError, RenderError, SignError};
use crate::features::geometry::{Corner, PointerPoint, SurfaceMetrics};
use crate::features::placement::{FieldPhase, FieldSnapshot};
use crate::features::renderer::{
    BatchOutcome, BatchResult, CommitStatus, LoadTicket, PageRasterizer, RenderBatch,
    RenderRequest, RenderToken, MAX_SCALE, MIN_SCALE,
};
use crate::features::signature::{decode_base64, SignatureFont, SignaturePayload};
use crate::features::signing::{self, SaveOutcome, SignOutcome};
use crate::features::storage::{output_dir_for, read_document_bytes};
use crate::features::workspace::PickedFile;
use crate::state::{AppState, Screen, SignSummary};
use crate::ui::{
    Button as UiButton, Column as UiColumn, FieldOverlay, PageSurface as UiPageSurface,
    Progress as UiProgress, Text as UiText, TextInput as UiTextInput,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{mpsc, Arc, Mutex, MutexGuard, OnceLock},
    thread,
    time::Instant,
};
use uuid::Uuid;

#[cfg(test)]
use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

const DEFAULT_PAD_WIDTH: u32 = 400;
const DEFAULT_PAD_HEIGHT: u32 = 150;
const ZOOM_STEP: f64 = 1.25;

struct GlobalState {
    ui: OnceLock<Mutex<AppState>>,
    worker: OnceLock<WorkerRuntime>,
    notifications: Mutex<Vec<WorkerResult>>,
}

impl GlobalState {
    const fn new() -> Self {
        Self {
            ui: OnceLock::new(),
            worker: OnceLock::new(),
            notifications: Mutex::new(Vec::new()),
        }
    }

    fn ui(&self) -> &Mutex<AppState> {
        self.ui
            .get_or_init(|| Mutex::new(AppState::new(AppConfig::from_env())))
    }

    /// A panic in an earlier dispatch poisons the lock; the state itself is
    /// still usable, so recover it.
    fn ui_lock(&self) -> MutexGuard<'_, AppState> {
        match self.ui().lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("router: recovering poisoned state lock");
                poisoned.into_inner()
            }
        }
    }

    #[cfg(test)]
    fn ui_try_lock(&self) -> Option<MutexGuard<'_, AppState>> {
        self.ui().try_lock().ok()
    }

    fn worker(&self) -> &WorkerRuntime {
        self.worker.get_or_init(WorkerRuntime::new)
    }

    fn push_worker_result(&self, result: WorkerResult) {
        if let Ok(mut guard) = self.notifications.lock() {
            guard.push(result);
        }
    }

    fn drain_worker_results(&self) -> Vec<WorkerResult> {
        self.notifications
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

static STATE: GlobalState = GlobalState::new();

struct WorkerRuntime {
    sender: mpsc::Sender<WorkerJob>,
}

impl WorkerRuntime {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<WorkerJob>();
        thread::Builder::new()
            .name("signdesk-worker".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = run_worker_job(job);
                    STATE.push_worker_result(result);
                }
            })
            .expect("failed to spawn worker thread");

        Self { sender: tx }
    }

    #[cfg(not(test))]
    fn enqueue(&self, job: WorkerJob) -> Result<(), String> {
        self.sender
            .send(job)
            .map_err(|e| format!("worker_send_failed:{e}"))
    }

    #[cfg(test)]
    fn enqueue(&self, job: WorkerJob) -> Result<(), String> {
        if TEST_FORCE_ASYNC_WORKER.load(Ordering::SeqCst) {
            self.sender
                .send(job)
                .map_err(|e| format!("worker_send_failed:{e}"))
        } else {
            let result = run_worker_job(job);
            STATE.push_worker_result(result);
            Ok(())
        }
    }
}

enum WorkerJob {
    LoadDocument {
        path: String,
        ticket: LoadTicket,
        rasterizer: Arc<dyn PageRasterizer>,
    },
    Render {
        batch: RenderBatch,
        rasterizer: Arc<dyn PageRasterizer>,
    },
    Sign {
        document_id: Uuid,
        source: String,
        fields: Vec<FieldSnapshot>,
        profile: SignerProfile,
        output_dir: PathBuf,
    },
    Save {
        source: PathBuf,
        destination: Option<PathBuf>,
    },
}

enum WorkerResult {
    Render(BatchResult),
    Sign {
        document_id: Uuid,
        value: Result<SignOutcome, String>,
    },
    Save {
        value: Result<SaveOutcome, String>,
    },
}

impl WorkerJob {
    fn kind(&self) -> &'static str {
        match self {
            WorkerJob::LoadDocument { .. } => "load",
            WorkerJob::Render { .. } => "render",
            WorkerJob::Sign { .. } => "sign",
            WorkerJob::Save { .. } => "save",
        }
    }

    /// What the shell sees if this job panics.
    fn panicked(&self) -> WorkerResult {
        const REASON: &str = "worker_panic";
        let failed_batch = |token: RenderToken, error: RenderError| {
            WorkerResult::Render(BatchResult {
                token,
                document: None,
                outcome: BatchOutcome::Failed(error),
            })
        };
        match self {
            WorkerJob::LoadDocument { ticket, .. } => {
                failed_batch(ticket.token(), RenderError::Decode(REASON.into()))
            }
            WorkerJob::Render { batch, .. } => failed_batch(
                batch.token(),
                RenderError::PageFailed {
                    page: 0,
                    reason: REASON.into(),
                },
            ),
            WorkerJob::Sign { document_id, .. } => WorkerResult::Sign {
                document_id: *document_id,
                value: Err(REASON.into()),
            },
            WorkerJob::Save { .. } => WorkerResult::Save {
                value: Err(REASON.into()),
            },
        }
    }
}

/// Runs a job and turns a panic into a failed result, so the worker thread
/// outlives a bad document.
fn run_worker_job(job: WorkerJob) -> WorkerResult {
    test_worker_delay();
    let kind = job.kind();
    let fallback = job.panicked();
    match catch_unwind(AssertUnwindSafe(|| execute_job(job))) {
        Ok(result) => result,
        Err(_) => {
            warn!("worker: {kind} job panicked");
            fallback
        }
    }
}

fn execute_job(job: WorkerJob) -> WorkerResult {
    match job {
        WorkerJob::LoadDocument {
            path,
            ticket,
            rasterizer,
        } => {
            let result = match read_document_bytes(&path) {
                Ok(bytes) => ticket.with_bytes(bytes).run(rasterizer.as_ref()),
                Err(e) => ticket.fail(RenderError::Read(e.to_string())),
            };
            WorkerResult::Render(result)
        }
        WorkerJob::Render { batch, rasterizer } => WorkerResult::Render(batch.run(rasterizer.as_ref())),
        WorkerJob::Sign {
            document_id,
            source,
            fields,
            profile,
            output_dir,
        } => WorkerResult::Sign {
            document_id,
            value: signing::sign(&source, &fields, &profile, &output_dir).map_err(|e| e.to_string()),
        },
        WorkerJob::Save {
            source,
            destination,
        } => WorkerResult::Save {
            value: signing::save_copy(&source, destination.as_deref()).map_err(|e| e.to_string()),
        },
    }
}

/// Serializes tests that drive the shared router state.
#[cfg(test)]
pub(crate) static TEST_MUTEX: Mutex<()> = Mutex::new(());

#[cfg(test)]
static TEST_FORCE_ASYNC_WORKER: AtomicBool = AtomicBool::new(false);

#[cfg(test)]
static TEST_WORKER_DELAY_MS: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
fn test_worker_delay() {
    let delay = TEST_WORKER_DELAY_MS.load(Ordering::SeqCst);
    if delay > 0 {
        thread::sleep(Duration::from_millis(delay));
    }
}

#[cfg(not(test))]
fn test_worker_delay() {}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Command {
    action: String,
    path: Option<String>,
    name: Option<String>,
    size: Option<u64>,
    last_modified: Option<i64>,
    extension: Option<String>,
    document_id: Option<String>,
    signature_id: Option<String>,
    field_id: Option<String>,
    page: Option<u32>,
    x: Option<f64>,
    y: Option<f64>,
    bbox_width: Option<f64>,
    bbox_height: Option<f64>,
    scale: Option<f64>,
    device_pixel_ratio: Option<f64>,
    corner: Option<String>,
    inside: Option<bool>,
    text: Option<String>,
    font: Option<String>,
    label: Option<String>,
    data: Option<String>,
    strokes: Option<Vec<Vec<[f64; 2]>>>,
    width: Option<u32>,
    height: Option<u32>,
    destination: Option<String>,
    cancelled: Option<bool>,
    error: Option<String>,
    bindings: Option<HashMap<String, String>>,
}

/// Measured on-screen box of a page surface, if the shell sent one.
#[derive(Debug, Clone, Copy, Default)]
struct Bbox {
    width: Option<f64>,
    height: Option<f64>,
}

enum Action {
    Init,
    Reset,
    Back,
    Refresh,
    Error {
        message: String,
    },
    DocumentAdd {
        picked: PickedFile,
    },
    DocumentOpen {
        document_id: Uuid,
    },
    DocumentRemove {
        document_id: Uuid,
    },
    SetScale {
        scale: Option<f64>,
        device_pixel_ratio: Option<f64>,
    },
    SurfaceImage {
        page: u32,
    },
    SignatureDraw {
        strokes: Option<Vec<Vec<(f64, f64)>>>,
        data: Option<String>,
        width: u32,
        height: u32,
        label: String,
    },
    SignatureType {
        text: String,
        font: SignatureFont,
        label: String,
    },
    SignatureImage {
        data: Option<String>,
        path: Option<String>,
        label: String,
    },
    SignatureRemove {
        signature_id: Uuid,
    },
    PlacementArm {
        signature_id: Uuid,
    },
    PlacementCancel,
    PageClick {
        page: u32,
        pointer: PointerPoint,
        bbox: Bbox,
    },
    FieldSelect {
        field_id: Uuid,
    },
    FieldPointerDown {
        field_id: Uuid,
        pointer: PointerPoint,
        bbox: Bbox,
    },
    FieldHandleDown {
        field_id: Uuid,
        corner: Corner,
        pointer: PointerPoint,
        bbox: Bbox,
    },
    PointerMove {
        pointer: PointerPoint,
        bbox: Bbox,
    },
    PointerUp,
    FieldHover {
        field_id: Uuid,
        inside: bool,
    },
    FieldDelete {
        field_id: Uuid,
    },
    FinishSigning,
    SaveSigned {
        document_id: Option<Uuid>,
        destination: Option<PathBuf>,
        cancelled: bool,
    },
    VerifySigned {
        document_id: Option<Uuid>,
        path: Option<String>,
    },
}

fn parse_uuid(raw: Option<String>, key: &str) -> Result<Uuid, String> {
    let raw = raw.ok_or_else(|| format!("missing_{key}"))?;
    Uuid::parse_str(raw.trim()).map_err(|_| format!("invalid_{key}:{raw}"))
}

fn parse_optional_uuid(raw: Option<String>, key: &str) -> Result<Option<Uuid>, String> {
    match raw {
        Some(raw) => parse_uuid(Some(raw), key).map(Some),
        None => Ok(None),
    }
}

fn parse_pointer(x: Option<f64>, y: Option<f64>) -> Result<PointerPoint, String> {
    match (x, y) {
        (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Ok(PointerPoint::new(x, y)),
        _ => Err("missing_pointer".into()),
    }
}

fn parse_action(command: Command) -> Result<Action, String> {
    let Command {
        action,
        path,
        name,
        size,
        last_modified,
        extension,
        document_id,
        signature_id,
        field_id,
        page,
        x,
        y,
        bbox_width,
        bbox_height,
        scale,
        device_pixel_ratio,
        corner,
        inside,
        text,
        font,
        label,
        data,
        strokes,
        width,
        height,
        destination,
        cancelled,
        error,
        bindings,
    } = command;

    let bindings = bindings.unwrap_or_default();
    let label = label
        .or_else(|| bindings.get("signature_label").cloned())
        .unwrap_or_default();
    let bbox = Bbox {
        width: bbox_width,
        height: bbox_height,
    };

    match action.as_str() {
        "init" => Ok(Action::Init),
        "reset" => Ok(Action::Reset),
        "back" => Ok(Action::Back),
        "refresh" => Ok(Action::Refresh),
        "error" => Ok(Action::Error {
            message: error.unwrap_or_else(|| "unknown_error".into()),
        }),
        "document_add" => Ok(Action::DocumentAdd {
            picked: PickedFile {
                path: path.ok_or_else(|| "missing_path".to_string())?,
                name,
                size,
                last_modified,
                extension,
            },
        }),
        "document_open" => Ok(Action::DocumentOpen {
            document_id: parse_uuid(document_id, "document_id")?,
        }),
        "document_remove" => Ok(Action::DocumentRemove {
            document_id: parse_uuid(document_id, "document_id")?,
        }),
        "set_scale" => {
            if scale.is_none() && device_pixel_ratio.is_none() {
                return Err("missing_scale".into());
            }
            Ok(Action::SetScale {
                scale,
                device_pixel_ratio,
            })
        }
        "surface_image" => Ok(Action::SurfaceImage {
            page: page.ok_or_else(|| "missing_page".to_string())?,
        }),
        "signature_draw" => {
            if strokes.is_none() && data.is_none() {
                return Err("missing_signature_data".into());
            }
            Ok(Action::SignatureDraw {
                strokes: strokes.map(|all| {
                    all.into_iter()
                        .map(|stroke| stroke.into_iter().map(|[px, py]| (px, py)).collect::<Vec<_>>())
                        .collect()
                }),
                data,
                width: width.unwrap_or(DEFAULT_PAD_WIDTH),
                height: height.unwrap_or(DEFAULT_PAD_HEIGHT),
                label,
            })
        }
        "signature_type" => Ok(Action::SignatureType {
            text: text
                .or_else(|| bindings.get("signature_text").cloned())
                .unwrap_or_default(),
            font: SignatureFont::parse(
                font.or_else(|| bindings.get("signature_font").cloned())
                    .as_deref()
                    .unwrap_or(""),
            ),
            label,
        }),
        "signature_image" => {
            if data.is_none() && path.is_none() {
                return Err("missing_signature_data".into());
            }
            Ok(Action::SignatureImage { data, path, label })
        }
        "signature_remove" => Ok(Action::SignatureRemove {
            signature_id: parse_uuid(signature_id, "signature_id")?,
        }),
        "placement_arm" => Ok(Action::PlacementArm {
            signature_id: parse_uuid(signature_id, "signature_id")?,
        }),
        "placement_cancel" => Ok(Action::PlacementCancel),
        "page_click" => Ok(Action::PageClick {
            page: page.ok_or_else(|| "missing_page".to_string())?,
            pointer: parse_pointer(x, y)?,
            bbox,
        }),
        "field_select" => Ok(Action::FieldSelect {
            field_id: parse_uuid(field_id, "field_id")?,
        }),
        "field_pointer_down" => Ok(Action::FieldPointerDown {
            field_id: parse_uuid(field_id, "field_id")?,
            pointer: parse_pointer(x, y)?,
            bbox,
        }),
        "field_handle_down" => {
            let raw = corner.ok_or_else(|| "missing_corner".to_string())?;
            Ok(Action::FieldHandleDown {
                field_id: parse_uuid(field_id, "field_id")?,
                corner: Corner::parse(&raw).ok_or_else(|| format!("invalid_corner:{raw}"))?,
                pointer: parse_pointer(x, y)?,
                bbox,
            })
        }
        "pointer_move" => Ok(Action::PointerMove {
            pointer: parse_pointer(x, y)?,
            bbox,
        }),
        "pointer_up" => Ok(Action::PointerUp),
        "field_hover" => Ok(Action::FieldHover {
            field_id: parse_uuid(field_id, "field_id")?,
            inside: inside.unwrap_or(true),
        }),
        "field_delete" => Ok(Action::FieldDelete {
            field_id: parse_uuid(field_id, "field_id")?,
        }),
        "finish_signing" => Ok(Action::FinishSigning),
        "save_signed" => Ok(Action::SaveSigned {
            document_id: parse_optional_uuid(document_id, "document_id")?,
            destination: destination.map(PathBuf::from),
            cancelled: cancelled.unwrap_or(false),
        }),
        "verify_signed" => Ok(Action::VerifySigned {
            document_id: parse_optional_uuid(document_id, "document_id")?,
            path,
        }),
        other => Err(format!("unknown_action:{other}")),
    }
}

/// Entry point for every shell. Takes one command object as JSON and returns
/// a UI tree or a typed payload, also as JSON. Never panics.
pub fn dispatch(input: &str) -> String {
    let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let command: Command = serde_json::from_str(input).unwrap_or_else(|e| Command {
            action: "error".into(),
            error: Some(format!("invalid_json:{e}")),
            ..Command::default()
        });
        handle_command(command)
    }));

    let json_value = match response {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => error_ui(&err),
        Err(_) => error_ui("panic"),
    };
    json_value.to_string()
}

/// Replaces the page rasterizer used for subsequent renders.
pub fn install_rasterizer(rasterizer: Arc<dyn PageRasterizer>) {
    STATE.ui_lock().rasterizer = rasterizer;
}

fn handle_command(command: Command) -> Result<Value, String> {
    let mut state = STATE.ui_lock();

    apply_worker_results(&mut state);
    state.ensure_navigation();

    let action = match parse_action(command) {
        Ok(action) => action,
        Err(err) => {
            state.last_error = Some(err);
            return Ok(render_ui(&state));
        }
    };

    if !matches!(
        action,
        Action::Init | Action::Refresh | Action::PointerMove { .. } | Action::FieldHover { .. }
    ) {
        state.last_error = None;
    }

    let outcome = match action {
        Action::Init | Action::Refresh => Ok(None),
        Action::Reset => {
            state.reset_runtime();
            state.reset_navigation();
            Ok(None)
        }
        Action::Back => {
            if matches!(state.current_screen(), Screen::Editor | Screen::Loading) {
                state.close_document();
            }
            state.pop_screen();
            Ok(None)
        }
        Action::Error { message } => Err(message),
        Action::DocumentAdd { picked } => handle_document_add(&mut state, picked),
        Action::DocumentOpen { document_id } => handle_document_open(&mut state, document_id),
        Action::DocumentRemove { document_id } => handle_document_remove(&mut state, document_id),
        Action::SetScale {
            scale,
            device_pixel_ratio,
        } => handle_set_scale(&mut state, scale, device_pixel_ratio),
        Action::SurfaceImage { page } => handle_surface_image(&state, page),
        a @ (Action::SignatureDraw { .. }
        | Action::SignatureType { .. }
        | Action::SignatureImage { .. }
        | Action::SignatureRemove { .. }) => handle_signature_action(&mut state, a),
        a @ (Action::PlacementArm { .. }
        | Action::PlacementCancel
        | Action::PageClick { .. }
        | Action::FieldSelect { .. }
        | Action::FieldPointerDown { .. }
        | Action::FieldHandleDown { .. }
        | Action::PointerMove { .. }
        | Action::PointerUp
        | Action::FieldHover { .. }
        | Action::FieldDelete { .. }) => handle_field_action(&mut state, a),
        Action::FinishSigning => handle_finish_signing(&mut state),
        Action::SaveSigned {
            document_id,
            destination,
            cancelled,
        } => handle_save_signed(&mut state, document_id, destination, cancelled),
        Action::VerifySigned { document_id, path } => handle_verify_signed(&mut state, document_id, path),
    };

    match outcome {
        Ok(Some(payload)) => Ok(payload),
        Ok(None) => Ok(render_ui(&state)),
        Err(err) => {
            warn!("router: {err}");
            state.last_error = Some(err);
            Ok(render_ui(&state))
        }
    }
}

type ActionOutcome = Result<Option<Value>, String>;

fn enqueue(state: &mut AppState, job: WorkerJob) -> Result<(), String> {
    STATE.worker().enqueue(job)?;
    #[cfg(test)]
    {
        apply_worker_results(state);
    }
    #[cfg(not(test))]
    let _ = state;
    Ok(())
}

fn handle_document_add(state: &mut AppState, picked: PickedFile) -> ActionOutcome {
    let record = state.workspace.intake(picked).map_err(|e| e.to_string())?;
    state.status = Some(format!("Added {}", record.name));
    Ok(None)
}

fn handle_document_open(state: &mut AppState, document_id: Uuid) -> ActionOutcome {
    let record = state.workspace.get(document_id).map_err(|e| e.to_string())?;
    let path = record.path.clone();
    let name = record.name.clone();

    state.close_document();
    state.open_document = Some(document_id);
    let ticket = state.renderer.begin_load(document_id);
    state.loading_message = Some(format!("Opening {name}..."));
    state.reset_navigation();
    state.push_screen(Screen::Loading);
    info!("router: opening {name}");

    let rasterizer = Arc::clone(&state.rasterizer);
    enqueue(
        state,
        WorkerJob::LoadDocument {
            path,
            ticket,
            rasterizer,
        },
    )?;
    Ok(None)
}

fn handle_document_remove(state: &mut AppState, document_id: Uuid) -> ActionOutcome {
    let record = state.workspace.remove(document_id).map_err(|e| e.to_string())?;
    let dropped = state.editor.remove_document_fields(document_id);
    if state.open_document == Some(document_id) {
        state.close_document();
        state.reset_navigation();
    }
    if state.last_sign.as_ref().map(|s| s.document_id) == Some(document_id) {
        state.last_sign = None;
    }
    info!("router: removed {} and {dropped} field(s)", record.name);
    state.status = Some(format!("Removed {}", record.name));
    Ok(None)
}

fn handle_set_scale(state: &mut AppState, scale: Option<f64>, dpr: Option<f64>) -> ActionOutcome {
    let current = state.renderer.request();
    let request = RenderRequest::new(
        scale.unwrap_or(current.scale),
        dpr.unwrap_or(current.device_pixel_ratio),
    )
    .map_err(|e| e.to_string())?;
    if state.renderer.document().is_some() {
        start_render(state, request)?;
    } else {
        // A load in flight picks this up once it commits.
        state.renderer.set_request(request);
    }
    Ok(None)
}

fn start_render(state: &mut AppState, request: RenderRequest) -> Result<(), String> {
    let batch = state
        .renderer
        .begin_render(request)
        .map_err(|e| e.to_string())?;
    let rasterizer = Arc::clone(&state.rasterizer);
    enqueue(state, WorkerJob::Render { batch, rasterizer })
}

fn handle_surface_image(state: &AppState, page: u32) -> ActionOutcome {
    let surface = state
        .renderer
        .surface(page)
        .ok_or_else(|| format!("surface_not_ready:{page}"))?;
    let png = surface.to_png().map_err(|e| e.to_string())?;
    let (backing_width, backing_height) = surface.backing_size();
    Ok(Some(json!({
        "type": "SurfaceImage",
        "page": page,
        "backing_width": backing_width,
        "backing_height": backing_height,
        "css_width": surface.css_width,
        "css_height": surface.css_height,
        "png_base64": B64.encode(png),
    })))
}

fn handle_signature_action(state: &mut AppState, action: Action) -> ActionOutcome {
    let payload = match action {
        Action::SignatureDraw {
            strokes,
            data,
            width,
            height,
            label,
        } => match (strokes, data) {
            (Some(strokes), _) => SignaturePayload::draw_from_strokes(&strokes, width, height, &label),
            (None, Some(data)) => decode_base64(&data)
                .and_then(|bytes| SignaturePayload::draw_from_image_bytes(&bytes, &label)),
            (None, None) => return Err("missing_signature_data".into()),
        },
        Action::SignatureType { text, font, label } => SignaturePayload::typed(&text, font, &label),
        Action::SignatureImage { data, path, label } => {
            let bytes = match (data, path) {
                (Some(data), _) => decode_base64(&data).map_err(|e| e.to_string())?,
                (None, Some(path)) => read_document_bytes(&path)
                    .map_err(|e| format!("signature_read_failed:{e}"))?,
                (None, None) => return Err("missing_signature_data".into()),
            };
            SignaturePayload::image_from_upload(&bytes, &label)
        }
        Action::SignatureRemove { signature_id } => {
            if !state.palette.remove(signature_id) {
                return Err(EditorError::UnknownSignature(signature_id).to_string());
            }
            state.status = Some("Signature removed".into());
            return Ok(None);
        }
        _ => return Ok(None),
    }
    .map_err(|e| e.to_string())?;

    let kind = payload.kind_name();
    let id = state.palette.add(payload);
    debug!("router: saved {kind} signature {id}");
    state.status = Some("Signature saved".into());
    Ok(None)
}

fn metrics_for(state: &AppState, page: u32, bbox: Bbox) -> Option<SurfaceMetrics> {
    state
        .renderer
        .surface(page)
        .map(|surface| surface.metrics(bbox.width, bbox.height))
}

fn field_page(state: &AppState, field_id: Uuid) -> Result<u32, String> {
    state
        .editor
        .field(field_id)
        .map(|f| f.page_number)
        .map_err(|e| e.to_string())
}

fn handle_field_action(state: &mut AppState, action: Action) -> ActionOutcome {
    match action {
        Action::PlacementArm { signature_id } => {
            let payload = state
                .palette
                .copy_payload(signature_id)
                .ok_or_else(|| EditorError::UnknownSignature(signature_id).to_string())?;
            state.editor.arm_placement(payload);
        }
        Action::PlacementCancel => state.editor.disarm(),
        Action::PageClick {
            page,
            pointer,
            bbox,
        } => {
            let document_id = state.open_document.ok_or("no_document_open")?;
            let Some(metrics) = metrics_for(state, page, bbox) else {
                debug!("router: click on page {page} before it rendered");
                return Ok(None);
            };
            if state.editor.armed().is_some() {
                state
                    .editor
                    .place(document_id, page, &metrics, pointer)
                    .map_err(|e| e.to_string())?;
            } else {
                state.editor.deselect();
            }
        }
        Action::FieldSelect { field_id } => {
            state.editor.select(field_id).map_err(|e| e.to_string())?;
        }
        Action::FieldPointerDown {
            field_id,
            pointer,
            bbox,
        } => {
            let page = field_page(state, field_id)?;
            match metrics_for(state, page, bbox) {
                Some(metrics) => {
                    state
                        .editor
                        .begin_drag(field_id, &metrics, pointer)
                        .map_err(|e| e.to_string())?;
                }
                None => state.editor.select(field_id).map_err(|e| e.to_string())?,
            }
        }
        Action::FieldHandleDown {
            field_id,
            corner,
            pointer,
            bbox,
        } => {
            let page = field_page(state, field_id)?;
            match metrics_for(state, page, bbox) {
                Some(metrics) => {
                    state
                        .editor
                        .begin_resize(field_id, corner, &metrics, pointer)
                        .map_err(|e| e.to_string())?;
                }
                None => state.editor.select(field_id).map_err(|e| e.to_string())?,
            }
        }
        Action::PointerMove { pointer, bbox } => {
            let Some(field_id) = state.editor.gesture_field() else {
                return Ok(None);
            };
            let page = field_page(state, field_id)?;
            if let Some(metrics) = metrics_for(state, page, bbox) {
                state.editor.pointer_move(&metrics, pointer);
            }
        }
        Action::PointerUp => {
            state.editor.pointer_up();
        }
        Action::FieldHover { field_id, inside } => {
            state
                .editor
                .hover(field_id, inside, Instant::now())
                .map_err(|e| e.to_string())?;
        }
        Action::FieldDelete { field_id } => {
            state.editor.delete(field_id).map_err(|e| e.to_string())?;
            state.status = Some("Field deleted".into());
        }
        _ => {}
    }
    Ok(None)
}

fn handle_finish_signing(state: &mut AppState) -> ActionOutcome {
    let document_id = state.open_document.ok_or("no_document_open")?;
    state.editor.cancel_gesture();
    let fields = state.editor.finalize(document_id);
    if fields.is_empty() {
        return Err(SignError::NoFields.to_string());
    }
    let record = state.workspace.get(document_id).map_err(|e| e.to_string())?;
    let source = record.path.clone();
    info!("router: signing {} with {} field(s)", record.name, fields.len());
    let output_dir = output_dir_for(
        &source,
        state.config.output_dir.as_deref(),
        &state.config.temp_dir,
    );
    state.loading_message = Some(format!("Signing {} field(s)...", fields.len()));

    let profile = state.config.signer.clone();
    enqueue(
        state,
        WorkerJob::Sign {
            document_id,
            source,
            fields,
            profile,
            output_dir,
        },
    )?;
    Ok(None)
}

fn handle_save_signed(
    state: &mut AppState,
    document_id: Option<Uuid>,
    destination: Option<PathBuf>,
    cancelled: bool,
) -> ActionOutcome {
    let document_id = document_id
        .or(state.open_document)
        .or_else(|| state.last_sign.as_ref().map(|s| s.document_id))
        .ok_or("missing_document_id")?;
    let record = state.workspace.get(document_id).map_err(|e| e.to_string())?;
    let source = record
        .signed_path
        .clone()
        .ok_or("document_not_signed")?;
    let destination = if cancelled {
        None
    } else {
        let picked = destination.or_else(|| state.config.downloads_dir.clone());
        Some(picked.ok_or("missing_destination")?)
    };
    enqueue(state, WorkerJob::Save { source, destination })?;
    Ok(None)
}

#[derive(Serialize)]
struct VerifyPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    path: &'a str,
    #[serde(flatten)]
    report: &'a signing::VerifyReport,
}

fn handle_verify_signed(state: &mut AppState, document_id: Option<Uuid>, path: Option<String>) -> ActionOutcome {
    let path = match (path, document_id) {
        (Some(path), _) => PathBuf::from(path),
        (None, Some(id)) => state
            .workspace
            .get(id)
            .map_err(|e| e.to_string())?
            .signed_path
            .clone()
            .ok_or("document_not_signed")?,
        (None, None) => return Err("missing_path".into()),
    };
    let report = signing::verify(&path);
    let display = path.to_string_lossy();
    let payload = serde_json::to_value(VerifyPayload {
        kind: "VerifyResult",
        path: &display,
        report: &report,
    })
    .map_err(|e| format!("verify_encode_failed:{e}"))?;
    state.last_verify = Some(report);
    Ok(Some(payload))
}

fn apply_worker_results(state: &mut AppState) {
    let results = STATE.drain_worker_results();
    if results.is_empty() {
        return;
    }

    for result in results {
        match result {
            WorkerResult::Render(batch) => apply_render_result(state, batch),
            WorkerResult::Sign { document_id, value } => match value {
                Ok(outcome) => {
                    if let Err(e) = state
                        .workspace
                        .mark_signed(document_id, outcome.signed_path.clone(), Utc::now())
                    {
                        warn!("router: signed a document that is gone: {e}");
                    }
                    state.status = Some(format!("Signed copy saved to {}", outcome.signed_path.display()));
                    state.last_sign = Some(SignSummary {
                        document_id,
                        signed_path: outcome.signed_path,
                        sidecar_path: outcome.sidecar_path,
                        placed: outcome.placements.len(),
                        fallbacks: outcome.fallbacks,
                        skipped: outcome.skipped,
                        info: outcome.info,
                    });
                    state.loading_message = None;
                    state.last_error = None;
                }
                Err(e) => {
                    state.loading_message = None;
                    state.last_error = Some(e);
                }
            },
            WorkerResult::Save { value } => match value {
                Ok(outcome) => {
                    state.last_save = Some(outcome);
                }
                Err(e) => {
                    state.last_error = Some(e);
                }
            },
        }
    }
}

fn apply_render_result(state: &mut AppState, batch: BatchResult) {
    match state.renderer.commit(batch) {
        CommitStatus::Applied { pages } => {
            state.loading_message = None;
            if state.current_screen() == Screen::Loading {
                state.replace_current(Screen::Editor);
            }
            debug!("router: {pages} page(s) committed");
            let rendered_at = state.renderer.surfaces().first().map(|s| s.request);
            let wanted = state.renderer.request();
            if rendered_at.is_some_and(|r| r != wanted) {
                if let Err(e) = start_render(state, wanted) {
                    state.last_error = Some(e);
                }
            }
        }
        CommitStatus::Discarded => {}
        CommitStatus::Failed(err) => {
            warn!("router: render failed: {err:?}");
            state.last_error = Some(err.to_string());
            state.loading_message = None;
            if state.current_screen() == Screen::Loading {
                state.close_document();
                state.pop_screen();
            }
        }
    }
}

fn error_ui(message: &str) -> Value {
    json!({
        "type": "Column",
        "padding": 24,
        "children": [
            { "type": "Text", "text": "Error", "size": 18.0 },
            { "type": "Text", "text": message }
        ]
    })
}

fn node<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn render_ui(state: &AppState) -> Value {
    match state.current_screen() {
        Screen::Home => render_home(state),
        Screen::Loading => render_loading(state),
        Screen::Editor => render_editor(state),
    }
}

fn push_banner(children: &mut Vec<Value>, state: &AppState) {
    if let Some(err) = &state.last_error {
        children.push(node(UiText::new(&format!("Error: {err}")).size(14.0)));
    }
    if let Some(status) = &state.status {
        children.push(node(UiText::new(status).size(12.0)));
    }
}

fn push_results(children: &mut Vec<Value>, state: &AppState) {
    if let Some(sign) = &state.last_sign {
        let mut value = node(sign);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".into(), json!("SignResult"));
        }
        children.push(value);
    }
    if let Some(save) = &state.last_save {
        children.push(json!({ "type": "SaveResult", "outcome": node(save) }));
    }
    if let Some(report) = &state.last_verify {
        children.push(json!({ "type": "VerifyResult", "report": node(report) }));
    }
}

fn render_palette(children: &mut Vec<Value>, state: &AppState, placing: bool) {
    children.push(node(UiText::new("Saved signatures").size(16.0)));
    if state.palette.is_empty() {
        children.push(node(UiText::new("No signatures yet.").size(12.0)));
    }
    for saved in state.palette.iter() {
        let id = saved.id.to_string();
        let label = format!("{} ({})", saved.payload.label(), saved.payload.kind_name());
        children.push(node(UiText::new(&label)));
        if placing {
            children.push(node(
                UiButton::new("Place", "placement_arm").payload(json!({ "signature_id": id })),
            ));
        }
        children.push(node(
            UiButton::new("Remove", "signature_remove").payload(json!({ "signature_id": id })),
        ));
    }
}

fn render_home(state: &AppState) -> Value {
    let mut children = vec![node(UiText::new("SignDesk").size(22.0))];
    push_banner(&mut children, state);

    children.push(node(
        UiButton::new("Add PDF", "document_add").requires_file_picker(true),
    ));
    for doc in state.workspace.documents() {
        let id = doc.id.to_string();
        let line = if doc.signed {
            format!("{} · signed", doc.name)
        } else {
            doc.name.clone()
        };
        children.push(node(UiText::new(&line)));
        children.push(node(
            UiButton::new("Open", "document_open").payload(json!({ "document_id": id })),
        ));
        children.push(node(
            UiButton::new("Remove", "document_remove").payload(json!({ "document_id": id })),
        ));
    }

    render_palette(&mut children, state, false);
    children.push(node(UiTextInput::new("signature_text").hint("Type your name").single_line(true)));
    children.push(node(UiButton::new("Save typed signature", "signature_type")));
    children.push(node(UiButton::new("Draw signature", "signature_draw")));
    children.push(node(
        UiButton::new("Upload signature image", "signature_image").requires_file_picker(true),
    ));
    push_results(&mut children, state);

    node(UiColumn::new(children).padding(24))
}

fn render_loading(state: &AppState) -> Value {
    let message = state.loading_message.as_deref().unwrap_or("Working...");
    node(UiColumn::new(vec![node(UiProgress::new().text(message))]).padding(24))
}

fn phase_name(phase: FieldPhase) -> &'static str {
    match phase {
        FieldPhase::Placed => "placed",
        FieldPhase::Selected => "selected",
        FieldPhase::Dragging => "dragging",
        FieldPhase::Resizing => "resizing",
    }
}

fn render_editor(state: &AppState) -> Value {
    let title = state
        .open_document
        .and_then(|id| state.workspace.get(id).ok())
        .map(|d| d.name.clone())
        .unwrap_or_else(|| "Document".into());
    let mut children = vec![node(UiText::new(&title).size(20.0))];
    push_banner(&mut children, state);
    if let Some(message) = &state.loading_message {
        children.push(node(UiProgress::new().text(message)));
    }

    let request = state.renderer.request();
    children.push(node(
        UiButton::new("Zoom out", "set_scale")
            .payload(json!({ "scale": (request.scale / ZOOM_STEP).max(MIN_SCALE) })),
    ));
    children.push(node(
        UiButton::new("Zoom in", "set_scale")
            .payload(json!({ "scale": (request.scale * ZOOM_STEP).min(MAX_SCALE) })),
    ));
    if state.editor.armed().is_some() {
        children.push(node(UiText::new("Click a page to place the signature.").size(12.0)));
        children.push(node(UiButton::new("Cancel placement", "placement_cancel")));
    }
    render_palette(&mut children, state, true);

    let now = Instant::now();
    if let Some(document_id) = state.open_document {
        for surface in state.renderer.surfaces() {
            let metrics = surface.metrics(None, None);
            let overlays: Vec<Value> = state
                .editor
                .fields_on_page(document_id, surface.page_number())
                .filter_map(|field| {
                    let rect = state.editor.project(field.id, &metrics)?;
                    let phase = state.editor.phase_of(field.id).unwrap_or(FieldPhase::Placed);
                    Some(node(
                        FieldOverlay::new(field.id.to_string(), rect.left, rect.top, rect.width, rect.height)
                            .phase(phase_name(phase))
                            .signature(field.signature.kind_name(), field.signature.label())
                            .controls_visible(state.editor.controls_visible(field.id, now)),
                    ))
                })
                .collect();
            children.push(node(
                UiPageSurface::new(
                    surface.page_number(),
                    (surface.css_width, surface.css_height),
                    surface.backing_size(),
                )
                .request(surface.request.scale, surface.request.device_pixel_ratio)
                .placement_armed(state.editor.armed().is_some())
                .children(overlays),
            ));
        }
    }

    children.push(node(UiButton::new("Finish signing", "finish_signing")));
    push_results(&mut children, state);
    children.push(node(UiButton::new("Back", "back")));
    node(UiColumn::new(children).padding(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::geometry::PdfRect;
    use crate::features::renderer::{
        default_rasterizer, test_pdf, DecodedDocument, PageGeometry, MAX_BACKING_SIDE,
    };
    use image::RgbaImage;
    use std::time::Duration;
    use tempfile::TempDir;

    fn make_command(action: &str) -> Command {
        Command {
            action: action.into(),
            ..Command::default()
        }
    }

    fn reset_state() {
        handle_command(make_command("reset")).expect("reset command should succeed");
        TEST_FORCE_ASYNC_WORKER.store(false, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(0, Ordering::SeqCst);
        install_rasterizer(default_rasterizer(None));
        let mut scale = make_command("set_scale");
        scale.scale = Some(0.75);
        scale.device_pixel_ratio = Some(1.0);
        handle_command(scale).expect("scale should apply");
        STATE.ui_lock().last_error = None;
    }

    fn extract_texts(ui: &Value) -> Vec<String> {
        fn walk(node: &Value, acc: &mut Vec<String>) {
            if let Some(text) = node.get("text").and_then(|t| t.as_str()) {
                acc.push(text.to_string());
            }
            if let Some(children) = node.get("children").and_then(|c| c.as_array()) {
                for child in children {
                    walk(child, acc);
                }
            }
        }

        let mut out = Vec::new();
        walk(ui, &mut out);
        out
    }

    fn assert_contains_text(ui: &Value, needle: &str) {
        let texts = extract_texts(ui);
        assert!(
            texts.iter().any(|t| t.contains(needle)),
            "expected UI to contain text with `{needle}`, found: {texts:?}"
        );
    }

    fn nodes_of_type<'a>(ui: &'a Value, kind: &str) -> Vec<&'a Value> {
        fn walk<'a>(node: &'a Value, kind: &str, acc: &mut Vec<&'a Value>) {
            if node.get("type").and_then(|t| t.as_str()) == Some(kind) {
                acc.push(node);
            }
            if let Some(children) = node.get("children").and_then(|c| c.as_array()) {
                for child in children {
                    walk(child, kind, acc);
                }
            }
        }
        let mut out = Vec::new();
        walk(ui, kind, &mut out);
        out
    }

    fn write_pdf(dir: &TempDir, name: &str, pages: usize) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, test_pdf::build(&vec![0; pages])).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn add_document(path: &str) -> Uuid {
        let mut add = make_command("document_add");
        add.path = Some(path.into());
        handle_command(add).expect("add should dispatch");
        let state = STATE.ui_lock();
        assert!(state.last_error.is_none(), "{:?}", state.last_error);
        state.workspace.documents().last().unwrap().id
    }

    fn open_document(id: Uuid) -> Value {
        let mut open = make_command("document_open");
        open.document_id = Some(id.to_string());
        handle_command(open).expect("open should dispatch")
    }

    fn typed_signature() -> Uuid {
        let mut cmd = make_command("signature_type");
        cmd.bindings = Some(HashMap::from([("signature_text".into(), "Jo Doe".into())]));
        handle_command(cmd).expect("signature should dispatch");
        let state = STATE.ui_lock();
        state.palette.iter().last().unwrap().id
    }

    fn drawn_signature() -> Uuid {
        let mut cmd = make_command("signature_draw");
        cmd.strokes = Some(vec![vec![[20.0, 100.0], [120.0, 40.0], [220.0, 110.0]]]);
        cmd.label = Some("Initials".into());
        handle_command(cmd).expect("signature should dispatch");
        let state = STATE.ui_lock();
        assert!(state.last_error.is_none(), "{:?}", state.last_error);
        state.palette.iter().last().unwrap().id
    }

    fn pointer(action: &str, x: f64, y: f64) -> Command {
        let mut cmd = make_command(action);
        cmd.x = Some(x);
        cmd.y = Some(y);
        cmd
    }

    fn only_field() -> (Uuid, PdfRect) {
        let state = STATE.ui_lock();
        let field = &state.editor.fields()[0];
        (field.id, field.rect)
    }

    #[test]
    fn unknown_action_is_reported() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let ui = handle_command(make_command("bogus")).unwrap();
        assert_contains_text(&ui, "unknown_action:bogus");
    }

    #[test]
    fn malformed_json_answers_with_error_ui() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let out: Value = serde_json::from_str(&dispatch("{not json")).unwrap();
        assert_contains_text(&out, "invalid_json");
    }

    #[test]
    fn opening_a_document_renders_every_page() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let id = add_document(&write_pdf(&dir, "two.pdf", 2));

        let ui = open_document(id);
        let surfaces = nodes_of_type(&ui, "PageSurface");
        assert_eq!(surfaces.len(), 2);
        assert_eq!(surfaces[0]["css_width"].as_f64(), Some(459.0));
        assert_eq!(surfaces[0]["backing_width"].as_u64(), Some(459));
        assert_eq!(STATE.ui_lock().current_screen(), Screen::Editor);
    }

    #[test]
    fn non_pdf_intake_is_rejected() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        let mut add = make_command("document_add");
        add.path = Some(path.to_string_lossy().into_owned());
        let ui = handle_command(add).unwrap();
        assert_contains_text(&ui, "unsupported_document");
        assert!(STATE.ui_lock().workspace.documents().is_empty());
    }

    #[test]
    fn place_resize_sign_and_verify() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        STATE.ui_lock().config.output_dir = Some(out_dir.path().to_path_buf());

        let doc = add_document(&write_pdf(&dir, "lease.pdf", 2));
        open_document(doc);
        let signature = drawn_signature();

        let mut arm = make_command("placement_arm");
        arm.signature_id = Some(signature.to_string());
        handle_command(arm).unwrap();
        let mut click = pointer("page_click", 100.0, 100.0);
        click.page = Some(1);
        handle_command(click).unwrap();

        let (field_id, placed) = only_field();
        let center = placed.center();
        assert!((center.x - 100.0 / 0.75).abs() < 1e-6);
        assert!((center.y - 100.0 / 0.75).abs() < 1e-6);

        let handle_x = (placed.x + placed.width) * 0.75;
        let handle_y = (placed.y + placed.height) * 0.75;
        let mut down = pointer("field_handle_down", handle_x, handle_y);
        down.field_id = Some(field_id.to_string());
        down.corner = Some("bottom_right".into());
        handle_command(down).unwrap();
        handle_command(pointer("pointer_move", handle_x + 40.0, handle_y + 20.0)).unwrap();
        handle_command(make_command("pointer_up")).unwrap();

        let (_, resized) = only_field();
        assert!((resized.width - placed.width - 40.0 / 0.75).abs() < 1e-6);
        assert!((resized.height - placed.height - 20.0 / 0.75).abs() < 1e-6);

        let ui = handle_command(make_command("finish_signing")).unwrap();
        let results = nodes_of_type(&ui, "SignResult");
        assert_eq!(results.len(), 1, "{ui}");
        assert_eq!(results[0]["placed"], 1);
        assert_eq!(results[0]["fallbacks"], 0);

        let signed_path = {
            let state = STATE.ui_lock();
            assert!(state.last_error.is_none(), "{:?}", state.last_error);
            let record = state.workspace.get(doc).unwrap();
            assert!(record.signed);
            record.signed_path.clone().unwrap()
        };
        assert!(signed_path.starts_with(out_dir.path()));

        let mut verify = make_command("verify_signed");
        verify.document_id = Some(doc.to_string());
        let report = handle_command(verify).unwrap();
        assert_eq!(report["type"], "VerifyResult");
        assert_eq!(report["isValid"], true);

        STATE.ui_lock().config.output_dir = None;
    }

    #[test]
    fn overlays_follow_zoom_without_moving_the_field() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "zoom.pdf", 1));
        open_document(doc);
        let signature = typed_signature();
        let mut arm = make_command("placement_arm");
        arm.signature_id = Some(signature.to_string());
        handle_command(arm).unwrap();
        let mut click = pointer("page_click", 200.0, 300.0);
        click.page = Some(1);
        handle_command(click).unwrap();
        let (_, before) = only_field();

        let mut zoom = make_command("set_scale");
        zoom.scale = Some(1.5);
        let ui = handle_command(zoom).unwrap();
        let (_, after) = only_field();
        assert_eq!(before, after);

        let overlay = nodes_of_type(&ui, "FieldOverlay")[0].clone();
        let left = overlay["left"].as_f64().unwrap();
        let width = overlay["width"].as_f64().unwrap();
        let center_x = left + width / 2.0;
        assert!((center_x - 200.0 * 2.0).abs() <= 1.0, "{center_x}");
    }

    #[test]
    fn pointer_events_before_render_are_ignored() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "one.pdf", 1));
        open_document(doc);
        let signature = typed_signature();
        let mut arm = make_command("placement_arm");
        arm.signature_id = Some(signature.to_string());
        handle_command(arm).unwrap();

        let mut click = pointer("page_click", 10.0, 10.0);
        click.page = Some(7);
        handle_command(click).unwrap();
        let state = STATE.ui_lock();
        assert!(state.editor.fields().is_empty());
        assert!(state.editor.armed().is_some());
        assert!(state.last_error.is_none());
    }

    #[test]
    fn removing_the_open_document_cascades() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "gone.pdf", 1));
        open_document(doc);
        let signature = typed_signature();
        let mut arm = make_command("placement_arm");
        arm.signature_id = Some(signature.to_string());
        handle_command(arm).unwrap();
        let mut click = pointer("page_click", 50.0, 50.0);
        click.page = Some(1);
        handle_command(click).unwrap();

        let mut remove = make_command("document_remove");
        remove.document_id = Some(doc.to_string());
        handle_command(remove).unwrap();

        let state = STATE.ui_lock();
        assert!(state.editor.fields().is_empty());
        assert!(state.open_document.is_none());
        assert!(state.renderer.document().is_none());
        assert_eq!(state.current_screen(), Screen::Home);
    }

    #[test]
    fn finishing_without_fields_is_an_error() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "empty.pdf", 1));
        open_document(doc);
        let ui = handle_command(make_command("finish_signing")).unwrap();
        assert_contains_text(&ui, "no_fields_to_sign");
    }

    #[test]
    fn cancelled_save_is_not_an_error() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("signed.pdf");
        std::fs::write(&source, test_pdf::two_pages()).unwrap();
        let doc = add_document(source.to_str().unwrap());
        STATE
            .ui_lock()
            .workspace
            .mark_signed(doc, source.clone(), Utc::now())
            .unwrap();

        let mut save = make_command("save_signed");
        save.document_id = Some(doc.to_string());
        save.cancelled = Some(true);
        let ui = handle_command(save).unwrap();
        assert_eq!(nodes_of_type(&ui, "SaveResult")[0]["outcome"]["status"], "cancelled");
        assert!(STATE.ui_lock().last_error.is_none());
    }

    #[test]
    fn surface_image_returns_png_payload() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "img.pdf", 1));
        open_document(doc);
        let mut cmd = make_command("surface_image");
        cmd.page = Some(1);
        let payload = handle_command(cmd).unwrap();
        assert_eq!(payload["type"], "SurfaceImage");
        let png = B64.decode(payload["png_base64"].as_str().unwrap()).unwrap();
        let img = image::load_from_memory(&png).unwrap();
        assert_eq!(img.width() as u64, payload["backing_width"].as_u64().unwrap());
    }

    #[test]
    fn back_from_editor_releases_the_document() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "back.pdf", 1));
        open_document(doc);
        handle_command(make_command("back")).unwrap();
        let state = STATE.ui_lock();
        assert_eq!(state.current_screen(), Screen::Home);
        assert!(state.renderer.document().is_none());
        assert!(state.renderer.surfaces().is_empty());
    }

    #[test]
    fn loading_runs_off_the_dispatch_thread() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "slow.pdf", 2));

        TEST_FORCE_ASYNC_WORKER.store(true, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(200, Ordering::SeqCst);

        let start = Instant::now();
        let ui = open_document(doc);
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "dispatch held the state mutex for too long"
        );
        assert_eq!(nodes_of_type(&ui, "Progress").len(), 1);
        assert!(
            STATE.ui_try_lock().is_some(),
            "state mutex should be free while worker runs"
        );

        std::thread::sleep(Duration::from_millis(400));
        let refreshed = handle_command(make_command("refresh")).unwrap();
        assert_eq!(nodes_of_type(&refreshed, "PageSurface").len(), 2);

        TEST_FORCE_ASYNC_WORKER.store(false, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(0, Ordering::SeqCst);
    }

    #[test]
    fn newer_load_supersedes_an_in_flight_one() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let first = add_document(&write_pdf(&dir, "first.pdf", 3));
        let second = add_document(&write_pdf(&dir, "second.pdf", 1));

        TEST_FORCE_ASYNC_WORKER.store(true, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(100, Ordering::SeqCst);
        open_document(first);
        open_document(second);

        std::thread::sleep(Duration::from_millis(500));
        let refreshed = handle_command(make_command("refresh")).unwrap();
        assert_eq!(nodes_of_type(&refreshed, "PageSurface").len(), 1);
        {
            let state = STATE.ui_lock();
            assert_eq!(state.open_document, Some(second));
            assert_eq!(state.renderer.document_id(), Some(second));
        }

        TEST_FORCE_ASYNC_WORKER.store(false, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(0, Ordering::SeqCst);
    }

    #[test]
    fn extreme_zoom_keeps_clicks_on_the_clicked_point() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "huge.pdf", 1));
        open_document(doc);

        let mut zoom = make_command("set_scale");
        zoom.scale = Some(12.0);
        zoom.device_pixel_ratio = Some(2.0);
        let ui = handle_command(zoom).unwrap();
        let surface = nodes_of_type(&ui, "PageSurface")[0].clone();
        let backing_height = surface["backing_height"].as_f64().unwrap();
        let css_height = surface["css_height"].as_f64().unwrap();
        assert!(backing_height <= MAX_BACKING_SIDE);
        assert!((backing_height / css_height - 2.0).abs() < 1e-3, "{backing_height} vs {css_height}");

        let scale = STATE.ui_lock().renderer.request().scale;
        assert!(scale < 12.0);
        let signature = typed_signature();
        let mut arm = make_command("placement_arm");
        arm.signature_id = Some(signature.to_string());
        handle_command(arm).unwrap();
        let mut click = pointer("page_click", 1200.0, 1200.0);
        click.page = Some(1);
        handle_command(click).unwrap();
        let (_, rect) = only_field();
        let center = rect.center();
        assert!((center.x - 1200.0 / scale).abs() < 0.05, "{center:?}");
        assert!((center.y - 1200.0 / scale).abs() < 0.05, "{center:?}");
    }

    #[test]
    fn zoom_requested_during_a_load_is_rendered_after_it() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "zoom-while-loading.pdf", 2));

        TEST_FORCE_ASYNC_WORKER.store(true, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(150, Ordering::SeqCst);
        open_document(doc);
        let mut zoom = make_command("set_scale");
        zoom.scale = Some(1.5);
        handle_command(zoom).unwrap();

        std::thread::sleep(Duration::from_millis(400));
        handle_command(make_command("refresh")).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        let refreshed = handle_command(make_command("refresh")).unwrap();

        let surfaces = nodes_of_type(&refreshed, "PageSurface");
        assert_eq!(surfaces.len(), 2);
        assert_eq!(surfaces[0]["css_width"].as_f64(), Some(918.0));
        {
            let state = STATE.ui_lock();
            assert!(state.last_error.is_none(), "{:?}", state.last_error);
            assert!(state.renderer.surfaces().iter().all(|s| s.request.scale == 1.5));
        }

        TEST_FORCE_ASYNC_WORKER.store(false, Ordering::SeqCst);
        TEST_WORKER_DELAY_MS.store(0, Ordering::SeqCst);
    }

    struct PanickingRasterizer;

    impl PageRasterizer for PanickingRasterizer {
        fn rasterize(
            &self,
            _document: &DecodedDocument,
            _page: &PageGeometry,
            _request: &RenderRequest,
            _target: &mut RgbaImage,
        ) -> Result<(), RenderError> {
            panic!("rasterizer blew up");
        }
    }

    #[test]
    fn worker_survives_a_panicking_job() {
        let _guard = TEST_MUTEX.lock().unwrap();
        reset_state();
        let dir = TempDir::new().unwrap();
        let doc = add_document(&write_pdf(&dir, "panics.pdf", 1));

        TEST_FORCE_ASYNC_WORKER.store(true, Ordering::SeqCst);
        install_rasterizer(Arc::new(PanickingRasterizer));
        open_document(doc);
        std::thread::sleep(Duration::from_millis(300));
        let ui = handle_command(make_command("refresh")).unwrap();
        assert_contains_text(&ui, "worker_panic");
        assert_eq!(STATE.ui_lock().current_screen(), Screen::Home);

        install_rasterizer(default_rasterizer(None));
        STATE.ui_lock().last_error = None;
        open_document(doc);
        std::thread::sleep(Duration::from_millis(300));
        let refreshed = handle_command(make_command("refresh")).unwrap();
        assert_eq!(nodes_of_type(&refreshed, "PageSurface").len(), 1);

        TEST_FORCE_ASYNC_WORKER.store(false, Ordering::SeqCst);
    }
}
