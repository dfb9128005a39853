//! Field lifecycle: placement, selection, drag, resize and deletion.
//!
//! Fields store their rectangle in PDF points only. Every gesture step takes
//! the surface metrics measured for that event, so a zoom or window resize in
//! the middle of a drag is picked up on the next move.

use crate::error::EditorError;
use crate::features::geometry::{
    dragged_origin, resized_rect, Corner, PdfRect, PointerPoint, ScreenRect, SurfaceMetrics,
};
use crate::features::signature::SignaturePayload;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const HOVER_SHOW_DELAY: Duration = Duration::from_millis(2500);
pub const HOVER_LINGER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub id: Uuid,
    pub document_id: Uuid,
    /// 1-based.
    pub page_number: u32,
    pub rect: PdfRect,
    pub signature: SignaturePayload,
}

/// Frozen copy of a field handed to the compositor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSnapshot {
    pub field_id: Uuid,
    pub page_number: u32,
    pub rect: PdfRect,
    pub signature: SignaturePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPhase {
    Placed,
    Selected,
    Dragging,
    Resizing,
}

#[derive(Debug, Clone, Copy)]
enum Gesture {
    Drag {
        field_id: Uuid,
        start_rect: PdfRect,
        grab_offset: (f64, f64),
    },
    Resize {
        field_id: Uuid,
        start_rect: PdfRect,
        corner: Corner,
        start_pointer: PointerPoint,
    },
}

impl Gesture {
    fn field_id(&self) -> Uuid {
        match self {
            Gesture::Drag { field_id, .. } | Gesture::Resize { field_id, .. } => *field_id,
        }
    }

    fn start_rect(&self) -> PdfRect {
        match self {
            Gesture::Drag { start_rect, .. } | Gesture::Resize { start_rect, .. } => *start_rect,
        }
    }
}

/// Delayed show / lingering hide of a field's hover controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct HoverTimer {
    entered: Option<Instant>,
    left: Option<Instant>,
    visible_at_leave: bool,
}

impl HoverTimer {
    pub fn enter(&mut self, now: Instant) {
        if self.entered.is_none() || self.left.is_some() {
            // Re-entering during the linger keeps the controls up.
            let still_visible = self.visible(now);
            let backdated = now.checked_sub(HOVER_SHOW_DELAY).filter(|_| still_visible);
            self.entered = Some(backdated.unwrap_or(now));
        }
        self.left = None;
        self.visible_at_leave = false;
    }

    pub fn leave(&mut self, now: Instant) {
        if self.left.is_none() {
            self.visible_at_leave = self.visible(now);
            self.left = Some(now);
        }
    }

    pub fn visible(&self, now: Instant) -> bool {
        match (self.entered, self.left) {
            (Some(entered), None) => now.saturating_duration_since(entered) >= HOVER_SHOW_DELAY,
            (_, Some(left)) => {
                self.visible_at_leave && now.saturating_duration_since(left) < HOVER_LINGER
            }
            (None, None) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct FieldEditor {
    fields: Vec<Field>,
    armed: Option<SignaturePayload>,
    selected: Option<Uuid>,
    gesture: Option<Gesture>,
    hover: HashMap<Uuid, HoverTimer>,
}

impl FieldEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters placement mode with a copy of `payload`.
    pub fn arm_placement(&mut self, payload: SignaturePayload) {
        self.armed = Some(payload);
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    pub fn armed(&self) -> Option<&SignaturePayload> {
        self.armed.as_ref()
    }

    /// Places a default-sized field centered on `click`. `Ok(None)` means the
    /// surface is not laid out yet; placement mode stays armed for a retry.
    pub fn place(
        &mut self,
        document_id: Uuid,
        page_number: u32,
        metrics: &SurfaceMetrics,
        click: PointerPoint,
    ) -> Result<Option<Uuid>, EditorError> {
        if self.armed.is_none() {
            return Err(EditorError::NotArmed);
        }
        let Some(projection) = metrics.projection() else {
            debug!("placement: page {page_number} not ready, click ignored");
            return Ok(None);
        };
        let Some(signature) = self.armed.take() else {
            return Err(EditorError::NotArmed);
        };
        let field = Field {
            id: Uuid::new_v4(),
            document_id,
            page_number,
            rect: projection.placement_rect(click),
            signature,
        };
        let id = field.id;
        debug!(
            "placement: field {id} on page {page_number} at ({:.1}, {:.1})",
            field.rect.x, field.rect.y
        );
        self.fields.push(field);
        self.selected = Some(id);
        Ok(Some(id))
    }

    pub fn select(&mut self, field_id: Uuid) -> Result<(), EditorError> {
        self.field(field_id)?;
        self.selected = Some(field_id);
        Ok(())
    }

    pub fn deselect(&mut self) {
        if self.gesture.is_none() {
            self.selected = None;
        }
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    /// Pointer-down on a field body. Returns `false` when the surface is not
    /// ready, in which case no gesture starts.
    pub fn begin_drag(
        &mut self,
        field_id: Uuid,
        metrics: &SurfaceMetrics,
        pointer: PointerPoint,
    ) -> Result<bool, EditorError> {
        if self.gesture.is_some() {
            return Err(EditorError::GestureInProgress);
        }
        let rect = self.field(field_id)?.rect;
        self.selected = Some(field_id);
        let Some(projection) = metrics.projection() else {
            return Ok(false);
        };
        let screen = projection.rect_to_screen(&rect);
        self.gesture = Some(Gesture::Drag {
            field_id,
            start_rect: rect,
            grab_offset: (pointer.x - screen.left, pointer.y - screen.top),
        });
        Ok(true)
    }

    /// Pointer-down on one of a field's corner handles.
    pub fn begin_resize(
        &mut self,
        field_id: Uuid,
        corner: Corner,
        metrics: &SurfaceMetrics,
        pointer: PointerPoint,
    ) -> Result<bool, EditorError> {
        if self.gesture.is_some() {
            return Err(EditorError::GestureInProgress);
        }
        let rect = self.field(field_id)?.rect;
        self.selected = Some(field_id);
        if metrics.projection().is_none() {
            return Ok(false);
        }
        self.gesture = Some(Gesture::Resize {
            field_id,
            start_rect: rect,
            corner,
            start_pointer: pointer,
        });
        Ok(true)
    }

    /// Applies a pointer move to the active gesture. Returns the field that
    /// changed, or `None` when nothing is held or the surface is not ready.
    pub fn pointer_move(&mut self, metrics: &SurfaceMetrics, pointer: PointerPoint) -> Option<Uuid> {
        let gesture = self.gesture?;
        let projection = metrics.projection()?;
        let field_id = gesture.field_id();
        let field = self.fields.iter_mut().find(|f| f.id == field_id)?;
        field.rect = match gesture {
            Gesture::Drag { grab_offset, .. } => {
                let origin = dragged_origin(&projection, pointer, grab_offset);
                PdfRect::new(origin.x, origin.y, field.rect.width, field.rect.height)
            }
            Gesture::Resize {
                start_rect,
                corner,
                start_pointer,
                ..
            } => resized_rect(&projection, &start_rect, corner, start_pointer, pointer),
        };
        Some(field_id)
    }

    /// Ends whatever gesture is active. Always leaves the editor with no
    /// gesture, even if none was running or its field is gone.
    pub fn pointer_up(&mut self) -> Option<Uuid> {
        self.gesture.take().map(|g| g.field_id())
    }

    /// Abandons the active gesture and restores the field's rectangle.
    pub fn cancel_gesture(&mut self) -> Option<Uuid> {
        let gesture = self.gesture.take()?;
        let field_id = gesture.field_id();
        let field = self.fields.iter_mut().find(|f| f.id == field_id)?;
        field.rect = gesture.start_rect();
        Some(field_id)
    }

    pub fn delete(&mut self, field_id: Uuid) -> Result<Field, EditorError> {
        let index = self
            .fields
            .iter()
            .position(|f| f.id == field_id)
            .ok_or(EditorError::UnknownField(field_id))?;
        if self.gesture.map(|g| g.field_id()) == Some(field_id) {
            self.gesture = None;
        }
        if self.selected == Some(field_id) {
            self.selected = None;
        }
        self.hover.remove(&field_id);
        Ok(self.fields.remove(index))
    }

    /// Drops every field of a removed document. Returns how many went.
    pub fn remove_document_fields(&mut self, document_id: Uuid) -> usize {
        let doomed: Vec<Uuid> = self
            .fields
            .iter()
            .filter(|f| f.document_id == document_id)
            .map(|f| f.id)
            .collect();
        for id in &doomed {
            let _ = self.delete(*id);
        }
        doomed.len()
    }

    /// On-screen rectangle of a field for the given measurement.
    pub fn project(&self, field_id: Uuid, metrics: &SurfaceMetrics) -> Option<ScreenRect> {
        let field = self.fields.iter().find(|f| f.id == field_id)?;
        Some(metrics.projection()?.rect_to_screen(&field.rect))
    }

    pub fn phase_of(&self, field_id: Uuid) -> Option<FieldPhase> {
        self.fields.iter().find(|f| f.id == field_id)?;
        let phase = match self.gesture {
            Some(Gesture::Drag { field_id: held, .. }) if held == field_id => FieldPhase::Dragging,
            Some(Gesture::Resize { field_id: held, .. }) if held == field_id => FieldPhase::Resizing,
            _ if self.selected == Some(field_id) => FieldPhase::Selected,
            _ => FieldPhase::Placed,
        };
        Some(phase)
    }

    pub fn gesture_field(&self) -> Option<Uuid> {
        self.gesture.map(|g| g.field_id())
    }

    pub fn hover(&mut self, field_id: Uuid, inside: bool, now: Instant) -> Result<(), EditorError> {
        self.field(field_id)?;
        let timer = self.hover.entry(field_id).or_default();
        if inside {
            timer.enter(now);
        } else {
            timer.leave(now);
        }
        Ok(())
    }

    /// Handles and delete button show after a hover delay, and always while a
    /// gesture holds the field.
    pub fn controls_visible(&self, field_id: Uuid, now: Instant) -> bool {
        if self.gesture_field() == Some(field_id) {
            return true;
        }
        self.hover.get(&field_id).is_some_and(|t| t.visible(now))
    }

    pub fn field(&self, field_id: Uuid) -> Result<&Field, EditorError> {
        self.fields
            .iter()
            .find(|f| f.id == field_id)
            .ok_or(EditorError::UnknownField(field_id))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn fields_on_page(&self, document_id: Uuid, page_number: u32) -> impl Iterator<Item = &Field> {
        self.fields
            .iter()
            .filter(move |f| f.document_id == document_id && f.page_number == page_number)
    }

    /// Immutable snapshot of a document's fields, ordered by page and then by
    /// placement order.
    pub fn finalize(&self, document_id: Uuid) -> Vec<FieldSnapshot> {
        let mut snapshots: Vec<FieldSnapshot> = self
            .fields
            .iter()
            .filter(|f| f.document_id == document_id)
            .map(|f| FieldSnapshot {
                field_id: f.id,
                page_number: f.page_number,
                rect: f.rect,
                signature: f.signature.clone(),
            })
            .collect();
        snapshots.sort_by_key(|s| s.page_number);
        snapshots
    }
}
