use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
pub struct Text<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
}

impl<'a> Text<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            kind: "Text",
            text,
            size: None,
        }
    }

    pub fn size(mut self, size: f64) -> Self {
        self.size = Some(size);
        self
    }
}

#[derive(Serialize)]
pub struct Button<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: &'a str,
    pub action: &'a str,
    /// Extra command fields the shell sends back with the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_file_picker: Option<bool>,
}

impl<'a> Button<'a> {
    pub fn new(text: &'a str, action: &'a str) -> Self {
        Self {
            kind: "Button",
            text,
            action,
            payload: None,
            requires_file_picker: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn requires_file_picker(mut self, needs: bool) -> Self {
        self.requires_file_picker = Some(needs);
        self
    }
}

#[derive(Serialize)]
pub struct Column {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub padding: Option<u32>,
    pub children: Vec<Value>,
}

impl Column {
    pub fn new(children: Vec<Value>) -> Self {
        Self {
            kind: "Column",
            padding: None,
            children,
        }
    }

    pub fn padding(mut self, padding: u32) -> Self {
        self.padding = Some(padding);
        self
    }
}

#[derive(Serialize)]
pub struct TextInput<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub bind_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_line: Option<bool>,
}

impl<'a> TextInput<'a> {
    pub fn new(bind_key: &'a str) -> Self {
        Self {
            kind: "TextInput",
            bind_key,
            hint: None,
            single_line: None,
        }
    }

    pub fn hint(mut self, hint: &'a str) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn single_line(mut self, single: bool) -> Self {
        self.single_line = Some(single);
        self
    }
}

#[derive(Serialize)]
pub struct Progress<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<&'a str>,
}

impl<'a> Progress<'a> {
    pub fn new() -> Self {
        Self {
            kind: "Progress",
            text: None,
        }
    }

    pub fn text(mut self, text: &'a str) -> Self {
        self.text = Some(text);
        self
    }
}

/// A rendered page. The shell sizes the element to `css_*` and fetches the
/// bitmap with `surface_image`; overlays are positioned within it.
#[derive(Serialize)]
pub struct PageSurface {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub page: u32,
    pub css_width: f64,
    pub css_height: f64,
    pub backing_width: u32,
    pub backing_height: u32,
    pub scale: f64,
    pub device_pixel_ratio: f64,
    pub placement_armed: bool,
    pub children: Vec<Value>,
}

impl PageSurface {
    pub fn new(page: u32, css: (f64, f64), backing: (u32, u32)) -> Self {
        Self {
            kind: "PageSurface",
            page,
            css_width: css.0,
            css_height: css.1,
            backing_width: backing.0,
            backing_height: backing.1,
            scale: 1.0,
            device_pixel_ratio: 1.0,
            placement_armed: false,
            children: Vec::new(),
        }
    }

    pub fn request(mut self, scale: f64, device_pixel_ratio: f64) -> Self {
        self.scale = scale;
        self.device_pixel_ratio = device_pixel_ratio;
        self
    }

    pub fn placement_armed(mut self, armed: bool) -> Self {
        self.placement_armed = armed;
        self
    }

    pub fn children(mut self, children: Vec<Value>) -> Self {
        self.children = children;
        self
    }
}

/// On-screen box of a field, in pointer-space pixels of its page surface.
#[derive(Serialize)]
pub struct FieldOverlay<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub field_id: String,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub phase: &'a str,
    pub signature_kind: &'a str,
    pub label: &'a str,
    pub controls_visible: bool,
}

impl<'a> FieldOverlay<'a> {
    pub fn new(field_id: String, left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            kind: "FieldOverlay",
            field_id,
            left,
            top,
            width,
            height,
            phase: "placed",
            signature_kind: "draw",
            label: "",
            controls_visible: false,
        }
    }

    pub fn phase(mut self, phase: &'a str) -> Self {
        self.phase = phase;
        self
    }

    pub fn signature(mut self, kind: &'a str, label: &'a str) -> Self {
        self.signature_kind = kind;
        self.label = label;
        self
    }

    pub fn controls_visible(mut self, visible: bool) -> Self {
        self.controls_visible = visible;
        self
    }
}
