#[cfg(test)]
mod tests {
    use crate::ui::{Button, FieldOverlay, PageSurface, TextInput};
    use serde_json::json;

    #[test]
    fn page_surface_serializes_both_sizes() {
        let surface = PageSurface::new(2, (459.0, 594.0), (918, 1188))
            .request(0.75, 2.0)
            .placement_armed(true)
            .children(vec![json!({"type": "FieldOverlay"})]);
        let val = serde_json::to_value(surface).unwrap();
        assert_eq!(val.get("type").and_then(|v| v.as_str()), Some("PageSurface"));
        assert_eq!(val.get("css_width").and_then(|v| v.as_f64()), Some(459.0));
        assert_eq!(val.get("backing_height").and_then(|v| v.as_u64()), Some(1188));
        assert_eq!(val.get("placement_armed").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(val["children"].as_array().map(|c| c.len()), Some(1));
    }

    #[test]
    fn field_overlay_carries_phase_and_signature() {
        let overlay = FieldOverlay::new("f1".into(), 10.0, 20.0, 150.0, 60.0)
            .phase("selected")
            .signature("type", "Jo Doe")
            .controls_visible(true);
        let val = serde_json::to_value(overlay).unwrap();
        assert_eq!(val.get("phase").and_then(|v| v.as_str()), Some("selected"));
        assert_eq!(val.get("signature_kind").and_then(|v| v.as_str()), Some("type"));
        assert_eq!(val.get("controls_visible").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn button_payload_is_optional() {
        let plain = serde_json::to_value(Button::new("Back", "back")).unwrap();
        assert!(plain.get("payload").is_none());
        let open = Button::new("Open", "document_open").payload(json!({"document_id": "x"}));
        let val = serde_json::to_value(open).unwrap();
        assert_eq!(val["payload"]["document_id"], "x");
    }

    #[test]
    fn text_input_serializes_hint() {
        let input = TextInput::new("signature_text").hint("Your name").single_line(true);
        let val = serde_json::to_value(input).unwrap();
        assert_eq!(val.get("bind_key").and_then(|v| v.as_str()), Some("signature_text"));
        assert_eq!(val.get("single_line").and_then(|v| v.as_bool()), Some(true));
    }
}
