//! Burn-in compositor: draws finalized fields into a copy of the PDF.
//!
//! Existing page content is wrapped in `q … Q` so whatever graphics state it
//! leaves behind cannot skew the signatures appended after it.

use crate::error::SignError;
use crate::features::placement::FieldSnapshot;
use crate::features::renderer::{read_page_frame, resolve};
use crate::features::signature::{SignatureFont, SignaturePayload};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use uuid::Uuid;

/// Typed signatures use this share of the field height as font size.
const TEXT_HEIGHT_RATIO: f64 = 0.6;
/// Share of the field width a typed signature may span.
const TEXT_WIDTH_RATIO: f64 = 0.92;
const CAP_HEIGHT: f64 = 0.7;
const FALLBACK_FONT: SignatureFont = SignatureFont::Helvetica;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    Image,
    Text,
    Placeholder,
}

/// Where one field ended up, as the `cm` matrix of its unit box.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub field_id: Uuid,
    pub page_number: u32,
    pub kind: PlacementKind,
    pub matrix: [f64; 6],
}

#[derive(Debug)]
pub struct BurnOutput {
    pub bytes: Vec<u8>,
    pub placements: Vec<Placement>,
    /// Fields whose imagery could not be decoded and got a text placeholder.
    pub fallbacks: usize,
    /// Fields on pages the document does not have.
    pub skipped: usize,
}

pub fn burn_in(pdf_bytes: &[u8], fields: &[FieldSnapshot]) -> Result<BurnOutput, SignError> {
    let mut doc = Document::load_mem(pdf_bytes).map_err(|e| SignError::Parse(e.to_string()))?;
    let pages = doc.get_pages();

    let mut per_page: BTreeMap<u32, Vec<&FieldSnapshot>> = BTreeMap::new();
    for field in fields {
        per_page.entry(field.page_number).or_default().push(field);
    }

    let mut fonts: HashMap<&'static str, ObjectId> = HashMap::new();
    let mut placements = Vec::new();
    let mut fallbacks = 0;
    let mut skipped = 0;

    for (page_number, page_fields) in per_page {
        let Some(&page_id) = pages.get(&page_number) else {
            debug!(
                "burn-in: skipping {} field(s) on missing page {page_number}",
                page_fields.len()
            );
            skipped += page_fields.len();
            continue;
        };
        let frame = read_page_frame(&doc, page_id);
        let mut resources = effective_resources(&doc, page_id);
        let mut xobjects = sub_dictionary(&doc, &resources, b"XObject");
        let mut page_fonts = sub_dictionary(&doc, &resources, b"Font");
        let mut ops = vec![Operation::new("Q", vec![])];

        for field in page_fields {
            let rect = field.rect;
            if !(rect.width > 0.0 && rect.height > 0.0) {
                debug!("burn-in: field {} has an empty rect, skipped", field.field_id);
                skipped += 1;
                continue;
            }
            let matrix = frame.placement_matrix(&rect);
            let kind = match &field.signature {
                SignaturePayload::Draw { png, label } | SignaturePayload::Image { png, label } => {
                    match embed_image(&mut doc, png) {
                        Ok(image_id) => {
                            let name = unique_name(&xobjects, "SdSig");
                            xobjects.set(name.clone(), Object::Reference(image_id));
                            push_image_ops(&mut ops, &matrix, &name);
                            PlacementKind::Image
                        }
                        Err(e) => {
                            warn!("burn-in: field {} imagery unusable ({e}), drawing placeholder", field.field_id);
                            fallbacks += 1;
                            let font = font_name(&mut doc, &mut fonts, &mut page_fonts, FALLBACK_FONT);
                            push_text_ops(&mut ops, &matrix, rect.width, rect.height, &font, FALLBACK_FONT, placeholder_text(label));
                            PlacementKind::Placeholder
                        }
                    }
                }
                SignaturePayload::Type { text, font, .. } => {
                    let name = font_name(&mut doc, &mut fonts, &mut page_fonts, *font);
                    push_text_ops(&mut ops, &matrix, rect.width, rect.height, &name, *font, text);
                    PlacementKind::Text
                }
            };
            placements.push(Placement {
                field_id: field.field_id,
                page_number,
                kind,
                matrix,
            });
        }

        resources.set("XObject", Object::Dictionary(xobjects));
        resources.set("Font", Object::Dictionary(page_fonts));
        isolate_existing_content(&mut doc, page_id)?;
        {
            let page = doc
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(|_| SignError::PageDict)?;
            page.set("Resources", Object::Dictionary(resources));
        }
        let encoded = Content { operations: ops }
            .encode()
            .map_err(|e| SignError::Content(e.to_string()))?;
        let mut stream = b"\n".to_vec();
        stream.extend(encoded);
        doc.add_page_contents(page_id, stream)
            .map_err(|e| SignError::Content(e.to_string()))?;
    }

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes)
        .map_err(|e| SignError::Save(e.to_string()))?;
    info!(
        "burn-in: {} placed, {fallbacks} placeholder(s), {skipped} skipped",
        placements.len()
    );
    Ok(BurnOutput {
        bytes,
        placements,
        fallbacks,
        skipped,
    })
}

fn placeholder_text(label: &str) -> &str {
    if label.trim().is_empty() {
        "[signature]"
    } else {
        label
    }
}

fn push_image_ops(ops: &mut Vec<Operation>, matrix: &[f64; 6], name: &str) {
    ops.push(Operation::new("q", vec![]));
    ops.push(Operation::new("cm", matrix.iter().map(|v| Object::from(*v)).collect()));
    ops.push(Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]));
    ops.push(Operation::new("Q", vec![]));
}

/// Text is laid out in a local frame spanning the field in points, origin
/// at its bottom-left, so rotated pages need no extra handling.
fn push_text_ops(
    ops: &mut Vec<Operation>,
    matrix: &[f64; 6],
    width: f64,
    height: f64,
    font_resource: &str,
    font: SignatureFont,
    text: &str,
) {
    let chars = text.chars().count().max(1) as f64;
    let size = (height * TEXT_HEIGHT_RATIO)
        .min(width * TEXT_WIDTH_RATIO / (chars * font.average_advance()))
        .max(1.0);
    let text_width = chars * font.average_advance() * size;
    let tx = ((width - text_width) / 2.0).max(0.0);
    let ty = ((height - size * CAP_HEIGHT) / 2.0).max(0.0);
    let local = [
        matrix[0] / width,
        matrix[1] / width,
        matrix[2] / height,
        matrix[3] / height,
        matrix[4],
        matrix[5],
    ];

    ops.push(Operation::new("q", vec![]));
    ops.push(Operation::new("cm", local.iter().map(|v| Object::from(*v)).collect()));
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new(
        "Tf",
        vec![Object::Name(font_resource.as_bytes().to_vec()), Object::from(size)],
    ));
    ops.push(Operation::new("Td", vec![Object::from(tx), Object::from(ty)]));
    ops.push(Operation::new(
        "Tj",
        vec![Object::String(win_ansi(text), StringFormat::Literal)],
    ));
    ops.push(Operation::new("ET", vec![]));
    ops.push(Operation::new("Q", vec![]));
}

/// Encodes for the standard fonts' WinAnsiEncoding (cp1252). Characters it
/// cannot represent become `?`.
fn win_ansi(text: &str) -> Vec<u8> {
    text.chars().map(|c| win_ansi_byte(c).unwrap_or(b'?')).collect()
}

fn win_ansi_byte(c: char) -> Option<u8> {
    let byte = match c {
        '\u{20}'..='\u{7e}' | '\u{a0}'..='\u{ff}' => return u8::try_from(u32::from(c)).ok(),
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8a,
        '‹' => 0x8b,
        'Œ' => 0x8c,
        'Ž' => 0x8e,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9a,
        '›' => 0x9b,
        'œ' => 0x9c,
        'ž' => 0x9e,
        'Ÿ' => 0x9f,
        _ => return None,
    };
    Some(byte)
}

fn font_name(
    doc: &mut Document,
    fonts: &mut HashMap<&'static str, ObjectId>,
    page_fonts: &mut Dictionary,
    font: SignatureFont,
) -> String {
    let base = font.base_font();
    let font_id = *fonts.entry(base).or_insert_with(|| {
        doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => base,
            "Encoding" => "WinAnsiEncoding",
        })
    });
    let existing = page_fonts.iter().find_map(|(name, obj)| match obj {
        Object::Reference(id) if *id == font_id => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    });
    existing.unwrap_or_else(|| {
        let name = unique_name(page_fonts, "SdFont");
        page_fonts.set(name.clone(), Object::Reference(font_id));
        name
    })
}

fn unique_name(existing: &Dictionary, prefix: &str) -> String {
    (0..)
        .map(|n| format!("{prefix}{n}"))
        .find(|name| !existing.has(name.as_bytes()))
        .unwrap_or_else(|| prefix.to_string())
}

/// Adds an RGB image plus its alpha channel as a soft mask.
fn embed_image(doc: &mut Document, png: &[u8]) -> Result<ObjectId, String> {
    let img = image::load_from_memory(png)
        .map_err(|e| e.to_string())?
        .to_rgba8();
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err("empty_image".into());
    }
    let mut rgb = Vec::with_capacity((w * h * 3) as usize);
    let mut alpha = Vec::with_capacity((w * h) as usize);
    for pixel in img.pixels() {
        rgb.extend_from_slice(&pixel.0[..3]);
        alpha.push(pixel[3]);
    }

    let smask_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        deflate(&alpha)?,
    ));
    Ok(doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w as i64,
            "Height" => h as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
            "SMask" => smask_id,
        },
        deflate(&rgb)?,
    )))
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).map_err(|e| e.to_string())?;
    encoder.finish().map_err(|e| e.to_string())
}

/// Resources a page actually uses, including ones inherited from the page
/// tree, as an owned dictionary that can be set directly on the page.
fn effective_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    let mut current = Some(page_id);
    let mut hops = 0;
    while let Some(id) = current {
        let Ok(dict) = doc.get_object(id).and_then(Object::as_dict) else {
            break;
        };
        if let Ok(raw) = dict.get(b"Resources") {
            if let Ok(resources) = resolve(doc, raw).as_dict() {
                return resources.clone();
            }
        }
        hops += 1;
        if hops > 64 {
            break;
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    Dictionary::new()
}

fn sub_dictionary(doc: &Document, resources: &Dictionary, key: &[u8]) -> Dictionary {
    resources
        .get(key)
        .ok()
        .and_then(|raw| resolve(doc, raw).as_dict().ok())
        .cloned()
        .unwrap_or_else(Dictionary::new)
}

/// Puts a lone `q` stream in front of the page's existing content.
fn isolate_existing_content(doc: &mut Document, page_id: ObjectId) -> Result<(), SignError> {
    let existing: Vec<Object> = {
        let page = doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .map_err(|_| SignError::PageDict)?;
        match page.get(b"Contents") {
            Ok(Object::Array(items)) => items.clone(),
            Ok(Object::Reference(id)) => match doc.get_object(*id) {
                Ok(Object::Array(items)) => items.clone(),
                _ => vec![Object::Reference(*id)],
            },
            _ => Vec::new(),
        }
    };
    let open_id = doc.add_object(Stream::new(dictionary! {}, b"q\n".to_vec()));
    let mut contents = Vec::with_capacity(existing.len() + 1);
    contents.push(Object::Reference(open_id));
    contents.extend(existing);
    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|_| SignError::PageDict)?;
    page.set("Contents", Object::Array(contents));
    Ok(())
}
