use crate::error::WorkspaceError;
use crate::features::storage::parse_file_uri_path;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use uuid::Uuid;

const SNIFF_LEN: usize = 8192;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub name: String,
    /// Opaque handle handed back to the read, sign and save operations.
    pub path: String,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: Option<i64>,
    pub extension: String,
    pub signed: bool,
    pub signed_at: Option<DateTime<Utc>>,
    pub signed_path: Option<PathBuf>,
}

/// Record as described by the shell's file picker.
#[derive(Debug, Clone, Default)]
pub struct PickedFile {
    pub path: String,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub last_modified: Option<i64>,
    pub extension: Option<String>,
}

#[derive(Debug, Default)]
pub struct Workspace {
    documents: Vec<DocumentRecord>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads metadata for `picked.path`, sniffs the content and appends a
    /// record. Values the shell supplied win over what the filesystem says.
    pub fn intake(&mut self, picked: PickedFile) -> Result<&DocumentRecord, WorkspaceError> {
        let resolved = parse_file_uri_path(&picked.path).unwrap_or_else(|| PathBuf::from(&picked.path));
        let meta = fs::metadata(&resolved).map_err(|e| WorkspaceError::Unreadable(e.to_string()))?;
        if !meta.is_file() {
            return Err(WorkspaceError::Unreadable("not_a_file".into()));
        }
        sniff_pdf(&resolved)?;

        let fs_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok());
        let record = DocumentRecord {
            id: Uuid::new_v4(),
            name: picked
                .name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| file_name(&resolved))
                .unwrap_or_else(|| "document.pdf".into()),
            path: picked.path,
            size: picked.size.unwrap_or(meta.len()),
            last_modified: picked.last_modified.or(fs_modified),
            extension: picked
                .extension
                .or_else(|| extension(&resolved))
                .unwrap_or_else(|| "pdf".into())
                .trim_start_matches('.')
                .to_ascii_lowercase(),
            signed: false,
            signed_at: None,
            signed_path: None,
        };
        info!("workspace: added {} ({} bytes)", record.name, record.size);
        Ok(self.add_record(record))
    }

    pub fn add_record(&mut self, record: DocumentRecord) -> &DocumentRecord {
        self.documents.push(record);
        let last = self.documents.len() - 1;
        &self.documents[last]
    }

    pub fn mark_signed(&mut self, id: Uuid, signed_path: PathBuf, at: DateTime<Utc>) -> Result<(), WorkspaceError> {
        let record = self
            .documents
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| WorkspaceError::UnknownDocument(id.to_string()))?;
        record.signed = true;
        record.signed_at = Some(at);
        record.signed_path = Some(signed_path);
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) -> Result<DocumentRecord, WorkspaceError> {
        let index = self
            .documents
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| WorkspaceError::UnknownDocument(id.to_string()))?;
        Ok(self.documents.remove(index))
    }

    pub fn get(&self, id: Uuid) -> Result<&DocumentRecord, WorkspaceError> {
        self.documents
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| WorkspaceError::UnknownDocument(id.to_string()))
    }

    pub fn documents(&self) -> &[DocumentRecord] {
        &self.documents
    }
}

fn sniff_pdf(path: &Path) -> Result<(), WorkspaceError> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    fs::File::open(path)
        .and_then(|f| f.take(SNIFF_LEN as u64).read_to_end(&mut head))
        .map_err(|e| WorkspaceError::Unreadable(e.to_string()))?;
    match infer::get(&head) {
        Some(kind) if kind.mime_type() == "application/pdf" => Ok(()),
        Some(kind) => Err(WorkspaceError::Unsupported(kind.mime_type().to_string())),
        None => Err(WorkspaceError::Unsupported("unknown".into())),
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

fn extension(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_string)
}
