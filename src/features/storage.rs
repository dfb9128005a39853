use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
pub fn test_env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn parse_file_uri_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if uri.starts_with('/') {
        return Some(PathBuf::from(uri));
    }
    None
}

pub fn preferred_temp_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(custom) = std::env::var("SIGNDESK_TEMP_DIR") {
        candidates.push(PathBuf::from(custom));
    }
    if let Ok(cache) = std::env::var("XDG_CACHE_HOME") {
        candidates.push(PathBuf::from(cache).join("signdesk"));
    }
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(tmpdir));
    }
    candidates.push(std::env::temp_dir());

    first_existing_dir(candidates).unwrap_or_else(std::env::temp_dir)
}

pub fn downloads_dir() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(dir) = std::env::var("XDG_DOWNLOAD_DIR") {
        candidates.push(PathBuf::from(dir));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join("Downloads"));
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        candidates.push(PathBuf::from(profile).join("Downloads"));
    }
    first_existing_dir(candidates)
}

fn first_existing_dir(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|dir| {
        std::fs::metadata(dir)
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    })
}

/// Directory a signed copy of `source` is written to: the configured output
/// directory, else the source's own folder, else the temp dir.
pub fn output_dir_for(source: &str, configured: Option<&Path>, temp_dir: &Path) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    if let Some(path) = parse_file_uri_path(source).or_else(|| Some(PathBuf::from(source))) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if parent.is_dir() {
                return parent.to_path_buf();
            }
        }
    }
    temp_dir.to_path_buf()
}

/// `<dir>/<stem>_signed_<millis>.pdf`. A fresh name per call keeps repeated
/// signing from overwriting earlier output.
pub fn signed_output_path(dir: &Path, source: &str) -> PathBuf {
    let stem = Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut candidate = dir.join(format!("{stem}_signed_{millis}.pdf"));
    let mut bump = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}_signed_{millis}_{bump}.pdf"));
        bump += 1;
    }
    candidate
}

/// Sidecar metadata path for a signed file: `<signed>.json`.
pub fn sidecar_path(signed: &Path) -> PathBuf {
    let mut raw = signed.as_os_str().to_os_string();
    raw.push(".json");
    PathBuf::from(raw)
}

pub fn read_document_bytes(path: &str) -> std::io::Result<Vec<u8>> {
    let resolved = parse_file_uri_path(path).unwrap_or_else(|| PathBuf::from(path));
    std::fs::read(resolved)
}
