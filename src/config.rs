use crate::features::storage::{downloads_dir, preferred_temp_dir};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SCALE: f64 = 0.75;
pub const DEFAULT_CERT_DAYS: i64 = 365;
/// A hundred years. Longer validities are clamped.
pub const MAX_CERT_DAYS: i64 = 36_500;

/// Who the self-signed certificate record names, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerProfile {
    pub signer: String,
    pub reason: String,
    pub location: String,
    pub validity_days: i64,
}

impl Default for SignerProfile {
    fn default() -> Self {
        Self {
            signer: "SignDesk User".into(),
            reason: "Document signed electronically".into(),
            location: "Local".into(),
            validity_days: DEFAULT_CERT_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub temp_dir: PathBuf,
    /// Where signed copies land. `None` writes next to the source document.
    pub output_dir: Option<PathBuf>,
    /// Fallback download folder offered to the shell's save dialog.
    pub downloads_dir: Option<PathBuf>,
    pub signer: SignerProfile,
    pub default_scale: f64,
    pub device_pixel_ratio: f64,
    /// Directory holding the PDFium library. The system library is tried next.
    pub pdfium_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            output_dir: None,
            downloads_dir: None,
            signer: SignerProfile::default(),
            default_scale: DEFAULT_SCALE,
            device_pixel_ratio: 1.0,
            pdfium_dir: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.temp_dir = preferred_temp_dir();
        config.downloads_dir = downloads_dir();
        config
    }

    /// Builds a config from an arbitrary key lookup. Directory discovery is
    /// left to `from_env` so this stays free of filesystem probing.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let signer = SignerProfile {
            signer: non_empty("SIGNDESK_SIGNER").unwrap_or(defaults.signer.signer),
            reason: non_empty("SIGNDESK_REASON").unwrap_or(defaults.signer.reason),
            location: non_empty("SIGNDESK_LOCATION").unwrap_or(defaults.signer.location),
            validity_days: non_empty("SIGNDESK_CERT_DAYS")
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|d| *d > 0)
                .map(|d| d.min(MAX_CERT_DAYS))
                .unwrap_or(DEFAULT_CERT_DAYS),
        };

        Self {
            temp_dir: non_empty("SIGNDESK_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            output_dir: non_empty("SIGNDESK_OUTPUT_DIR").map(PathBuf::from),
            downloads_dir: None,
            signer,
            default_scale: parse_positive(non_empty("SIGNDESK_DEFAULT_SCALE"))
                .unwrap_or(DEFAULT_SCALE),
            device_pixel_ratio: parse_positive(non_empty("SIGNDESK_DEVICE_PIXEL_RATIO"))
                .unwrap_or(1.0),
            pdfium_dir: non_empty("SIGNDESK_PDFIUM_DIR").map(PathBuf::from),
        }
    }
}

fn parse_positive(raw: Option<String>) -> Option<f64> {
    raw.and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}
