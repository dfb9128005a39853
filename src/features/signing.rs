//! Signing backend: the only code that writes persisted files.
//!
//! `sign` burns fields into a fresh copy next to a JSON sidecar describing a
//! self-signed certificate record. `verify` checks that sidecar's shape and
//! nothing more; there is no cryptographic signature here.

use crate::config::{SignerProfile, DEFAULT_CERT_DAYS};
use crate::error::SignError;
use crate::features::pdf::{burn_in, Placement};
use crate::features::placement::FieldSnapshot;
use crate::features::storage::{read_document_bytes, sidecar_path, signed_output_path};
use chrono::{DateTime, TimeDelta, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureFieldRecord {
    pub page_number: u32,
    /// Top-left of the field on the page viewport, in points.
    pub coordinates: Coordinates,
    pub dimensions: Dimensions,
}

/// Sidecar record written next to every signed PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signer: String,
    pub reason: String,
    pub location: String,
    pub signature_date: DateTime<Utc>,
    pub certificate_info: CertificateInfo,
    pub signature_fields: Vec<SignatureFieldRecord>,
}

impl SignatureInfo {
    pub fn build(profile: &SignerProfile, fields: &[FieldSnapshot], now: DateTime<Utc>) -> Self {
        let subject = format!("CN={}", profile.signer);
        Self {
            signer: profile.signer.clone(),
            reason: profile.reason.clone(),
            location: profile.location.clone(),
            signature_date: now,
            certificate_info: CertificateInfo {
                issuer: subject.clone(),
                subject,
                valid_from: now,
                valid_to: certificate_expiry(now, profile.validity_days),
            },
            signature_fields: fields
                .iter()
                .map(|f| SignatureFieldRecord {
                    page_number: f.page_number,
                    coordinates: Coordinates {
                        x: f.rect.x,
                        y: f.rect.y,
                    },
                    dimensions: Dimensions {
                        width: f.rect.width,
                        height: f.rect.height,
                    },
                })
                .collect(),
        }
    }
}

/// `now` plus `days`, falling back to the default window when the sum leaves
/// chrono's range.
fn certificate_expiry(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    let after = |days: i64| TimeDelta::try_days(days).and_then(|d| now.checked_add_signed(d));
    after(days.max(1)).unwrap_or_else(|| {
        warn!("signing: validity of {days} days is out of range, using {DEFAULT_CERT_DAYS}");
        after(DEFAULT_CERT_DAYS).unwrap_or(now)
    })
}

#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub signed_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub info: SignatureInfo,
    pub placements: Vec<Placement>,
    pub fallbacks: usize,
    pub skipped: usize,
}

/// Burns `fields` into a copy of the PDF at `source`. The original is never
/// touched and every call writes a new file.
pub fn sign(
    source: &str,
    fields: &[FieldSnapshot],
    profile: &SignerProfile,
    output_dir: &Path,
) -> Result<SignOutcome, SignError> {
    if fields.is_empty() {
        return Err(SignError::NoFields);
    }
    let bytes = read_document_bytes(source).map_err(SignError::Read)?;
    let burned = burn_in(&bytes, fields)?;

    fs::create_dir_all(output_dir).map_err(|e| SignError::Save(e.to_string()))?;
    let signed_path = signed_output_path(output_dir, source);
    fs::write(&signed_path, &burned.bytes).map_err(|e| SignError::Save(e.to_string()))?;

    let info = SignatureInfo::build(profile, fields, Utc::now());
    let sidecar = sidecar_path(&signed_path);
    let json = serde_json::to_vec_pretty(&info).map_err(|e| SignError::Sidecar(e.to_string()))?;
    fs::write(&sidecar, json).map_err(|e| SignError::Sidecar(e.to_string()))?;

    info!(
        "signing: wrote {} ({} field(s))",
        signed_path.display(),
        burned.placements.len()
    );
    Ok(SignOutcome {
        signed_path,
        sidecar_path: sidecar,
        info,
        placements: burned.placements,
        fallbacks: burned.fallbacks,
        skipped: burned.skipped,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved { saved_path: PathBuf },
    /// The user dismissed the save dialog.
    Cancelled,
}

/// Copies a signed PDF, and its sidecar when present, to `destination`.
/// A directory destination keeps the source file name.
pub fn save_copy(source: &Path, destination: Option<&Path>) -> Result<SaveOutcome, SignError> {
    let Some(destination) = destination else {
        info!("save: cancelled by user");
        return Ok(SaveOutcome::Cancelled);
    };
    let target = if destination.is_dir() {
        let name = source.file_name().ok_or(SignError::PathNotUtf8)?;
        destination.join(name)
    } else {
        destination.to_path_buf()
    };
    fs::copy(source, &target).map_err(SignError::Copy)?;

    let sidecar = sidecar_path(source);
    if sidecar.is_file() {
        if let Err(e) = fs::copy(&sidecar, sidecar_path(&target)) {
            warn!("save: sidecar not copied: {e}");
        }
    }
    info!("save: copied to {}", target.display());
    Ok(SaveOutcome::Saved { saved_path: target })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub is_valid: bool,
    pub info: Option<SignatureInfo>,
    /// Why the record was rejected, when it was.
    pub problem: Option<String>,
}

impl VerifyReport {
    fn invalid(problem: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            info: None,
            problem: Some(problem.into()),
        }
    }
}

/// Weak check: the sidecar exists, parses and names a signer and a field.
pub fn verify(signed: &Path) -> VerifyReport {
    if !signed.is_file() {
        return VerifyReport::invalid("signed_file_missing");
    }
    let raw = match fs::read(sidecar_path(signed)) {
        Ok(raw) => raw,
        Err(_) => return VerifyReport::invalid("sidecar_missing"),
    };
    let info: SignatureInfo = match serde_json::from_slice(&raw) {
        Ok(info) => info,
        Err(e) => return VerifyReport::invalid(format!("sidecar_malformed:{e}")),
    };
    if info.signer.trim().is_empty() {
        return VerifyReport::invalid("sidecar_missing_signer");
    }
    if info.signature_fields.is_empty() {
        return VerifyReport::invalid("sidecar_missing_fields");
    }
    VerifyReport {
        is_valid: true,
        info: Some(info),
        problem: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::geometry::PdfRect;
    use crate::features::renderer::test_pdf;
    use crate::features::signature::{SignatureFont, SignaturePayload};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn snapshot(page: u32) -> FieldSnapshot {
        FieldSnapshot {
            field_id: Uuid::new_v4(),
            page_number: page,
            rect: PdfRect::new(40.0, 60.0, 150.0, 60.0),
            signature: SignaturePayload::typed("Jo Doe", SignatureFont::Helvetica, "").unwrap(),
        }
    }

    fn source_pdf(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("contract.pdf");
        fs::write(&path, test_pdf::two_pages()).unwrap();
        path
    }

    #[test]
    fn signing_writes_a_new_file_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let source = source_pdf(&dir);
        let original = fs::read(&source).unwrap();
        let out_dir = dir.path().join("out");

        let outcome = sign(
            source.to_str().unwrap(),
            &[snapshot(1)],
            &SignerProfile::default(),
            &out_dir,
        )
        .unwrap();
        assert_eq!(fs::read(&source).unwrap(), original);
        assert!(outcome.signed_path.starts_with(&out_dir));
        let name = outcome.signed_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("contract_signed_"), "{name}");

        let sidecar: serde_json::Value =
            serde_json::from_slice(&fs::read(&outcome.sidecar_path).unwrap()).unwrap();
        assert_eq!(sidecar["signer"], SignerProfile::default().signer);
        assert_eq!(sidecar["signatureFields"][0]["pageNumber"], 1);
        assert_eq!(sidecar["signatureFields"][0]["dimensions"]["width"], 150.0);
        assert!(sidecar["certificateInfo"]["validTo"].is_string());

        let again = sign(
            source.to_str().unwrap(),
            &[snapshot(1)],
            &SignerProfile::default(),
            &out_dir,
        )
        .unwrap();
        assert_ne!(again.signed_path, outcome.signed_path);
    }

    #[test]
    fn signing_without_fields_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = source_pdf(&dir);
        let err = sign(source.to_str().unwrap(), &[], &SignerProfile::default(), dir.path()).unwrap_err();
        assert!(matches!(err, SignError::NoFields));
    }

    #[test]
    fn missing_source_surfaces_read_error() {
        let dir = TempDir::new().unwrap();
        let err = sign("/definitely/not/here.pdf", &[snapshot(1)], &SignerProfile::default(), dir.path())
            .unwrap_err();
        assert!(err.to_string().starts_with("pdf_read_failed:"), "{err}");
    }

    #[test]
    fn certificate_window_follows_profile() {
        let now = Utc::now();
        let profile = SignerProfile {
            validity_days: 30,
            ..SignerProfile::default()
        };
        let info = SignatureInfo::build(&profile, &[snapshot(2)], now);
        assert_eq!(info.certificate_info.valid_to - info.certificate_info.valid_from, TimeDelta::days(30));
        assert_eq!(info.certificate_info.subject, info.certificate_info.issuer);
    }

    #[test]
    fn out_of_range_validity_falls_back_to_the_default_window() {
        let now = Utc::now();
        let profile = SignerProfile {
            validity_days: 999_999_999_999,
            ..SignerProfile::default()
        };
        let info = SignatureInfo::build(&profile, &[snapshot(1)], now);
        assert_eq!(
            info.certificate_info.valid_to - now,
            TimeDelta::days(DEFAULT_CERT_DAYS)
        );
    }

    #[test]
    fn save_copy_handles_cancel_and_directories() {
        let dir = TempDir::new().unwrap();
        let source = source_pdf(&dir);
        let signed = sign(source.to_str().unwrap(), &[snapshot(1)], &SignerProfile::default(), dir.path())
            .unwrap();

        assert_eq!(save_copy(&signed.signed_path, None).unwrap(), SaveOutcome::Cancelled);

        let dest = TempDir::new().unwrap();
        let SaveOutcome::Saved { saved_path } = save_copy(&signed.signed_path, Some(dest.path())).unwrap() else {
            panic!("expected a saved copy");
        };
        assert_eq!(saved_path.file_name(), signed.signed_path.file_name());
        assert!(sidecar_path(&saved_path).is_file());
        assert!(verify(&saved_path).is_valid);
    }

    #[test]
    fn save_copy_reports_underlying_error() {
        let dir = TempDir::new().unwrap();
        let err = save_copy(&dir.path().join("absent.pdf"), Some(&dir.path().join("x.pdf"))).unwrap_err();
        assert!(err.to_string().starts_with("copy_failed:"));
    }

    #[test]
    fn verify_checks_sidecar_shape() {
        let dir = TempDir::new().unwrap();
        let source = source_pdf(&dir);
        assert_eq!(verify(&source).problem.as_deref(), Some("sidecar_missing"));

        fs::write(sidecar_path(&source), b"{\"signer\": \"x\"}").unwrap();
        let report = verify(&source);
        assert!(!report.is_valid);
        assert!(report.problem.unwrap().starts_with("sidecar_malformed:"));

        let mut info = SignatureInfo::build(&SignerProfile::default(), &[], Utc::now());
        fs::write(sidecar_path(&source), serde_json::to_vec(&info).unwrap()).unwrap();
        assert_eq!(verify(&source).problem.as_deref(), Some("sidecar_missing_fields"));

        info = SignatureInfo::build(&SignerProfile::default(), &[snapshot(1)], Utc::now());
        fs::write(sidecar_path(&source), serde_json::to_vec(&info).unwrap()).unwrap();
        let report = verify(&source);
        assert!(report.is_valid);
        assert_eq!(report.info.unwrap().signature_fields.len(), 1);
    }

    #[test]
    fn verify_rejects_missing_file() {
        assert_eq!(
            verify(Path::new("/no/such/file.pdf")).problem.as_deref(),
            Some("signed_file_missing")
        );
    }
}
