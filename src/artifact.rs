use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::job::error::ReportError;

const MANIFEST_ENTRY: &str = "manifest.json";
pub const ARTIFACT_FORMAT_V1: &str = "attendance-report-artifact-v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactContents {
    pub file_name: String,
    pub payload: Vec<u8>,
}

/// Blob storage for generated reports.
pub trait ArtifactStore {
    fn upload(
        &self,
        payload: &[u8],
        folder: &str,
        file_name: &str,
    ) -> Result<ArtifactRef, ReportError>;
}

/// Stores every artifact as `{root}/{folder}/{id}.zip`, holding a manifest and
/// the payload under its file name.
pub struct FsArtifactStore {
    root: PathBuf,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn safe_segment(name: &str, what: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(anyhow!("invalid {} {:?}", what, name));
    }
    Ok(())
}

impl FsArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn bundle_path(&self, folder: &str, id: &str) -> PathBuf {
        self.root.join(folder).join(format!("{}.zip", id))
    }

    fn write_bundle(
        &self,
        payload: &[u8],
        folder: &str,
        file_name: &str,
    ) -> anyhow::Result<ArtifactRef> {
        safe_segment(folder, "folder")?;
        safe_segment(file_name, "file name")?;
        let dir = self.root.join(folder);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory {}", dir.to_string_lossy()))?;

        let id = Uuid::new_v4().to_string();
        let out_path = self.bundle_path(folder, &id);
        let tmp_path = dir.join(format!("{}.zip.uploading", id));

        let out_file = File::create(&tmp_path).with_context(|| {
            format!("failed to create artifact {}", tmp_path.to_string_lossy())
        })?;
        let mut zip = ZipWriter::new(out_file);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let uploaded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let manifest = json!({
            "format": ARTIFACT_FORMAT_V1,
            "version": 1,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "id": id,
            "folder": folder,
            "fileName": file_name,
            "sha256": sha256_hex(payload),
            "uploadedAt": uploaded_at,
        });
        zip.start_file(MANIFEST_ENTRY, opts)
            .context("failed to start manifest entry")?;
        zip.write_all(
            serde_json::to_string_pretty(&manifest)
                .context("failed to serialize manifest")?
                .as_bytes(),
        )
        .context("failed to write manifest entry")?;

        zip.start_file(file_name, opts)
            .context("failed to start payload entry")?;
        zip.write_all(payload)
            .context("failed to write payload entry")?;
        zip.finish().context("failed to finalize artifact")?;

        std::fs::rename(&tmp_path, &out_path).with_context(|| {
            format!("failed to move artifact to {}", out_path.to_string_lossy())
        })?;
        Ok(ArtifactRef { id })
    }

    /// Reads an artifact back, checking the payload against its manifest digest.
    pub fn open_artifact(&self, folder: &str, id: &str) -> anyhow::Result<ArtifactContents> {
        safe_segment(folder, "folder")?;
        safe_segment(id, "artifact id")?;
        let path = self.bundle_path(folder, id);
        let file = File::open(&path)
            .with_context(|| format!("failed to open artifact {}", path.to_string_lossy()))?;
        let mut archive = ZipArchive::new(file).context("invalid zip archive")?;

        let mut manifest_text = String::new();
        archive
            .by_name(MANIFEST_ENTRY)
            .context("artifact missing manifest.json")?
            .read_to_string(&mut manifest_text)
            .context("failed to read manifest.json")?;
        let manifest: serde_json::Value =
            serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
        let format = manifest
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if format != ARTIFACT_FORMAT_V1 {
            return Err(anyhow!("unsupported artifact format: {}", format));
        }
        let file_name = manifest
            .get("fileName")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest missing fileName"))?
            .to_string();
        let expected = manifest
            .get("sha256")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut payload = Vec::new();
        archive
            .by_name(&file_name)
            .with_context(|| format!("artifact missing {}", file_name))?
            .read_to_end(&mut payload)
            .context("failed to read payload entry")?;
        if sha256_hex(&payload) != expected {
            return Err(anyhow!("artifact {} payload digest mismatch", id));
        }
        Ok(ArtifactContents { file_name, payload })
    }
}

impl ArtifactStore for FsArtifactStore {
    fn upload(
        &self,
        payload: &[u8],
        folder: &str,
        file_name: &str,
    ) -> Result<ArtifactRef, ReportError> {
        Ok(self.write_bundle(payload, folder, file_name)?)
    }
}
