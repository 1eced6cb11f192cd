use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::pipeline::{OverlayImage, RawImage};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not encode overlay: {0}")]
    Encode(#[from] image::ImageError),
    #[error("File too large")]
    FileTooLarge,
}

/// Files written for one analysed upload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImages {
    pub original: PathBuf,
    pub heatmap: PathBuf,
}

/// Local directory tree holding uploads, overlays and reports.
#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
    max_upload_bytes: usize,
}

impl UploadStore {
    pub const ORIGINAL_DIR: &'static str = "original";
    pub const HEATMAP_DIR: &'static str = "heatmaps";
    pub const REPORTS_DIR: &'static str = "reports";

    pub fn new(root: impl Into<PathBuf>, max_upload_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_upload_bytes,
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        for dir in [Self::ORIGINAL_DIR, Self::HEATMAP_DIR, Self::REPORTS_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn calculate_image_hash(image_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image_data);
        hex::encode(hasher.finalize())
    }

    /// Keeps `[A-Za-z0-9_-]`, replacing everything else with `_`.
    pub fn sanitize(owner: &str) -> String {
        let cleaned: String = owner
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if cleaned.is_empty() { "anonymous".into() } else { cleaned }
    }

    pub fn generate_file_stem(owner: &str, image_hash: &str, at: DateTime<Utc>) -> String {
        let prefix = &image_hash[..image_hash.len().min(12)];
        format!("{}_{}_{}", Self::sanitize(owner), at.format("%Y%m%d_%H%M%S"), prefix)
    }

    pub fn validate_image_size(&self, image_data: &[u8]) -> Result<(), StorageError> {
        if image_data.len() > self.max_upload_bytes {
            return Err(StorageError::FileTooLarge);
        }
        Ok(())
    }

    /// Writes the uploaded bytes unchanged and the overlay as PNG.
    pub fn save_analysis(
        &self,
        owner: &str,
        image: &RawImage,
        overlay: &OverlayImage,
        at: DateTime<Utc>,
    ) -> Result<StoredImages, StorageError> {
        let hash = Self::calculate_image_hash(image.bytes());
        let stem = Self::generate_file_stem(owner, &hash, at);

        let original = self
            .root
            .join(Self::ORIGINAL_DIR)
            .join(format!("{}.{}", stem, image.kind().extension()));
        fs::write(&original, image.bytes())?;

        let heatmap = self.root.join(Self::HEATMAP_DIR).join(format!("heatmap_{}.png", stem));
        fs::write(&heatmap, overlay.encode_png()?)?;

        log::debug!("stored {} and {}", original.display(), heatmap.display());
        Ok(StoredImages { original, heatmap })
    }

    pub fn report_path(&self, owner: &str, prediction_id: uuid::Uuid, at: DateTime<Utc>) -> PathBuf {
        self.root.join(Self::REPORTS_DIR).join(format!(
            "report_{}_{}_{}.md",
            Self::sanitize(owner),
            prediction_id,
            at.format("%Y%m%d_%H%M%S")
        ))
    }

    pub fn save_report(&self, path: &Path, contents: &str) -> Result<(), StorageError> {
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn load_report(&self, path: &Path) -> Result<String, StorageError> {
        Ok(fs::read_to_string(path)?)
    }

    /// URL path under which a stored file is served, relative to the root.
    pub fn public_url(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/uploads/{}", parts.join("/")))
    }
}
