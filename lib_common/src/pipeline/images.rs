//! # Image Storage
//!
//! Decodes base64 image captures and writes them under a device/date
//! partitioned tree:
//!
//! ```text
//! <root>/<device>/<YYYY-MM-DD>/<name>.<ext>        full images
//! <root>/<device>/<YYYY-MM-DD>/crop/<name>.<ext>   plate crops
//! ```
//!
//! Directory creation is create-if-absent, so repeated writes for the same
//! device and day never fail on existing directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose;
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::debug;

use crate::connections::records::ImageKind;
use crate::pipeline::model::{DeviceToken, sanitize_path_component};

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of the partition date. Injected so tests can pin the day.
pub type DateSource = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

#[derive(Clone)]
pub struct ImageStorage {
    fallback_root: PathBuf,
    today: DateSource,
}

impl ImageStorage {
    /// Partitions by the current UTC date.
    pub fn new(fallback_root: impl Into<PathBuf>) -> Self {
        Self::with_date_source(fallback_root, Arc::new(|| Utc::now().date_naive()))
    }

    pub fn with_date_source(fallback_root: impl Into<PathBuf>, today: DateSource) -> Self {
        Self {
            fallback_root: fallback_root.into(),
            today,
        }
    }

    /// Root used when no storage path has been configured in the store.
    pub fn fallback_root(&self) -> &Path {
        &self.fallback_root
    }

    /// Directory an image of `kind` for `device` lands in today.
    pub fn partition_dir(&self, root: &Path, device: &DeviceToken, kind: ImageKind) -> PathBuf {
        let day = (self.today)().format("%Y-%m-%d").to_string();
        let dir = root.join(device.path_component()).join(day);
        match kind {
            ImageKind::Crop => dir.join("crop"),
            ImageKind::Full => dir,
        }
    }

    /// Decodes and writes one image, returning the path it was written to.
    pub async fn store(
        &self,
        root: &Path,
        device: &DeviceToken,
        kind: ImageKind,
        file_name: &str,
        format: &str,
        encoded: &str,
    ) -> Result<PathBuf, ImageError> {
        let bytes = decode_image(encoded)?;

        let dir = self.partition_dir(root, device, kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ImageError::Io { path: dir.clone(), source })?;

        let path = dir.join(format!(
            "{}.{}",
            sanitize_path_component(file_name),
            sanitize_path_component(format)
        ));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| ImageError::Io { path: path.clone(), source })?;

        debug!(path = %path.display(), bytes = bytes.len(), "Image written");
        Ok(path)
    }
}

/// Accepts bare base64 or a `data:<mime>;base64,` URL, ignoring whitespace.
fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let body = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    general_purpose::STANDARD.decode(compact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_day() -> DateSource {
        Arc::new(|| NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
    }

    #[tokio::test]
    async fn crop_images_land_in_crop_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ImageStorage::with_date_source(tmp.path(), fixed_day());
        let device = DeviceToken::from_topic("ns/v/cam-1/cropimage");

        let path = storage
            .store(tmp.path(), &device, ImageKind::Crop, "plate", "jpg", "aGVsbG8=")
            .await
            .unwrap();

        assert_eq!(path, tmp.path().join("cam-1/2024-03-01/crop/plate.jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn repeated_writes_for_same_day_reuse_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ImageStorage::with_date_source(tmp.path(), fixed_day());
        let device = DeviceToken::from_topic("ns/v/cam-1/fullimage");

        for name in ["a", "b", "a"] {
            storage
                .store(tmp.path(), &device, ImageKind::Full, name, "png", "aGVsbG8=")
                .await
                .unwrap();
        }
        let entries = std::fs::read_dir(tmp.path().join("cam-1/2024-03-01")).unwrap().count();
        assert_eq!(entries, 2);
    }

    #[tokio::test]
    async fn traversal_in_names_stays_inside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = ImageStorage::with_date_source(tmp.path(), fixed_day());
        let device = DeviceToken::from_topic("ns/v/../fullimage");

        let path = storage
            .store(tmp.path(), &device, ImageKind::Full, "../../x", "png", "aGVsbG8=")
            .await
            .unwrap();
        assert!(path.starts_with(tmp.path()));
        assert_eq!(path, tmp.path().join("unknown/2024-03-01/_.._x.png"));
    }

    #[test]
    fn data_urls_and_line_breaks_decode() {
        assert_eq!(decode_image("data:image/png;base64,aGVs\nbG8=").unwrap(), b"hello");
        assert!(decode_image("not base64!").is_err());
    }
}
