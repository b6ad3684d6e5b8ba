//! Local persistence of downloaded snapshot images.

use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A snapshot image written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

/// Writes snapshot images into the output directory.
///
/// Files are named `<timestamp>-<serial>.jpg`; an existing file with the
/// same name is overwritten.
#[derive(Debug, Clone)]
pub struct ImageStore {
    output_dir: PathBuf,
    timestamp_format: String,
}

impl ImageStore {
    pub fn new(output_dir: impl Into<PathBuf>, timestamp_format: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            timestamp_format: timestamp_format.into(),
        }
    }

    /// File name for a snapshot of `device_serial` captured at `captured_at`
    pub fn file_name(&self, device_serial: &str, captured_at: DateTime<Local>) -> String {
        format!(
            "{}-{}.jpg",
            captured_at.format(&self.timestamp_format),
            sanitize_file_component(device_serial)
        )
    }

    /// Persist an image.
    ///
    /// The bytes land in a hidden temporary file that is renamed into place,
    /// so an interrupted write never leaves a file under the final name. The
    /// write runs on the blocking pool and completes even if the caller is
    /// cancelled, so no temporary file is left behind.
    pub async fn save(
        &self,
        device_serial: &str,
        bytes: &[u8],
        captured_at: DateTime<Local>,
    ) -> io::Result<ImageArtifact> {
        let file_name = self.file_name(device_serial, captured_at);
        let path = self.output_dir.join(&file_name);
        let partial = self.output_dir.join(format!(".{}.part", file_name));
        let output_dir = self.output_dir.clone();
        let bytes = bytes.to_vec();

        let size_bytes = tokio::task::spawn_blocking({
            let path = path.clone();
            move || write_atomically(&output_dir, &partial, &path, &bytes)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        debug!(path = %path.display(), size_bytes, "Image written");

        Ok(ImageArtifact {
            path,
            file_name,
            size_bytes,
        })
    }
}

fn write_atomically(dir: &Path, partial: &Path, path: &Path, bytes: &[u8]) -> io::Result<u64> {
    fs::create_dir_all(dir)?;

    if let Err(e) = fs::write(partial, bytes).and_then(|_| fs::rename(partial, path)) {
        let _ = fs::remove_file(partial);
        return Err(e);
    }

    Ok(bytes.len() as u64)
}

/// Keep a serial from escaping the output directory
fn sanitize_file_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("image-store-{}", uuid::Uuid::new_v4()))
    }

    fn captured_at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, 10, 30, 5).unwrap()
    }

    #[test]
    fn test_file_name_format() {
        let store = ImageStore::new(".", "%d%m%Y_%H%M%S");
        assert_eq!(
            store.file_name("SERIAL123", captured_at()),
            "15012024_103005-SERIAL123.jpg"
        );
    }

    #[test]
    fn test_file_name_sanitizes_serial() {
        let store = ImageStore::new(".", "%d%m%Y_%H%M%S");
        assert_eq!(
            store.file_name("../etc", captured_at()),
            "15012024_103005-.._etc.jpg"
        );
    }

    #[tokio::test]
    async fn test_save_writes_image() {
        let dir = temp_dir();
        let store = ImageStore::new(&dir, "%d%m%Y_%H%M%S");

        let artifact = store
            .save("SERIAL123", b"\xff\xd8jpeg", captured_at())
            .await
            .unwrap();

        assert_eq!(artifact.file_name, "15012024_103005-SERIAL123.jpg");
        assert_eq!(artifact.size_bytes, 6);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"\xff\xd8jpeg");

        // Only the final file remains
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_save_leaves_no_partial_file() {
        let dir = temp_dir();
        let store = ImageStore::new(&dir, "%d%m%Y_%H%M%S");

        // Dropped right after the write is handed off
        let _ = tokio::time::timeout(
            std::time::Duration::ZERO,
            store.save("SERIAL123", &[0u8; 1 << 20], captured_at()),
        )
        .await;

        let mut names = Vec::new();
        for _ in 0..200 {
            names = std::fs::read_dir(&dir)
                .map(|d| {
                    d.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if names.iter().any(|n| n.ends_with(".jpg")) && !names.iter().any(|n| n.ends_with(".part")) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(names, vec!["15012024_103005-SERIAL123.jpg".to_string()]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_save_overwrites_existing() {
        let dir = temp_dir();
        let store = ImageStore::new(&dir, "%d%m%Y_%H%M%S");

        store.save("SERIAL123", b"first", captured_at()).await.unwrap();
        let artifact = store.save("SERIAL123", b"second", captured_at()).await.unwrap();

        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"second");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
