//! Plain-text log of every message received from the broker.
//!
//! One `Topic: <topic>, Message: <payload>` line per message, appended and
//! flushed as it arrives.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only text log of every received message
pub struct MessageLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl MessageLog {
    /// Open `path` for appending, creating it if needed
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one `Topic: ..., Message: ...` line.
    ///
    /// Write failures are logged and swallowed.
    pub async fn append(&self, topic: &str, payload: &[u8]) {
        let line = format!(
            "Topic: {}, Message: {}\n",
            topic,
            String::from_utf8_lossy(payload)
        );

        let mut file = self.file.lock().await;
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Failed to append to message log");
        }
    }
}
