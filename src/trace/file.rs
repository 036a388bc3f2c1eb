//! JSON Lines trace sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{TraceError, TraceEvent, TraceSink};

/// Appends one JSON object per line to a file.
pub struct JsonlTraceSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTraceSink {
    /// Open `path` for appending, creating it and its parent directory if needed.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
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

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonlTraceSink {
    async fn append(&self, event: &TraceEvent) -> Result<(), TraceError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), TraceError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Read a JSON Lines trace. Blank lines are skipped.
pub async fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, TraceError> {
    let text = tokio::fs::read_to_string(path).await?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map_err(|e| TraceError::Corrupt(format!("line {}: {}", number + 1, e)))
        })
        .collect()
}
