//! Append-only log of the protocol lines exchanged with clients

use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

/// Timestamped record of every line sent and received.
///
/// A write failure is logged and otherwise ignored; the transcript never
/// aborts a session.
#[derive(Debug, Default)]
pub struct Transcript {
    file: Option<(PathBuf, File)>,
}

impl Transcript {
    /// Open `path` for appending, creating it if needed
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            file: Some((path, file)),
        })
    }

    /// A transcript that only emits trace events
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(path, _)| path.as_path())
    }

    pub async fn received(&mut self, line: &str) {
        self.record(&format!("received: {line}")).await;
    }

    pub async fn sent(&mut self, line: &str) {
        self.record(&format!("sending: {line}")).await;
    }

    pub async fn note(&mut self, text: &str) {
        self.record(text).await;
    }

    async fn record(&mut self, text: &str) {
        trace!("{}", text);

        let Some((path, file)) = self.file.as_mut() else {
            return;
        };

        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let entry = format!("{stamp}: {text}\n");

        if let Err(e) = file.write_all(entry.as_bytes()).await {
            warn!("Couldn't write transcript {}: {}", path.display(), e);
            return;
        }
        if let Err(e) = file.flush().await {
            warn!("Couldn't flush transcript {}: {}", path.display(), e);
        }
    }
}
