//! Local inbox: one `.eml` file per captured message

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const EXTENSION: &str = "eml";

/// File name of a stored message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Timestamp and collision counter, so `<stamp>.eml` < `<stamp>-1.eml` < `<stamp>-10.eml`
    fn order_key(&self) -> (&str, u32) {
        let stem = self.0.strip_suffix(EXTENSION).unwrap_or(&self.0);
        let stem = stem.strip_suffix('.').unwrap_or(stem);
        match stem.rsplit_once('-') {
            Some((stamp, n)) => match n.parse() {
                Ok(n) => (stamp, n),
                Err(_) => (stem, 0),
            },
            None => (stem, 0),
        }
    }
}

impl Ord for ArtifactId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key()
            .cmp(&other.order_key())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ArtifactId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write `lines` to a freshly created file, removing it if the write fails
/// so a partial message is never listed.
async fn fill<W: AsyncWrite + Unpin>(path: &Path, mut file: W, lines: &[String]) -> io::Result<()> {
    let mut content = String::with_capacity(lines.iter().map(|l| l.len() + 2).sum());
    for line in lines {
        content.push_str(line);
        content.push_str("\r\n");
    }

    let written = async {
        file.write_all(content.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        drop(file);
        if let Err(rm) = tokio::fs::remove_file(path).await {
            warn!("Couldn't remove partial message {}: {}", path.display(), rm);
        }
        return Err(e);
    }
    Ok(())
}

/// Directory that receives captured messages
#[derive(Debug, Clone)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    /// Open the inbox, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &ArtifactId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    /// Write the lines verbatim, each terminated by CRLF, under a fresh name
    pub async fn persist(&self, lines: &[String]) -> io::Result<ArtifactId> {
        // UTC down to the microsecond
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day][hour][minute][second][subsecond digits:6]"
            ))
            .map_err(io::Error::other)?;

        let mut attempt = 0u32;
        let (id, file) = loop {
            let name = match attempt {
                0 => format!("{stamp}.{EXTENSION}"),
                n => format!("{stamp}-{n}.{EXTENSION}"),
            };
            let id = ArtifactId(name);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.path(&id))
                .await
            {
                Ok(file) => break (id, file),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e),
            }
        };

        fill(&self.path(&id), file, lines).await?;

        debug!("Saved {} lines to {}", lines.len(), self.path(&id).display());
        Ok(id)
    }

    /// Stored messages, oldest first.
    ///
    /// Messages with the same timestamp follow the order their counter
    /// suffixes were assigned.
    pub async fn list(&self) -> io::Result<Vec<ArtifactId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                ids.push(ArtifactId(name.to_string()));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Lines of a stored message
    pub async fn read(&self, id: &ArtifactId) -> io::Result<Vec<String>> {
        let content = tokio::fs::read_to_string(self.path(id)).await?;
        let Some(body) = content.strip_suffix("\r\n") else {
            return Ok(Vec::new());
        };
        Ok(body.split("\r\n").map(str::to_string).collect())
    }
}
