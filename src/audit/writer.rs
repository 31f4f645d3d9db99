//! Audit persistence backends.

use super::AuditEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

/// A batch write that stopped part-way.
///
/// The first `written` events of the batch were persisted and must not be
/// offered again; the rest are retried.
#[derive(Debug, Error)]
#[error("audit write failed after {written} events: {source}")]
pub struct BatchWriteError {
    pub written: usize,
    #[source]
    pub source: io::Error,
}

impl From<io::Error> for BatchWriteError {
    fn from(source: io::Error) -> Self {
        Self { written: 0, source }
    }
}

/// Persists batches of audit events. Called from the sink's writer task
/// only, so implementations need no internal locking of their own.
#[async_trait]
pub trait AuditWriter: Send + 'static {
    /// Persist `events` durably. An empty batch finishes any durability work
    /// left pending by an earlier failure.
    async fn write_batch(&mut self, events: &[AuditEvent]) -> Result<(), BatchWriteError>;
}

/// JSON Lines file, one event per line, append-only.
pub struct JsonlAuditWriter {
    path: PathBuf,
    file: File,
    /// A previous write failed part-way; the next line starts on a new line.
    torn: bool,
    /// Lines reached the file but `sync_data` failed afterwards.
    unsynced: bool,
}

impl JsonlAuditWriter {
    /// Open (or create) the audit file, creating parent directories. A
    /// torn last line left by a crash is terminated so earlier records stay
    /// parseable.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let torn = ends_without_newline(&path).await?;
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        if torn {
            warn!(path = %path.display(), "Audit log ends with a partial line, terminating it");
        }
        info!(path = %path.display(), "Audit log opened");

        Ok(Self {
            path,
            file,
            torn,
            unsynced: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn ends_without_newline(path: &Path) -> io::Result<bool> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// Write one JSON line per event, flushing after each so a failure can be
/// attributed to the line that caused it.
async fn write_lines<W>(
    out: &mut W,
    events: &[AuditEvent],
    torn: &mut bool,
) -> Result<(), BatchWriteError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut line = Vec::with_capacity(256);

    for (written, event) in events.iter().enumerate() {
        let failed = |source: io::Error| BatchWriteError { written, source };

        line.clear();
        if *torn {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, event).map_err(|e| failed(e.into()))?;
        line.push(b'\n');

        // Assume the worst until the line is out.
        *torn = true;
        out.write_all(&line).await.map_err(failed)?;
        out.flush().await.map_err(failed)?;
        *torn = false;
    }

    Ok(())
}

#[async_trait]
impl AuditWriter for JsonlAuditWriter {
    async fn write_batch(&mut self, events: &[AuditEvent]) -> Result<(), BatchWriteError> {
        if self.unsynced {
            self.file.sync_data().await?;
            self.unsynced = false;
        }

        write_lines(&mut self.file, events, &mut self.torn).await?;

        if let Err(source) = self.file.sync_data().await {
            self.unsynced = true;
            return Err(BatchWriteError {
                written: events.len(),
                source,
            });
        }

        debug!(count = events.len(), "Audit batch persisted");
        Ok(())
    }
}

/// In-memory writer for embedding and tests. Clones share the buffer.
#[derive(Clone, Default)]
pub struct MemoryAuditWriter {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl AuditWriter for MemoryAuditWriter {
    async fn write_batch(&mut self, events: &[AuditEvent]) -> Result<(), BatchWriteError> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}
