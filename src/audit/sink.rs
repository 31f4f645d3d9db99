//! Bounded audit channel and its writer task.

use super::{AuditEvent, AuditWriter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_BATCH: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("Audit sink is shut down")]
    Closed,
}

enum AuditCommand {
    Record(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the audit pipeline. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditCommand>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuditSink {
    /// Start the writer task. Must be called within a tokio runtime.
    pub fn spawn(writer: impl AuditWriter, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run_writer(Box::new(writer), rx));
        Self {
            tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    fn announce(event: &AuditEvent) {
        if event.is_security_event() {
            warn!(
                target: "security",
                request_id = %event.request_id,
                client_id = %event.client_id,
                outcome = %event.outcome,
                subject = %event.subject,
                "Request refused"
            );
        }
    }

    /// Enqueue an event. Waits only for channel capacity.
    pub async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        Self::announce(&event);
        self.tx
            .send(AuditCommand::Record(Box::new(event)))
            .await
            .map_err(|_| AuditError::Closed)
    }

    /// Enqueue without awaiting, for use from `Drop`. When the channel is
    /// full the send is handed to a background task instead of dropping the
    /// event.
    pub fn try_record(&self, event: AuditEvent) -> Result<(), AuditError> {
        Self::announce(&event);
        match self.tx.try_send(AuditCommand::Record(Box::new(event))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AuditError::Closed),
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                    error!("Audit channel full outside a runtime, event lost");
                    AuditError::Closed
                })?;
                let tx = self.tx.clone();
                handle.spawn(async move {
                    if tx.send(cmd).await.is_err() {
                        error!("Audit sink closed before a deferred event was queued");
                    }
                });
                Ok(())
            }
        }
    }

    /// Resolves once every event recorded before this call is persisted.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(AuditCommand::Flush(ack))
            .await
            .map_err(|_| AuditError::Closed)?;
        done.await.map_err(|_| AuditError::Closed)
    }

    /// Persist everything queued so far and stop the writer task.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(AuditCommand::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Audit writer task failed");
            }
        }
        info!("Audit sink shut down");
    }
}

async fn run_writer(mut writer: Box<dyn AuditWriter>, mut rx: mpsc::Receiver<AuditCommand>) {
    let mut batch: Vec<AuditEvent> = Vec::with_capacity(MAX_BATCH);

    'commands: while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                AuditCommand::Record(event) => {
                    batch.push(*event);
                    if batch.len() < MAX_BATCH {
                        next = rx.try_recv().ok();
                    }
                }
                AuditCommand::Flush(ack) => {
                    persist(writer.as_mut(), &mut batch).await;
                    let _ = ack.send(());
                    next = rx.try_recv().ok();
                }
                AuditCommand::Shutdown => {
                    rx.close();
                    break 'commands;
                }
            }
        }
        persist(writer.as_mut(), &mut batch).await;
    }

    // Events queued before the channel closed.
    while let Some(cmd) = rx.recv().await {
        match cmd {
            AuditCommand::Record(event) => batch.push(*event),
            AuditCommand::Flush(ack) => {
                persist(writer.as_mut(), &mut batch).await;
                let _ = ack.send(());
            }
            AuditCommand::Shutdown => {}
        }
    }
    persist(writer.as_mut(), &mut batch).await;
    debug!("Audit writer stopped");
}

/// Write the batch, retrying with capped exponential backoff until it
/// succeeds. Events the writer reports as persisted are never offered again.
async fn persist(writer: &mut dyn AuditWriter, batch: &mut Vec<AuditEvent>) {
    if batch.is_empty() {
        return;
    }
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1u32;
    loop {
        match writer.write_batch(batch).await {
            Ok(()) => {
                batch.clear();
                return;
            }
            Err(e) => {
                batch.drain(..e.written.min(batch.len()));
                error!(
                    error = %e.source,
                    written = e.written,
                    attempt,
                    pending = batch.len(),
                    retry_in_ms = backoff.as_millis() as u64,
                    "Audit write failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
        }
    }
}
