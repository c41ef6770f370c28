//! Bounded, ordered, retrying front for a slower audit sink
//!
//! Events enter a bounded FIFO queue drained by a single writer task, so the
//! order of acceptance is the order of writes. Critical events (denials,
//! failures, elevations) carry an acknowledgement channel and the caller waits
//! for the durable write; a full queue, a dead writer, exhausted retries or a
//! missed deadline all surface as `AuditUnavailable`. Non-critical events are
//! fire-and-forget and are counted when the queue has no room.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::sink::AuditSink;
use super::types::AuditEvent;
use crate::config::AuditSection;
use crate::error::{AuthzError, Result};

enum WriterCommand {
    Record {
        event: AuditEvent,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
}

/// Queue-backed audit sink with a single writer task
pub struct BufferedAuditSink {
    sender: mpsc::Sender<WriterCommand>,
    ack_timeout: Duration,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl BufferedAuditSink {
    /// Spawn the writer task on the current tokio runtime
    pub fn spawn(inner: Arc<dyn AuditSink>, config: &AuditSection) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));

        tokio::spawn(writer_loop(
            inner,
            receiver,
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
            failed.clone(),
        ));

        Self {
            sender,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            dropped: Arc::new(AtomicU64::new(0)),
            failed,
        }
    }

    /// Non-critical events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events the writer gave up on after exhausting retries
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    async fn record_acknowledged(&self, event: AuditEvent) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        let action = event.action.clone();

        self.sender
            .try_send(WriterCommand::Record {
                event,
                ack: Some(ack),
            })
            .map_err(|e| {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "audit queue full",
                    mpsc::error::TrySendError::Closed(_) => "audit writer stopped",
                };
                error!(target: "security", action = %action, reason, "Critical audit event rejected");
                AuthzError::AuditUnavailable(reason.to_string())
            })?;

        match tokio::time::timeout(self.ack_timeout, acked).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuthzError::AuditUnavailable("audit writer stopped".to_string())),
            Err(_) => {
                error!(target: "security", action = %action, "Critical audit event not acknowledged in time");
                Err(AuthzError::AuditUnavailable(format!(
                    "no acknowledgement within {} ms",
                    self.ack_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl AuditSink for BufferedAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        if event.is_critical() {
            return self.record_acknowledged(event).await;
        }

        match self.sender.try_send(WriterCommand::Record { event, ack: None }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(WriterCommand::Record { event, .. })) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(action = %event.action, "Audit queue full; dropping non-critical event");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AuthzError::AuditUnavailable("audit writer stopped".to_string()))
            }
        }
    }

    async fn flush(&self) -> Result<()> {
        let (done, flushed) = oneshot::channel();
        self.sender
            .send(WriterCommand::Flush { done })
            .await
            .map_err(|_| AuthzError::AuditUnavailable("audit writer stopped".to_string()))?;
        flushed
            .await
            .map_err(|_| AuthzError::AuditUnavailable("audit writer stopped".to_string()))
    }
}

async fn writer_loop(
    inner: Arc<dyn AuditSink>,
    mut receiver: mpsc::Receiver<WriterCommand>,
    max_retries: u32,
    backoff: Duration,
    failed: Arc<AtomicU64>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriterCommand::Record { event, ack } => {
                let result = write_with_retry(inner.as_ref(), event, max_retries, backoff).await;
                if result.is_err() {
                    failed.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            WriterCommand::Flush { done } => {
                let _ = inner.flush().await;
                let _ = done.send(());
            }
        }
    }
    debug!("Audit writer stopped");
}

async fn write_with_retry(
    inner: &dyn AuditSink,
    event: AuditEvent,
    max_retries: u32,
    backoff: Duration,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match inner.record(event.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(action = %event.action, attempt, error = %e, "Audit write failed; retrying");
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => {
                error!(
                    target: "security",
                    action = %event.action,
                    event_id = %event.id,
                    error = %e,
                    "Audit write failed after retries"
                );
                return Err(AuthzError::AuditUnavailable(e.to_string()));
            }
        }
    }
}
