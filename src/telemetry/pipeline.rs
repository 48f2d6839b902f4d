//! Delivery pipeline
//!
//! The poll loop hands samples to a [`PipelineHandle`], which appends each
//! sample to every sink's durable log before queueing it. A single worker
//! task ([`TelemetryPipeline::run`]) then flushes the sinks that are due.
//! The worker never holds the only copy of a sample, so abandoning it loses
//! nothing. Remote failures are logged and retried on the next due sample,
//! never surfaced to the poll loop.

use super::durable_log::{DurableLog, SharedLog};
use super::sample::Sample;
use super::sinks::{FileServerSink, RelationalSink};
use crate::error::{FieldgateError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};

/// Remote side of a sink
#[derive(Clone)]
pub enum SinkTarget {
    Relational {
        sink: Arc<dyn RelationalSink>,
        row_limit: Option<u64>,
    },
    FileServer {
        sink: Arc<dyn FileServerSink>,
    },
}

impl SinkTarget {
    fn describe(&self) -> String {
        match self {
            SinkTarget::Relational { sink, .. } => sink.describe(),
            SinkTarget::FileServer { sink } => sink.describe(),
        }
    }
}

/// Appending side of one sink's durable log
#[derive(Clone)]
pub struct Journal {
    log: SharedLog,
    logger: StructuredLogger,
}

impl Journal {
    /// Append to the durable log. Returns false if the row could not be
    /// stored.
    pub async fn record(&self, sample: &Sample) -> bool {
        let log = self.log.lock().await;
        match log.append(&sample.titles, &sample.csv_row(), sample.timestamp) {
            Ok(()) => true,
            Err(e) => {
                self.logger
                    .error(&format!("Cannot append to durable log: {}", e));
                false
            }
        }
    }
}

/// One sink with its durable log and flush schedule
pub struct SinkChannel {
    name: String,
    journal: Journal,
    path: PathBuf,
    target: SinkTarget,
    min_interval: Duration,
    op_timeout: Duration,
    last_flush: Option<Instant>,
    logger: StructuredLogger,
}

impl SinkChannel {
    pub fn new(
        name: &str,
        log: DurableLog,
        target: SinkTarget,
        min_interval: Duration,
        op_timeout: Duration,
    ) -> Self {
        let logger = get_logger_with_context(
            LogContext::new("telemetry").with_field("sink", name.to_string()),
        );
        let path = log.path().to_path_buf();
        Self {
            name: name.to_string(),
            journal: Journal {
                log: log.into_shared(),
                logger: logger.clone(),
            },
            path,
            target,
            min_interval,
            op_timeout,
            last_flush: None,
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> SharedLog {
        Arc::clone(&self.journal.log)
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    pub async fn record(&self, sample: &Sample) -> bool {
        self.journal.record(sample).await
    }

    fn is_due(&self, sample: &Sample) -> bool {
        sample.force_delivery
            || self
                .last_flush
                .is_none_or(|t| t.elapsed() >= self.min_interval)
    }

    /// Flush to the remote side if the sink is due
    pub async fn flush_if_due(&mut self, sample: &Sample) {
        if !self.is_due(sample) {
            return;
        }
        // Every attempt restarts the interval, whatever its outcome
        self.last_flush = Some(Instant::now());
        let result = match self.target.clone() {
            SinkTarget::Relational { sink, row_limit } => {
                self.replay(sink.as_ref(), row_limit).await
            }
            SinkTarget::FileServer { sink } => self.upload(sink.as_ref(), sample).await,
        };
        if let Err(e) = result {
            self.logger.warn(&format!(
                "Delivery to {} failed, rows stay queued: {}",
                self.target.describe(),
                e
            ));
        }
    }

    /// Insert queued rows in order, stopping at the first failure. Rows
    /// accepted by the store are removed from the log. The log stays
    /// unlocked while rows are in flight so appends are never held up.
    async fn replay(&self, sink: &dyn RelationalSink, row_limit: Option<u64>) -> Result<()> {
        let Some(contents) = self.journal.log.lock().await.read()? else {
            return Ok(());
        };
        if contents.rows.is_empty() {
            return Ok(());
        }

        let mut delivered = 0;
        let mut failure = None;
        for row in &contents.rows {
            let values: Vec<Option<String>> = row
                .iter()
                .map(|f| (!f.is_empty()).then(|| f.clone()))
                .collect();
            match timeout(self.op_timeout, sink.insert_row(&contents.title, &values)).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                Err(_) => {
                    failure = Some(FieldgateError::timeout("insert timed out"));
                    break;
                }
            }
        }

        if delivered > 0 {
            self.journal
                .log
                .lock()
                .await
                .remove_delivered(&contents.rows[..delivered])?;
            self.logger.debug(&format!(
                "Delivered {} of {} queued rows",
                delivered,
                contents.rows.len()
            ));
            if let Some(limit) = row_limit {
                match timeout(self.op_timeout, sink.prune(limit)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.logger.warn(&format!("Row limit prune failed: {}", e)),
                    Err(_) => self.logger.warn("Row limit prune timed out"),
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Upload a snapshot of the whole log, then drop the uploaded rows
    async fn upload(&self, sink: &dyn FileServerSink, sample: &Sample) -> Result<()> {
        let (contents, snapshot) = {
            let log = self.journal.log.lock().await;
            match log.read()? {
                Some(contents) if !contents.rows.is_empty() => {
                    let snapshot = log.snapshot(&contents)?;
                    (contents, snapshot)
                }
                _ => return Ok(()),
            }
        };

        let remote_name = self.remote_name(sample);
        let result = match timeout(self.op_timeout, sink.upload(&snapshot, &remote_name)).await {
            Ok(result) => result,
            Err(_) => Err(FieldgateError::timeout("upload timed out")),
        };
        if let Err(e) = tokio::fs::remove_file(&snapshot).await {
            self.logger
                .debug(&format!("Cannot remove {}: {}", snapshot.display(), e));
        }
        result?;

        self.journal
            .log
            .lock()
            .await
            .remove_delivered(&contents.rows)?;
        self.logger.info(&format!(
            "Uploaded {} rows as {}",
            contents.rows.len(),
            remote_name
        ));
        Ok(())
    }

    /// `<stem>_<YYYYmmdd_HHMMSS>.<ext>` so earlier uploads are not overwritten
    fn remote_name(&self, sample: &Sample) -> String {
        let path = &self.path;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("telemetry");
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
        format!(
            "{}_{}.{}",
            stem,
            sample.timestamp.format("%Y%m%d_%H%M%S"),
            ext
        )
    }
}

/// Sending side, owned by the poll loop
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<Sample>,
    journals: Vec<Journal>,
    logger: StructuredLogger,
}

impl PipelineHandle {
    /// Append `sample` to every durable log without queueing it
    pub async fn record(&self, sample: &Sample) -> usize {
        let mut stored = 0;
        for journal in &self.journals {
            if journal.record(sample).await {
                stored += 1;
            }
        }
        stored
    }

    /// Log the sample durably, then queue it for delivery. Waits when the
    /// queue is full instead of dropping.
    pub async fn submit(&self, sample: Sample) -> Result<()> {
        self.record(&sample).await;
        match self.tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(sample)) => {
                self.logger
                    .warn("Telemetry queue is full; poll loop waits for the pipeline");
                self.tx
                    .send(sample)
                    .await
                    .map_err(|_| FieldgateError::delivery("telemetry pipeline has stopped"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(FieldgateError::delivery("telemetry pipeline has stopped"))
            }
        }
    }
}

/// Worker side
pub struct TelemetryPipeline {
    sinks: Vec<SinkChannel>,
    rx: mpsc::Receiver<Sample>,
    shutdown: watch::Receiver<bool>,
    logger: StructuredLogger,
}

impl TelemetryPipeline {
    /// Create the worker and its handle
    pub fn new(
        sinks: Vec<SinkChannel>,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (PipelineHandle, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let logger = get_logger("telemetry");
        let journals = sinks.iter().map(SinkChannel::journal).collect();
        (
            PipelineHandle {
                tx,
                journals,
                logger: logger.clone(),
            },
            Self {
                sinks,
                rx,
                shutdown,
                logger,
            },
        )
    }

    pub fn sinks(&self) -> &[SinkChannel] {
        &self.sinks
    }

    /// Process samples until every handle is dropped. Once shutdown is
    /// signalled the remaining samples are only taken off the queue; they
    /// are already in the logs.
    pub async fn run(mut self) {
        self.logger
            .info(&format!("Telemetry pipeline started with {} sinks", self.sinks.len()));
        while let Some(sample) = self.rx.recv().await {
            let allow_remote = !*self.shutdown.borrow();
            self.process(&sample, allow_remote).await;
        }
        self.logger.info("Telemetry pipeline drained");
    }

    /// Flush whichever sinks are due
    pub async fn process(&mut self, sample: &Sample, allow_remote: bool) {
        if !allow_remote {
            return;
        }
        for sink in &mut self.sinks {
            sink.flush_if_due(sample).await;
        }
    }
}
