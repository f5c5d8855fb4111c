//! Append-only intent ledger.
//!
//! Two write tiers share one serialized writer:
//! - [`Ledger::append_critical`] writes and fsyncs before returning
//! - [`Ledger::append_buffered`] enqueues for a background batcher that
//!   flushes every `batch_size` records or `batch_interval`, whichever is first
//!
//! The active segment is rotated once it exceeds `max_segment_bytes`.

mod batcher;
mod error;
mod replay;
pub mod segment;
mod writer;

pub use error::LedgerError;
pub use replay::{LedgerReader, Replay, ReplayStats};

use batcher::{Batcher, BufferedItem};
use keel_domain::{IntentRecord, RecordEntry};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use writer::{LedgerCounters, SegmentWriter, WriterCommand};

/// Configuration for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Directory holding the segments.
    pub dir: PathBuf,
    /// File stem: the active segment is `<stem>.log`.
    pub stem: String,
    /// Size at which the active segment is rotated.
    pub max_segment_bytes: u64,
    /// Buffered records per batch.
    pub batch_size: usize,
    /// Maximum time a buffered record waits for its batch.
    pub batch_interval: Duration,
    /// Capacity of the buffered queue.
    pub buffer_capacity: usize,
    /// How long a buffered producer waits on a full queue before getting `BufferFull`.
    pub enqueue_timeout: Duration,
    /// Capacity of the writer command queue.
    pub writer_queue: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/ledger"),
            stem: "intents".to_string(),
            max_segment_bytes: 50 * 1024 * 1024, // 50 MiB
            batch_size: 50,
            batch_interval: Duration::from_millis(100),
            buffer_capacity: 4096,
            enqueue_timeout: Duration::from_millis(50),
            writer_queue: 1024,
        }
    }
}

impl LedgerConfig {
    /// Creates a configuration rooted at `dir` with default limits.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if self.stem.is_empty() || self.stem.contains(['/', '\\']) {
            return Err(LedgerError::Config(format!("invalid stem {:?}", self.stem)));
        }
        if self.batch_size == 0 || self.buffer_capacity == 0 || self.writer_queue == 0 {
            return Err(LedgerError::Config(
                "batch size and queue capacities must be positive".to_string(),
            ));
        }
        if self.max_segment_bytes == 0 {
            return Err(LedgerError::Config(
                "max segment size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time ledger statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    /// Sequence number the next record will get.
    pub next_seq: u64,
    /// Bytes in the active segment.
    pub active_segment_bytes: u64,
    /// Rotations since open.
    pub rotations: u64,
    /// Buffered records lost to write failures.
    pub dropped_buffered: u64,
    /// Records waiting in the buffered queue.
    pub buffered_pending: usize,
}

/// Handle to an open ledger. Share it behind an `Arc`.
pub struct Ledger {
    config: LedgerConfig,
    writer_tx: mpsc::Sender<WriterCommand>,
    buffer_tx: mpsc::Sender<BufferedItem>,
    counters: Arc<LedgerCounters>,
    cancel: CancellationToken,
    batcher: Mutex<Option<JoinHandle<()>>>,
    writer_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Ledger {
    /// Opens the ledger, repairing a torn tail and resuming the sequence.
    pub async fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let segments = segment::list_segments(&config.dir, &config.stem)?;
        let active = segment::active_path(&config.dir, &config.stem);
        let active_scan = segment::scan_segment(&active, true)?;

        let mut last_seq = active_scan.last_seq;
        if last_seq.is_none() {
            // Active segment is empty or fresh: the newest rotated segment holds the tail.
            for seg in segments.iter().rev().filter(|s| !s.is_active()) {
                if let Some(seq) = segment::scan_segment(&seg.path, false)?.last_seq {
                    last_seq = Some(seq);
                    break;
                }
            }
        }
        let next_seq = last_seq.map_or(1, |seq| seq + 1);

        let counters = Arc::new(LedgerCounters::default());
        let writer = SegmentWriter::open(
            config.dir.clone(),
            config.stem.clone(),
            config.max_segment_bytes,
            active_scan.len,
            next_seq,
            counters.clone(),
        )?;

        let (writer_tx, writer_rx) = mpsc::channel(config.writer_queue);
        let writer_thread = std::thread::Builder::new()
            .name("keel-ledger-writer".to_string())
            .spawn(move || writer.run(writer_rx))?;

        let (buffer_tx, buffer_rx) = mpsc::channel(config.buffer_capacity);
        let cancel = CancellationToken::new();
        let batcher = Batcher::new(
            buffer_rx,
            writer_tx.clone(),
            config.batch_size,
            config.batch_interval,
            counters.clone(),
        );
        let batcher = tokio::spawn(batcher.run(cancel.clone()));

        info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            next_seq,
            repaired_bytes = active_scan.truncated,
            "Ledger opened"
        );

        Ok(Self {
            config,
            writer_tx,
            buffer_tx,
            counters,
            cancel,
            batcher: Mutex::new(Some(batcher)),
            writer_thread: Mutex::new(Some(writer_thread)),
        })
    }

    /// Durably appends a record. `Ok` means it is fsynced.
    pub async fn append_critical(
        &self,
        entry: impl Into<RecordEntry>,
    ) -> Result<IntentRecord, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(WriterCommand::Critical {
                entry: entry.into(),
                reply,
            })
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        rx.await.map_err(|_| LedgerError::WriterClosed)?
    }

    /// Enqueues an informational record.
    ///
    /// Waits at most `enqueue_timeout` for room in the queue, then returns
    /// [`LedgerError::BufferFull`].
    pub async fn append_buffered(&self, entry: impl Into<RecordEntry>) -> Result<(), LedgerError> {
        enqueue(
            &self.buffer_tx,
            BufferedItem::Record(entry.into()),
            self.config.enqueue_timeout,
        )
        .await
    }

    /// Waits until every buffered record enqueued before this call is on disk.
    pub async fn flush(&self) -> Result<(), LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.buffer_tx
            .send(BufferedItem::Flush(reply))
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        rx.await.map_err(|_| LedgerError::WriterClosed)
    }

    /// Replays every record across all segments.
    pub fn replay(&self) -> Result<Replay, LedgerError> {
        self.reader().replay()
    }

    /// Replays records with a sequence number of at least `seq`.
    pub fn replay_from(&self, seq: u64) -> Result<Replay, LedgerError> {
        self.reader().replay_from(seq)
    }

    /// Read-only view of the same directory.
    pub fn reader(&self) -> LedgerReader {
        LedgerReader::open(&self.config.dir, self.config.stem.clone())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            next_seq: self.counters.next_seq.load(Ordering::SeqCst),
            active_segment_bytes: self.counters.active_bytes.load(Ordering::SeqCst),
            rotations: self.counters.rotations.load(Ordering::Relaxed),
            dropped_buffered: self.counters.dropped_buffered.load(Ordering::Relaxed),
            buffered_pending: self.config.buffer_capacity - self.buffer_tx.capacity(),
        }
    }

    /// Drains the buffered queue, syncs and stops the writer.
    ///
    /// Later appends fail with [`LedgerError::WriterClosed`].
    pub async fn shutdown(&self) -> Result<(), LedgerError> {
        self.cancel.cancel();
        if let Some(handle) = self.batcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Ledger batcher task failed");
            }
        }

        let (reply, rx) = oneshot::channel();
        if self
            .writer_tx
            .send(WriterCommand::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }

        if let Some(thread) = self.writer_thread.lock().await.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(std::io::Error::other)?
                .map_err(|_| std::io::Error::other("ledger writer thread panicked"))?;
        }
        debug!(dir = %self.config.dir.display(), "Ledger closed");
        Ok(())
    }
}

async fn enqueue(
    tx: &mpsc::Sender<BufferedItem>,
    item: BufferedItem,
    wait: Duration,
) -> Result<(), LedgerError> {
    match tx.send_timeout(item, wait).await {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
            warn!(
                wait_ms = wait.as_millis() as u64,
                "Buffered ledger queue full, record rejected"
            );
            Err(LedgerError::BufferFull(wait))
        }
        Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(LedgerError::WriterClosed),
    }
}
