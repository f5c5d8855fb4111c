//! The single serialized writer that owns the active segment.
//!
//! Critical and batched records go through the same command queue, so they
//! share one sequence counter and can never interleave inside a line.

use super::LedgerError;
use super::segment;
use chrono::Utc;
use keel_domain::{IntentRecord, RecordEntry};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Commands accepted by the writer thread.
pub(crate) enum WriterCommand {
    /// Write and fsync one record, then reply.
    Critical {
        entry: RecordEntry,
        reply: oneshot::Sender<Result<IntentRecord, LedgerError>>,
    },
    /// Write and fsync a batch of informational records.
    Batch {
        entries: Vec<RecordEntry>,
        done: Option<oneshot::Sender<()>>,
    },
    /// Sync and stop.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Counters shared with ledger handles for observability.
#[derive(Debug, Default)]
pub(crate) struct LedgerCounters {
    pub next_seq: AtomicU64,
    pub active_bytes: AtomicU64,
    pub rotations: AtomicU64,
    pub dropped_buffered: AtomicU64,
}

pub(crate) struct SegmentWriter {
    dir: PathBuf,
    stem: String,
    active_path: PathBuf,
    max_segment_bytes: u64,
    file: File,
    active_bytes: u64,
    next_seq: u64,
    counters: Arc<LedgerCounters>,
}

impl SegmentWriter {
    pub(crate) fn open(
        dir: PathBuf,
        stem: String,
        max_segment_bytes: u64,
        active_bytes: u64,
        next_seq: u64,
        counters: Arc<LedgerCounters>,
    ) -> io::Result<Self> {
        let active_path = segment::active_path(&dir, &stem);
        let file = segment::open_for_append(&active_path)?;
        segment::sync_dir(&dir)?;
        counters.next_seq.store(next_seq, Ordering::SeqCst);
        counters.active_bytes.store(active_bytes, Ordering::SeqCst);
        Ok(Self {
            dir,
            stem,
            active_path,
            max_segment_bytes,
            file,
            active_bytes,
            next_seq,
            counters,
        })
    }

    /// Runs until shutdown or until every sender is gone.
    pub(crate) fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>) {
        debug!(path = %self.active_path.display(), next_seq = self.next_seq, "Ledger writer started");

        while let Some(command) = rx.blocking_recv() {
            match command {
                WriterCommand::Critical { entry, reply } => {
                    let result = self
                        .append(vec![entry])
                        .map(|mut records| records.remove(0));
                    if let Err(e) = &result {
                        error!(error = %e, "Critical ledger append failed");
                    }
                    // The caller may have gone away; the record is on disk either way.
                    let _ = reply.send(result);
                }
                WriterCommand::Batch { entries, done } => {
                    let count = entries.len();
                    if let Err(e) = self.append(entries) {
                        self.counters
                            .dropped_buffered
                            .fetch_add(count as u64, Ordering::Relaxed);
                        error!(error = %e, dropped = count, "Buffered ledger batch dropped");
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                WriterCommand::Shutdown { reply } => {
                    self.sync();
                    let _ = reply.send(());
                    debug!("Ledger writer stopped");
                    return;
                }
            }
        }

        self.sync();
        debug!("Ledger writer stopped, all handles dropped");
    }

    /// Writes the entries as consecutive lines and fsyncs once.
    fn append(&mut self, entries: Vec<RecordEntry>) -> Result<Vec<IntentRecord>, LedgerError> {
        let ts = Utc::now();
        let mut buf = Vec::with_capacity(entries.len() * 192);
        let mut records = Vec::with_capacity(entries.len());

        for (offset, entry) in entries.into_iter().enumerate() {
            let record = IntentRecord::new(self.next_seq + offset as u64, ts, entry);
            serde_json::to_writer(&mut buf, &record)?;
            buf.push(b'\n');
            records.push(record);
        }

        if let Err(e) = self
            .file
            .write_all(&buf)
            .and_then(|()| self.file.sync_data())
        {
            self.discard_partial_write();
            return Err(e.into());
        }

        self.next_seq += records.len() as u64;
        self.active_bytes += buf.len() as u64;
        self.counters.next_seq.store(self.next_seq, Ordering::SeqCst);
        self.counters
            .active_bytes
            .store(self.active_bytes, Ordering::SeqCst);

        // The whole write lands in the segment being closed.
        if self.active_bytes >= self.max_segment_bytes {
            if let Err(e) = self.rotate() {
                error!(error = %e, "Ledger rotation failed, continuing on current segment");
            }
        }

        Ok(records)
    }

    /// Cuts the segment back to the last complete line after a failed write.
    fn discard_partial_write(&mut self) {
        if let Err(e) = self.file.set_len(self.active_bytes) {
            warn!(error = %e, "Could not truncate partial ledger write");
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.sync_all()?;
        let rotated = segment::rotated_path(&self.dir, &self.stem, Utc::now());
        if self.active_path.exists() {
            fs::rename(&self.active_path, &rotated)?;
        }
        let file = segment::open_for_append(&self.active_path)?;
        segment::sync_dir(&self.dir)?;

        self.file = file;
        self.active_bytes = 0;
        self.counters.active_bytes.store(0, Ordering::SeqCst);
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);

        info!(
            rotated_to = %rotated.display(),
            next_seq = self.next_seq,
            "Ledger segment size limit reached, rotated"
        );
        Ok(())
    }

    fn sync(&mut self) {
        if let Err(e) = self.file.sync_all() {
            error!(error = %e, "Final ledger sync failed");
        }
    }
}
