//! Background batching for the informational tier.

use super::writer::{LedgerCounters, WriterCommand};
use keel_domain::RecordEntry;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Items on the buffered queue. Flush markers keep their place in line.
pub(crate) enum BufferedItem {
    Record(RecordEntry),
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Batcher {
    rx: mpsc::Receiver<BufferedItem>,
    writer: mpsc::Sender<WriterCommand>,
    batch_size: usize,
    batch_interval: Duration,
    counters: Arc<LedgerCounters>,
}

impl Batcher {
    pub(crate) fn new(
        rx: mpsc::Receiver<BufferedItem>,
        writer: mpsc::Sender<WriterCommand>,
        batch_size: usize,
        batch_interval: Duration,
        counters: Arc<LedgerCounters>,
    ) -> Self {
        Self {
            rx,
            writer,
            batch_size,
            batch_interval,
            counters,
        }
    }

    /// Drains the queue into the writer until cancelled, then flushes what is left.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut batch: Vec<RecordEntry> = Vec::with_capacity(self.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let flush_at = deadline.unwrap_or_else(|| Instant::now() + self.batch_interval);
            tokio::select! {
                biased;
                item = self.rx.recv() => match item {
                    Some(BufferedItem::Record(entry)) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.batch_interval);
                        }
                        batch.push(entry);
                        if batch.len() >= self.batch_size {
                            self.send_batch(&mut batch, false).await;
                            deadline = None;
                        }
                    }
                    Some(BufferedItem::Flush(reply)) => {
                        self.send_batch(&mut batch, true).await;
                        deadline = None;
                        let _ = reply.send(());
                    }
                    None => break,
                },
                _ = sleep_until(flush_at), if deadline.is_some() => {
                    self.send_batch(&mut batch, false).await;
                    deadline = None;
                }
                _ = cancel.cancelled() => {
                    self.rx.close();
                    while let Some(item) = self.rx.recv().await {
                        match item {
                            BufferedItem::Record(entry) => batch.push(entry),
                            BufferedItem::Flush(reply) => {
                                self.send_batch(&mut batch, true).await;
                                let _ = reply.send(());
                            }
                        }
                    }
                    break;
                }
            }
        }

        self.send_batch(&mut batch, true).await;
        debug!("Ledger batcher stopped");
    }

    /// Hands the batch to the writer; waits for it to hit disk when `wait` is set.
    async fn send_batch(&self, batch: &mut Vec<RecordEntry>, wait: bool) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let count = entries.len();
        let (done, done_rx) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        if self
            .writer
            .send(WriterCommand::Batch { entries, done })
            .await
            .is_err()
        {
            self.counters
                .dropped_buffered
                .fetch_add(count as u64, Ordering::Relaxed);
            warn!(dropped = count, "Ledger writer closed, buffered records dropped");
            return;
        }
        if let Some(rx) = done_rx {
            let _ = rx.await;
        }
    }
}
