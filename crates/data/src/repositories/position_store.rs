//! Actor that owns the position map.

use super::{PositionRepository, PositionSnapshot, StoreError};
use keel_domain::PositionRecord;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum StoreCommand {
    Snapshot(oneshot::Sender<PositionSnapshot>),
    Get(String, oneshot::Sender<Option<PositionRecord>>),
    Upsert(PositionRecord, Reply<Option<PositionRecord>>),
    Remove(String, Reply<Option<PositionRecord>>),
    SetCheckpoint(u64, Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the position store actor.
///
/// Every change is written to disk before it is acknowledged. If the write
/// fails the in-memory map is restored and the caller gets the error.
#[derive(Clone)]
pub struct PositionStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl PositionStore {
    /// Loads the snapshot and spawns the actor.
    ///
    /// # Errors
    /// Returns an error if the existing snapshot cannot be loaded.
    pub async fn open(repository: PositionRepository) -> Result<Self, StoreError> {
        let loader = repository.clone();
        let snapshot = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|_| StoreError::Closed)??;

        info!(
            path = %repository.path().display(),
            positions = snapshot.positions.len(),
            checkpoint_seq = ?snapshot.checkpoint_seq,
            "Position store opened"
        );

        let (tx, rx) = mpsc::channel(64);
        let actor = StoreActor {
            repository,
            snapshot,
            rx,
        };
        tokio::spawn(actor.run());
        Ok(Self { tx })
    }

    /// Returns a copy of the current snapshot.
    pub async fn snapshot(&self) -> Result<PositionSnapshot, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Returns all records ordered by symbol.
    pub async fn positions(&self) -> Result<Vec<PositionRecord>, StoreError> {
        Ok(self.snapshot().await?.positions.into_values().collect())
    }

    pub async fn get(&self, symbol: &str) -> Result<Option<PositionRecord>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Get(symbol.to_string(), reply)).await?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    /// Inserts or replaces the record for its symbol, returning the previous one.
    pub async fn upsert(&self, record: PositionRecord) -> Result<Option<PositionRecord>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Upsert(record, reply)).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn remove(&self, symbol: &str) -> Result<Option<PositionRecord>, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::Remove(symbol.to_string(), reply))
            .await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn set_checkpoint(&self, seq: u64) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::SetCheckpoint(seq, reply)).await?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Stops the actor after pending commands are handled.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(StoreCommand::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, command: StoreCommand) -> Result<(), StoreError> {
        self.tx.send(command).await.map_err(|_| StoreError::Closed)
    }
}

struct StoreActor {
    repository: PositionRepository,
    snapshot: PositionSnapshot,
    rx: mpsc::Receiver<StoreCommand>,
}

impl StoreActor {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                StoreCommand::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot.clone());
                }
                StoreCommand::Get(symbol, reply) => {
                    let _ = reply.send(self.snapshot.positions.get(&symbol).cloned());
                }
                StoreCommand::Upsert(record, reply) => {
                    let symbol = record.symbol.clone();
                    let previous = self.snapshot.positions.insert(symbol.clone(), record);
                    let result = self.persist().await;
                    if result.is_err() {
                        self.restore(&symbol, previous.clone());
                    }
                    let _ = reply.send(result.map(|()| previous));
                }
                StoreCommand::Remove(symbol, reply) => {
                    let previous = self.snapshot.positions.remove(&symbol);
                    let result = if previous.is_some() {
                        self.persist().await
                    } else {
                        Ok(())
                    };
                    if result.is_err() {
                        self.restore(&symbol, previous.clone());
                    }
                    let _ = reply.send(result.map(|()| previous));
                }
                StoreCommand::SetCheckpoint(seq, reply) => {
                    let previous = self.snapshot.checkpoint_seq.replace(seq);
                    let result = self.persist().await;
                    if result.is_err() {
                        self.snapshot.checkpoint_seq = previous;
                    }
                    let _ = reply.send(result);
                }
                StoreCommand::Shutdown(reply) => {
                    self.rx.close();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("Position store stopped");
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let repository = self.repository.clone();
        let snapshot = self.snapshot.clone();
        let result = tokio::task::spawn_blocking(move || repository.save(&snapshot))
            .await
            .map_err(|_| StoreError::Closed)?;
        if let Err(e) = &result {
            warn!(error = %e, "Position snapshot write failed, change reverted");
        }
        result
    }

    fn restore(&mut self, symbol: &str, previous: Option<PositionRecord>) {
        match previous {
            Some(record) => {
                self.snapshot.positions.insert(symbol.to_string(), record);
            }
            None => {
                self.snapshot.positions.remove(symbol);
            }
        }
    }
}
