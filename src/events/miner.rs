use crate::events::chain::{mine, ChainError, EventChain};
use crate::events::Event;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Front of the single mining worker. Events queue up in a bounded channel
/// and are mined one at a time on a blocking thread, so admission never
/// stalls the receive loop.
#[derive(Debug, Clone)]
pub struct Miner {
    tx: mpsc::Sender<Event>,
}

impl Miner {
    /// Starts the worker. It stops once every `Miner` handle is dropped.
    pub fn spawn(chain: Arc<Mutex<EventChain>>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Event>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let chain = chain.clone();
                match tokio::task::spawn_blocking(move || mine_and_append(&chain, event)).await {
                    Ok(Ok(event)) => info!("Event mined: {}", event),
                    Ok(Err(e)) => warn!("Failed to admit event: {}", e),
                    Err(e) => warn!("Mining task failed: {}", e),
                }
            }
            debug!("Miner stopped");
        });

        (Self { tx }, handle)
    }

    /// Queues an event without waiting; fails when the queue is full.
    pub fn try_submit(&self, event: Event) -> Result<(), ChainError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChainError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChainError::MinerStopped,
        })
    }

    /// Queues an event, waiting for room.
    pub async fn submit(&self, event: Event) -> Result<(), ChainError> {
        self.tx.send(event).await.map_err(|_| ChainError::MinerStopped)
    }
}

// Mines against the tail without holding the lock. If the tail moved in
// the meantime the event is re-linked and mined again.
fn mine_and_append(chain: &Mutex<EventChain>, mut event: Event) -> Result<Event, ChainError> {
    loop {
        let (prev_hash, difficulty) = {
            let chain = chain.blocking_lock();
            (chain.last_hash(), chain.difficulty())
        };

        event.prev_hash = prev_hash;
        mine(&mut event, difficulty)?;

        let mut chain = chain.blocking_lock();
        if chain.last_hash() == event.prev_hash {
            chain.append_mined(event.clone())?;
            return Ok(event);
        }
        debug!("Chain tail moved while mining, retrying");
    }
}
