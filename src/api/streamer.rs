//! SSE fan-out of issuances to connected stream clients
//!
//! Keeps a client registry under a read/write lock: distribution takes the
//! read lock, registration the write lock. Slow clients lose updates rather
//! than blocking the fan-out; disconnected clients are pruned lazily.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::types::Issuance;

/// Buffered updates per client before drops kick in.
const CLIENT_BUFFER: usize = 10;

#[derive(Default)]
pub struct PriceStreamer {
    clients: RwLock<HashMap<Uuid, mpsc::Sender<Issuance>>>,
}

impl PriceStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new stream client and hand back its receiver.
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<Issuance>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        self.clients.write().await.insert(client_id, tx);
        debug!(client = %client_id, "Stream client registered");
        (client_id, rx)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Forward issuances from the consensus fan-out to every client until
    /// shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<Issuance>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                issuance = incoming.recv() => {
                    let Some(issuance) = issuance else { return };
                    self.distribute(issuance).await;
                }
            }
        }
    }

    async fn distribute(&self, issuance: Issuance) {
        let mut gone = Vec::new();
        {
            let clients = self.clients.read().await;
            for (client_id, tx) in clients.iter() {
                match tx.try_send(issuance.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(client = %client_id, "Client buffer full, skipping update");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        gone.push(*client_id);
                    }
                }
            }
        }

        if !gone.is_empty() {
            let mut clients = self.clients.write().await;
            for client_id in gone {
                clients.remove(&client_id);
                debug!(client = %client_id, "Stream client unregistered");
            }
        }
    }
}
