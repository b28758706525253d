//! Auction Registry
//!
//! Index of running auction workers. Populated lazily on first reference,
//! rebuilt from the store for every non-terminal auction on startup, and
//! evicted when an auction reaches a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::gateway::connections::ConnectionRegistry;
use crate::models::Auction;
use crate::services::autobid::ProxyEngine;
use crate::services::rooms::AuctionRooms;
use crate::services::worker::{AuctionWorker, WorkerHandle};
use crate::settings::EngineSettings;
use crate::storage::Store;

pub struct AuctionRegistry {
    store: Arc<dyn Store>,
    proxies: Arc<ProxyEngine>,
    rooms: Arc<AuctionRooms>,
    connections: Arc<ConnectionRegistry>,
    settings: EngineSettings,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
}

impl AuctionRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        proxies: Arc<ProxyEngine>,
        rooms: Arc<AuctionRooms>,
        connections: Arc<ConnectionRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            proxies,
            rooms,
            connections,
            settings,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, auction_id: Uuid) -> Option<WorkerHandle> {
        self.workers.lock().get(&auction_id).cloned()
    }

    /// Worker for an auction, loading it from the store on first reference.
    /// Terminal auctions never get a worker.
    pub async fn ensure(&self, auction_id: Uuid) -> Result<WorkerHandle, EngineError> {
        if let Some(handle) = self.get(auction_id) {
            return Ok(handle);
        }
        let auction = self.store.auction(auction_id).await?;
        if auction.status.is_terminal() {
            return Err(EngineError::NotRunning(auction_id));
        }
        Ok(self.adopt(auction))
    }

    /// Register a worker for an already-loaded auction row
    pub fn adopt(&self, auction: Auction) -> WorkerHandle {
        let mut workers = self.workers.lock();
        if let Some(existing) = workers.get(&auction.id) {
            return existing.clone();
        }
        debug!(auction_id = %auction.id, "spawning auction worker");
        let handle = AuctionWorker::spawn(
            auction,
            self.store.clone(),
            self.proxies.clone(),
            self.rooms.clone(),
            self.connections.clone(),
            self.settings.clone(),
        );
        workers.insert(handle.auction_id, handle.clone());
        handle
    }

    /// Drop a worker; its task drains queued commands and stops
    pub fn evict(&self, auction_id: Uuid) {
        if self.workers.lock().remove(&auction_id).is_some() {
            debug!(%auction_id, "auction evicted from registry");
        }
    }

    /// Spawn workers for every non-terminal auction, called once on startup
    pub async fn restore(&self) -> Result<usize, EngineError> {
        let open = self.store.open_auctions().await?;
        let count = open.len();
        for auction in open {
            self.adopt(auction);
        }
        if count > 0 {
            info!(count, "restored auctions from the store");
        }
        Ok(count)
    }

    pub fn active_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn shutdown(&self) {
        self.workers.lock().clear();
    }
}
