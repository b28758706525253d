//! Auction Engine
//!
//! Wires the services together and exposes the command surface: socket
//! commands from the gateway plus the owner-facing lifecycle operations
//! (create, cancel). Owns the lifecycle scheduler and shuts everything
//! down deterministically.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{FailureThrottle, Identity, TokenVerifier};
use crate::error::{EngineError, RejectCode, Rejection};
use crate::gateway::connections::{ConnectionHandle, ConnectionRegistry};
use crate::gateway::protocol::{ClientCommand, ServerEvent};
use crate::models::{Auction, AuctionDraft, AuctionStatus};
use crate::services::autobid::ProxyEngine;
use crate::services::lifecycle::LifecycleScheduler;
use crate::services::pricing::{RecentBid, Telemetry};
use crate::services::registry::AuctionRegistry;
use crate::services::rooms::AuctionRooms;
use crate::services::worker::{self, BidderRef};
use crate::settings::GavelSettings;
use crate::storage::{StorageError, Store};

pub struct AuctionEngine {
    settings: GavelSettings,
    store: Arc<dyn Store>,
    rooms: Arc<AuctionRooms>,
    connections: Arc<ConnectionRegistry>,
    registry: Arc<AuctionRegistry>,
    verifier: Arc<dyn TokenVerifier>,
    throttle: FailureThrottle,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl AuctionEngine {
    /// Build the engine, restore every non-terminal auction from the
    /// store, and start the lifecycle scheduler
    pub async fn start(
        settings: GavelSettings,
        store: Arc<dyn Store>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Arc<Self>, EngineError> {
        let rooms = Arc::new(AuctionRooms::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let proxies = Arc::new(ProxyEngine::new(store.clone()));
        let registry = Arc::new(AuctionRegistry::new(
            store.clone(),
            proxies,
            rooms.clone(),
            connections.clone(),
            settings.engine.clone(),
        ));
        registry.restore().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler =
            LifecycleScheduler::new(store.clone(), registry.clone(), settings.scheduler.clone())
                .spawn(shutdown_rx);
        let throttle = FailureThrottle::new(&settings.auth);
        info!("auction engine started");

        Ok(Arc::new(Self {
            settings,
            store,
            rooms,
            connections,
            registry,
            verifier,
            throttle,
            shutdown,
            scheduler: Mutex::new(Some(scheduler)),
        }))
    }

    pub fn settings(&self) -> &GavelSettings {
        &self.settings
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn verifier(&self) -> &dyn TokenVerifier {
        self.verifier.as_ref()
    }

    pub fn throttle(&self) -> &FailureThrottle {
        &self.throttle
    }

    pub fn active_auctions(&self) -> usize {
        self.registry.active_count()
    }

    /// Dispatch one authenticated socket command
    pub async fn handle_command(
        &self,
        identity: &Identity,
        connection: &ConnectionHandle,
        command: ClientCommand,
    ) {
        match command {
            ClientCommand::JoinAuction { auction_id } => {
                self.join(connection, auction_id).await;
            }
            ClientCommand::LeaveAuction { auction_id } => {
                self.rooms.leave(auction_id, connection.id);
            }
            ClientCommand::PlaceBid { auction_id, amount } => {
                self.place_bid(identity, connection, auction_id, amount).await;
            }
            ClientCommand::SetProxy { auction_id, max_amount } => {
                self.set_proxy(identity, connection, auction_id, max_amount).await;
            }
            ClientCommand::CancelProxy { auction_id } => {
                self.cancel_proxy(identity, connection, auction_id).await;
            }
        }
    }

    /// Join always answers with a fresh state + history snapshot, which is
    /// also how clients resynchronise after detecting a sequence gap
    async fn join(&self, connection: &ConnectionHandle, auction_id: Uuid) {
        match self.registry.ensure(auction_id).await {
            Ok(handle) => {
                if handle.subscribe(connection.clone()).await.is_err() {
                    connection.send(ServerEvent::Error {
                        message: format!("auction {auction_id} is unavailable"),
                    });
                }
            }
            // terminal auctions are still viewable, just without a worker
            Err(EngineError::NotRunning(_)) => match self.store.auction(auction_id).await {
                Ok(auction) => self.send_terminal_snapshot(connection, auction).await,
                Err(_) => connection.send_not_found(auction_id),
            },
            Err(EngineError::Storage(StorageError::NotFound(_))) => {
                connection.send_not_found(auction_id);
            }
            Err(error) => {
                warn!(%auction_id, %error, "join failed");
                connection.send(ServerEvent::Error {
                    message: format!("auction {auction_id} is unavailable"),
                });
            }
        }
    }

    async fn send_terminal_snapshot(&self, connection: &ConnectionHandle, auction: Auction) {
        let now = Utc::now();
        let bids = self
            .store
            .recent_bids(auction.id, self.settings.engine.snapshot_depth)
            .await
            .unwrap_or_default();
        let telemetry = Telemetry {
            starting_price: auction.starting_price,
            current_price: auction.current_price,
            total_bids: auction.total_bids,
            now,
            ends_at: auction.end_time,
            recent: bids
                .iter()
                .map(|b| RecentBid {
                    bidder_id: b.bidder_id,
                    amount: b.amount,
                    created_at: b.created_at,
                })
                .collect(),
        };
        connection.send(worker::state_event(&auction, &telemetry));
        connection.send(worker::snapshot_event(auction.id, bids, auction.total_bids));
        self.rooms.join(auction.id, connection.clone());
    }

    async fn place_bid(
        &self,
        identity: &Identity,
        connection: &ConnectionHandle,
        auction_id: Uuid,
        amount: Decimal,
    ) {
        if let Err(code) = validate_amount(amount) {
            connection.send(ServerEvent::BidRejected {
                auction_id,
                reason: code,
                minimum_bid: None,
            });
            return;
        }
        let bidder = BidderRef {
            id: identity.user_id,
            username: identity.username.clone(),
        };
        let result = match self.registry.ensure(auction_id).await {
            Ok(handle) => handle.place_bid(bidder, amount).await,
            Err(error) => Err(rejection_for(error)),
        };
        if let Err(rejection) = result {
            connection.send(ServerEvent::BidRejected {
                auction_id,
                reason: rejection.code,
                minimum_bid: rejection.minimum_bid,
            });
        }
    }

    async fn set_proxy(
        &self,
        identity: &Identity,
        connection: &ConnectionHandle,
        auction_id: Uuid,
        max_amount: Decimal,
    ) {
        if let Err(code) = validate_amount(max_amount) {
            connection.send(ServerEvent::ProxyRejected { auction_id, reason: code });
            return;
        }
        let bidder = BidderRef {
            id: identity.user_id,
            username: identity.username.clone(),
        };
        let result = match self.registry.ensure(auction_id).await {
            Ok(handle) => handle.set_proxy(bidder, max_amount).await,
            Err(error) => Err(rejection_for(error)),
        };
        match result {
            Ok(confirmed) => connection.send(ServerEvent::ProxySet {
                auction_id,
                max_amount: Some(confirmed),
            }),
            Err(rejection) => connection.send(ServerEvent::ProxyRejected {
                auction_id,
                reason: rejection.code,
            }),
        };
    }

    async fn cancel_proxy(
        &self,
        identity: &Identity,
        connection: &ConnectionHandle,
        auction_id: Uuid,
    ) {
        let result = match self.registry.ensure(auction_id).await {
            Ok(handle) => handle.cancel_proxy(identity.user_id).await,
            Err(error) => Err(rejection_for(error)),
        };
        match result {
            Ok(()) => connection.send(ServerEvent::ProxySet { auction_id, max_amount: None }),
            Err(rejection) => connection.send(ServerEvent::ProxyRejected {
                auction_id,
                reason: rejection.code,
            }),
        };
    }

    /// Seller-facing: list a new auction. Goes live immediately when its
    /// window has already opened.
    pub async fn create_auction(
        &self,
        identity: &Identity,
        draft: AuctionDraft,
    ) -> Result<Auction, Rejection> {
        if !identity.role.can_sell() {
            return Err(RejectCode::Forbidden.into());
        }
        if validate_amount(draft.starting_price).is_err()
            || draft
                .reserve_price
                .is_some_and(|reserve| validate_amount(reserve).is_err())
            || draft.end_time <= draft.start_time
        {
            return Err(RejectCode::InvalidAmount.into());
        }

        let now = Utc::now();
        let status = if draft.start_time <= now {
            AuctionStatus::Live
        } else {
            AuctionStatus::Upcoming
        };
        let auction = Auction {
            id: Uuid::new_v4(),
            seller_id: identity.user_id,
            category_id: draft.category_id,
            title: draft.title,
            description: draft.description,
            image_url: draft.image_url,
            starting_price: draft.starting_price,
            current_price: draft.starting_price,
            reserve_price: draft.reserve_price,
            start_time: draft.start_time,
            end_time: draft.end_time,
            status,
            total_bids: 0,
            winner_id: None,
            created_at: now,
        };
        if let Err(error) = self.store.insert_auction(&auction).await {
            warn!(%error, "could not persist new auction");
            return Err(RejectCode::StorageFailure.into());
        }
        info!(auction_id = %auction.id, seller = %identity.username, ?status, "auction listed");
        if status == AuctionStatus::Live {
            self.registry.adopt(auction.clone());
        }
        Ok(auction)
    }

    /// Seller-facing: withdraw an auction nobody has bid on yet
    pub async fn cancel_auction(
        &self,
        identity: &Identity,
        auction_id: Uuid,
    ) -> Result<(), Rejection> {
        let handle = match self.registry.ensure(auction_id).await {
            Ok(handle) => handle,
            Err(error) => return Err(rejection_for(error)),
        };
        handle
            .cancel(identity.user_id, identity.role.is_admin())
            .await?;
        self.registry.evict(auction_id);
        Ok(())
    }

    /// Tear down a disconnected client: every joined room, then the
    /// connection registry entry
    pub fn disconnect(&self, connection: &ConnectionHandle) {
        self.rooms.leave_all(connection.id);
        self.connections.unregister(connection.user_id, connection.id);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let scheduler = self.scheduler.lock().take();
        if let Some(task) = scheduler {
            let _ = task.await;
        }
        self.registry.shutdown();
        info!("auction engine stopped");
    }
}

impl ConnectionHandle {
    fn send_not_found(&self, auction_id: Uuid) {
        self.send(ServerEvent::Error {
            message: format!("auction {auction_id} not found"),
        });
    }
}

/// Amounts must be positive with at most two fractional digits
fn validate_amount(amount: Decimal) -> Result<(), RejectCode> {
    if amount <= Decimal::ZERO || amount.scale() > 2 {
        return Err(RejectCode::InvalidAmount);
    }
    Ok(())
}

fn rejection_for(error: EngineError) -> Rejection {
    match error {
        // a terminal auction exists but takes no commands
        EngineError::NotRunning(_) => RejectCode::NotLive.into(),
        EngineError::Storage(StorageError::NotFound(_)) => RejectCode::NotFound.into(),
        _ => RejectCode::StorageFailure.into(),
    }
}
