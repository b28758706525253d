//! Auction Worker
//!
//! One task per running auction owns that auction's price, bid sequence,
//! winner flag and last-bidder memory. Every mutation arrives as a command
//! on the worker's channel and is processed strictly in arrival order, so
//! the price is monotonically increasing on the live timeline without any
//! row-level locking games.
//!
//! A manual bid that commits is immediately offered to the proxy engine;
//! any counter-bid it produces commits on this same task before the next
//! queued command, so reactive chains are atomic with respect to outside
//! bidders. Closing is funnelled through the same channel, which is what
//! makes "no bid commits after close" hold.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, RejectCode, Rejection};
use crate::gateway::connections::{ConnectionHandle, ConnectionRegistry};
use crate::gateway::protocol::{BidEntry, ServerEvent, WinnerInfo};
use crate::models::{Auction, AuctionStatus, Bid, BidKind, BidView};
use crate::services::autobid::ProxyEngine;
use crate::services::pricing::{self, RecentBid, Telemetry};
use crate::services::rooms::AuctionRooms;
use crate::settings::EngineSettings;
use crate::storage::{StorageError, StorageResult, Store};

/// Telemetry entries kept regardless of age, covering the competition window
const RECENT_MIN_DEPTH: usize = pricing::COMPETITION_DEPTH;
/// Hard bound on the telemetry buffer. The velocity factor saturates at 50
/// bids inside its window, so this loses nothing the policy can see.
const RECENT_MAX_DEPTH: usize = 200;

/// The authenticated originator of a command
#[derive(Debug, Clone)]
pub struct BidderRef {
    pub id: Uuid,
    pub username: String,
}

/// Confirmation returned to a successful bidder
#[derive(Debug, Clone)]
pub struct BidReceipt {
    pub bid_id: Uuid,
    pub amount: Decimal,
    pub sequence: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyTerminal,
}

enum WorkerCommand {
    PlaceBid {
        bidder: BidderRef,
        amount: Decimal,
        reply: oneshot::Sender<Result<BidReceipt, Rejection>>,
    },
    SetProxy {
        bidder: BidderRef,
        max_amount: Decimal,
        reply: oneshot::Sender<Result<Decimal, Rejection>>,
    },
    CancelProxy {
        bidder_id: Uuid,
        reply: oneshot::Sender<Result<(), Rejection>>,
    },
    Subscribe {
        connection: ConnectionHandle,
        reply: oneshot::Sender<()>,
    },
    Promote {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Close {
        reply: oneshot::Sender<Result<CloseOutcome, EngineError>>,
    },
    Cancel {
        requester_id: Uuid,
        is_admin: bool,
        reply: oneshot::Sender<Result<(), Rejection>>,
    },
}

/// Cheaply cloneable sender half of a worker
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub auction_id: Uuid,
    commands: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    pub async fn place_bid(&self, bidder: BidderRef, amount: Decimal) -> Result<BidReceipt, Rejection> {
        let (reply, rx) = oneshot::channel();
        let command = WorkerCommand::PlaceBid { bidder, amount, reply };
        if self.commands.send(command).await.is_err() {
            return Err(RejectCode::NotLive.into());
        }
        rx.await.unwrap_or_else(|_| Err(RejectCode::NotLive.into()))
    }

    pub async fn set_proxy(&self, bidder: BidderRef, max_amount: Decimal) -> Result<Decimal, Rejection> {
        let (reply, rx) = oneshot::channel();
        let command = WorkerCommand::SetProxy { bidder, max_amount, reply };
        if self.commands.send(command).await.is_err() {
            return Err(RejectCode::NotLive.into());
        }
        rx.await.unwrap_or_else(|_| Err(RejectCode::NotLive.into()))
    }

    pub async fn cancel_proxy(&self, bidder_id: Uuid) -> Result<(), Rejection> {
        let (reply, rx) = oneshot::channel();
        let command = WorkerCommand::CancelProxy { bidder_id, reply };
        if self.commands.send(command).await.is_err() {
            return Err(RejectCode::NotLive.into());
        }
        rx.await.unwrap_or_else(|_| Err(RejectCode::NotLive.into()))
    }

    /// Deliver a state + history snapshot to `connection` and add it to the
    /// auction's room, atomically with respect to bid commits
    pub async fn subscribe(&self, connection: ConnectionHandle) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        let command = WorkerCommand::Subscribe { connection, reply };
        if self.commands.send(command).await.is_err() {
            return Err(EngineError::NotRunning(self.auction_id));
        }
        rx.await.map_err(|_| EngineError::NotRunning(self.auction_id))
    }

    pub async fn promote(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(WorkerCommand::Promote { reply }).await.is_err() {
            return Err(EngineError::NotRunning(self.auction_id));
        }
        rx.await.map_err(|_| EngineError::NotRunning(self.auction_id))?
    }

    pub async fn close(&self) -> Result<CloseOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(WorkerCommand::Close { reply }).await.is_err() {
            return Err(EngineError::NotRunning(self.auction_id));
        }
        rx.await.map_err(|_| EngineError::NotRunning(self.auction_id))?
    }

    pub async fn cancel(&self, requester_id: Uuid, is_admin: bool) -> Result<(), Rejection> {
        let (reply, rx) = oneshot::channel();
        let command = WorkerCommand::Cancel { requester_id, is_admin, reply };
        if self.commands.send(command).await.is_err() {
            return Err(RejectCode::NotFound.into());
        }
        rx.await.unwrap_or_else(|_| Err(RejectCode::NotFound.into()))
    }
}

/// Single-writer task for one auction
pub struct AuctionWorker {
    auction: Auction,
    last_bidder: Option<Uuid>,
    recent: VecDeque<RecentBid>,
    usernames: HashMap<Uuid, String>,
    quarantined: bool,

    store: Arc<dyn Store>,
    proxies: Arc<ProxyEngine>,
    rooms: Arc<AuctionRooms>,
    connections: Arc<ConnectionRegistry>,
    settings: EngineSettings,
    commands: mpsc::Receiver<WorkerCommand>,
}

impl AuctionWorker {
    pub fn spawn(
        auction: Auction,
        store: Arc<dyn Store>,
        proxies: Arc<ProxyEngine>,
        rooms: Arc<AuctionRooms>,
        connections: Arc<ConnectionRegistry>,
        settings: EngineSettings,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(settings.command_buffer);
        let auction_id = auction.id;
        let worker = Self {
            auction,
            last_bidder: None,
            recent: VecDeque::new(),
            usernames: HashMap::new(),
            quarantined: false,
            store,
            proxies,
            rooms,
            connections,
            settings,
            commands: rx,
        };
        tokio::spawn(worker.run());
        WorkerHandle { auction_id, commands: tx }
    }

    async fn run(mut self) {
        if let Err(error) = self.seed().await {
            warn!(auction_id = %self.auction.id, %error, "worker seeding failed, starting cold");
        }
        debug!(auction_id = %self.auction.id, status = ?self.auction.status, "auction worker started");
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
        }
        debug!(auction_id = %self.auction.id, "auction worker stopped");
    }

    /// Rebuild last-bidder memory and telemetry from the store
    async fn seed(&mut self) -> StorageResult<()> {
        let bids = self
            .store
            .recent_bids(self.auction.id, RECENT_MAX_DEPTH as i64)
            .await?;
        self.last_bidder = bids.last().map(|b| b.bidder_id);
        for bid in &bids {
            self.usernames.insert(bid.bidder_id, bid.bidder_username.clone());
        }
        self.recent = bids
            .into_iter()
            .map(|b| RecentBid {
                bidder_id: b.bidder_id,
                amount: b.amount,
                created_at: b.created_at,
            })
            .collect();
        self.prune_recent(Utc::now());
        self.proxies.load_auction(self.auction.id).await?;
        Ok(())
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::PlaceBid { bidder, amount, reply } => {
                let result = self.place_manual_bid(&bidder, amount).await;
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    // a counter-bid reacting to this bid commits before any
                    // queued external command
                    self.run_auto_chain(BidKind::Proxy, Some(bidder.id)).await;
                }
            }
            WorkerCommand::SetProxy { bidder, max_amount, reply } => {
                let result = self.set_proxy(&bidder, max_amount).await;
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    self.run_auto_chain(BidKind::Automatic, None).await;
                }
            }
            WorkerCommand::CancelProxy { bidder_id, reply } => {
                let _ = reply.send(self.cancel_proxy(bidder_id).await);
            }
            WorkerCommand::Subscribe { connection, reply } => {
                self.subscribe(connection).await;
                let _ = reply.send(());
            }
            WorkerCommand::Promote { reply } => {
                let _ = reply.send(self.promote().await);
            }
            WorkerCommand::Close { reply } => {
                let _ = reply.send(self.close().await);
            }
            WorkerCommand::Cancel { requester_id, is_admin, reply } => {
                let _ = reply.send(self.cancel(requester_id, is_admin).await);
            }
        }
    }

    async fn place_manual_bid(
        &mut self,
        bidder: &BidderRef,
        amount: Decimal,
    ) -> Result<BidReceipt, Rejection> {
        if self.quarantined {
            return Err(RejectCode::StorageFailure.into());
        }
        let now = Utc::now();
        if !self.auction.accepts_bids_at(now) {
            return Err(RejectCode::NotLive.into());
        }
        if bidder.id == self.auction.seller_id {
            return Err(RejectCode::SellerSelfBid.into());
        }
        if self.last_bidder == Some(bidder.id) {
            return Err(RejectCode::Consecutive.into());
        }
        let telemetry = self.telemetry(now);
        let minimum = self.auction.current_price + pricing::bid_increment(&telemetry);
        if amount < minimum {
            return Err(Rejection::below_minimum(minimum));
        }

        self.usernames.insert(bidder.id, bidder.username.clone());
        self.commit(bidder.id, amount, BidKind::Manual, now).await
    }

    /// Drive the proxy reaction chain until no instruction wants to move.
    /// Bounded: every iteration strictly raises the price and instructions
    /// cap at their maximum.
    async fn run_auto_chain(&mut self, kind: BidKind, trigger: Option<Uuid>) {
        let mut exclude = trigger;
        loop {
            if self.quarantined {
                break;
            }
            let now = Utc::now();
            if !self.auction.accepts_bids_at(now) {
                break;
            }
            let telemetry = self.telemetry(now);
            let Some(counter) = self.proxies.next_counter(
                self.auction.id,
                self.auction.current_price,
                exclude,
                &telemetry,
            ) else {
                break;
            };
            // the current leader never bids against itself
            if Some(counter.bidder_id) == self.last_bidder {
                break;
            }
            let floor = self.auction.current_price + pricing::proxy_increment(&telemetry);
            if counter.amount < floor {
                break;
            }

            match self.commit(counter.bidder_id, counter.amount, kind, now).await {
                Ok(receipt) => {
                    if let Err(error) = self
                        .proxies
                        .record_progress(self.auction.id, counter.bidder_id, receipt.amount)
                        .await
                    {
                        warn!(auction_id = %self.auction.id, %error, "could not persist proxy progress");
                    }
                    exclude = Some(counter.bidder_id);
                }
                Err(rejection) => {
                    warn!(auction_id = %self.auction.id, %rejection, "automatic bid did not commit");
                    break;
                }
            }
        }
    }

    /// Persist a validated bid and publish it. The store call covers the
    /// bid row, price, count, winning flag and history in one transaction.
    async fn commit(
        &mut self,
        bidder_id: Uuid,
        amount: Decimal,
        kind: BidKind,
        now: DateTime<Utc>,
    ) -> Result<BidReceipt, Rejection> {
        if amount <= self.auction.current_price {
            self.quarantine("committed amount would not raise the price");
            return Err(RejectCode::StorageFailure.into());
        }

        let sequence = self.auction.total_bids + 1;
        let bid = Bid {
            id: Uuid::new_v4(),
            auction_id: self.auction.id,
            bidder_id,
            amount,
            kind,
            winning: true,
            sequence,
            created_at: now,
        };
        match self.bounded(self.store.commit_bid(&bid, amount)).await {
            Ok(()) => {}
            Err(error) => {
                warn!(auction_id = %self.auction.id, %error, "bid commit failed");
                return Err(RejectCode::StorageFailure.into());
            }
        }

        self.auction.current_price = amount;
        self.auction.total_bids = sequence;
        self.last_bidder = Some(bidder_id);
        self.recent.push_back(RecentBid { bidder_id, amount, created_at: now });
        self.prune_recent(now);

        let bidder_username = self.username(bidder_id).await;
        self.rooms.publish(
            self.auction.id,
            &ServerEvent::NewBid {
                auction_id: self.auction.id,
                bid_id: bid.id,
                amount,
                bidder_id,
                bidder_username,
                kind,
                seq: sequence,
                timestamp: now,
                total_bids: sequence,
            },
        );
        Ok(BidReceipt { bid_id: bid.id, amount, sequence })
    }

    async fn set_proxy(&mut self, bidder: &BidderRef, max_amount: Decimal) -> Result<Decimal, Rejection> {
        if self.quarantined {
            return Err(RejectCode::StorageFailure.into());
        }
        let now = Utc::now();
        if !self.auction.accepts_bids_at(now) {
            return Err(RejectCode::NotLive.into());
        }
        if bidder.id == self.auction.seller_id {
            return Err(RejectCode::SellerSelfBid.into());
        }
        if max_amount <= self.auction.current_price {
            return Err(RejectCode::InvalidAmount.into());
        }

        self.usernames.insert(bidder.id, bidder.username.clone());
        match self.bounded(self.proxies.set(self.auction.id, bidder.id, max_amount)).await {
            Ok(_) => Ok(max_amount),
            Err(error) => {
                warn!(auction_id = %self.auction.id, %error, "proxy upsert failed");
                Err(RejectCode::StorageFailure.into())
            }
        }
    }

    async fn cancel_proxy(&mut self, bidder_id: Uuid) -> Result<(), Rejection> {
        match self.bounded(self.proxies.cancel(self.auction.id, bidder_id)).await {
            Ok(_) => Ok(()),
            Err(error) => {
                warn!(auction_id = %self.auction.id, %error, "proxy cancel failed");
                Err(RejectCode::StorageFailure.into())
            }
        }
    }

    async fn subscribe(&mut self, connection: ConnectionHandle) {
        let now = Utc::now();
        let telemetry = self.telemetry(now);
        connection.send(state_event(&self.auction, &telemetry));

        let bids = match self
            .bounded(self.store.recent_bids(self.auction.id, self.settings.snapshot_depth))
            .await
        {
            Ok(bids) => bids,
            Err(error) => {
                warn!(auction_id = %self.auction.id, %error, "history snapshot unavailable");
                Vec::new()
            }
        };
        connection.send(snapshot_event(self.auction.id, bids, self.auction.total_bids));

        self.rooms.join(self.auction.id, connection);
    }

    async fn promote(&mut self) -> Result<(), EngineError> {
        if self.auction.status != AuctionStatus::Upcoming {
            return Ok(());
        }
        if self.auction.start_time > Utc::now() {
            return Ok(());
        }
        self.bounded(self.store.mark_live(self.auction.id)).await?;
        self.auction.status = AuctionStatus::Live;
        info!(auction_id = %self.auction.id, "auction is live");
        self.rooms.publish(
            self.auction.id,
            &ServerEvent::AuctionTransition {
                auction_id: self.auction.id,
                status: AuctionStatus::Live,
            },
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<CloseOutcome, EngineError> {
        if self.auction.status.is_terminal() {
            return Ok(CloseOutcome::AlreadyTerminal);
        }

        let winner = self.bounded(self.store.winning_bid(self.auction.id)).await?;
        let winner_id = winner.as_ref().map(|w| w.bidder_id);
        self.bounded(
            self.store
                .finalize_auction(self.auction.id, AuctionStatus::Closed, winner_id),
        )
        .await?;
        self.auction.status = AuctionStatus::Closed;
        self.auction.winner_id = winner_id;

        if let Err(error) = self.proxies.deactivate_all(self.auction.id).await {
            warn!(auction_id = %self.auction.id, %error, "could not deactivate proxy instructions");
        }

        info!(
            auction_id = %self.auction.id,
            winner = ?winner.as_ref().map(|w| w.bidder_username.as_str()),
            final_price = %self.auction.current_price,
            "auction closed"
        );
        self.rooms.publish(
            self.auction.id,
            &ServerEvent::AuctionEnded {
                auction_id: self.auction.id,
                winner: winner.as_ref().map(|w| WinnerInfo {
                    user_id: w.bidder_id,
                    username: w.bidder_username.clone(),
                    amount: w.amount,
                }),
            },
        );
        if let Some(winner) = winner {
            self.connections.send_to_user(
                winner.bidder_id,
                &ServerEvent::YouWon {
                    auction_id: self.auction.id,
                    amount: winner.amount,
                },
            );
        }
        Ok(CloseOutcome::Closed)
    }

    async fn cancel(&mut self, requester_id: Uuid, is_admin: bool) -> Result<(), Rejection> {
        if self.auction.status.is_terminal() {
            return Err(RejectCode::NotFound.into());
        }
        if requester_id != self.auction.seller_id && !is_admin {
            return Err(RejectCode::Forbidden.into());
        }
        if self.auction.has_bids() {
            return Err(RejectCode::Forbidden.into());
        }

        match self
            .bounded(
                self.store
                    .finalize_auction(self.auction.id, AuctionStatus::Cancelled, None),
            )
            .await
        {
            Ok(()) => {}
            Err(error) => {
                warn!(auction_id = %self.auction.id, %error, "cancellation failed");
                return Err(RejectCode::StorageFailure.into());
            }
        }
        self.auction.status = AuctionStatus::Cancelled;
        if let Err(error) = self.proxies.deactivate_all(self.auction.id).await {
            warn!(auction_id = %self.auction.id, %error, "could not deactivate proxy instructions");
        }
        info!(auction_id = %self.auction.id, "auction cancelled by owner");
        self.rooms.publish(
            self.auction.id,
            &ServerEvent::AuctionTransition {
                auction_id: self.auction.id,
                status: AuctionStatus::Cancelled,
            },
        );
        Ok(())
    }

    /// A detected invariant violation is fatal for this auction: refuse
    /// everything until an operator has inspected the rows
    fn quarantine(&mut self, reason: &str) {
        self.quarantined = true;
        error!(
            auction_id = %self.auction.id,
            reason,
            "invariant violation, auction quarantined pending operator intervention"
        );
    }

    /// Trim the telemetry buffer: the last [`RECENT_MIN_DEPTH`] bids stay
    /// regardless of age, older entries stay only while inside the velocity
    /// window, and [`RECENT_MAX_DEPTH`] bounds the whole thing
    fn prune_recent(&mut self, now: DateTime<Utc>) {
        while self.recent.len() > RECENT_MAX_DEPTH {
            self.recent.pop_front();
        }
        let cutoff = now - chrono::Duration::minutes(pricing::VELOCITY_WINDOW_MINUTES);
        while self.recent.len() > RECENT_MIN_DEPTH {
            let oldest_at = match self.recent.front() {
                Some(oldest) => oldest.created_at,
                None => break,
            };
            if oldest_at >= cutoff {
                break;
            }
            self.recent.pop_front();
        }
    }

    fn telemetry(&self, now: DateTime<Utc>) -> Telemetry {
        Telemetry {
            starting_price: self.auction.starting_price,
            current_price: self.auction.current_price,
            total_bids: self.auction.total_bids,
            now,
            ends_at: self.auction.end_time,
            recent: self.recent.iter().cloned().collect(),
        }
    }

    async fn username(&mut self, user_id: Uuid) -> String {
        if let Some(known) = self.usernames.get(&user_id) {
            return known.clone();
        }
        match self.store.user(user_id).await {
            Ok(user) => {
                self.usernames.insert(user_id, user.username.clone());
                user.username
            }
            Err(_) => user_id.to_string(),
        }
    }

    /// Run a store operation under the configured timeout
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        tokio::time::timeout(self.settings.storage_timeout(), operation)
            .await
            .map_err(|_| StorageError::Timeout)?
    }
}

/// Fresh `auction_state` event for one auction
pub fn state_event(auction: &Auction, telemetry: &Telemetry) -> ServerEvent {
    ServerEvent::AuctionState {
        auction_id: auction.id,
        seller_id: auction.seller_id,
        title: auction.title.clone(),
        status: auction.status,
        starting_price: auction.starting_price,
        current_price: auction.current_price,
        reserve_price: auction.reserve_price,
        start_time: auction.start_time,
        end_time: auction.end_time,
        total_bids: auction.total_bids,
        winner_id: auction.winner_id,
        time_remaining_seconds: auction.time_remaining_seconds(telemetry.now),
        suggested_bid: pricing::suggested_next_bid(telemetry),
        next_increment: pricing::bid_increment(telemetry),
        predicted_final_price: pricing::predicted_final_price(telemetry),
    }
}

/// History snapshot for a joining subscriber
pub fn snapshot_event(auction_id: Uuid, bids: Vec<BidView>, last_seq: i32) -> ServerEvent {
    ServerEvent::BidHistorySnapshot {
        auction_id,
        bids: bids
            .into_iter()
            .map(|b| BidEntry {
                bid_id: b.id,
                bidder_username: b.bidder_username,
                amount: b.amount,
                kind: b.kind,
                seq: b.sequence,
                timestamp: b.created_at,
            })
            .collect(),
        last_seq,
    }
}
