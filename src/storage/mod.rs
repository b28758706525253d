//! Persistent Store
//!
//! The engine talks to its relational store through the [`Store`] trait so
//! the same services run against Postgres in production and an in-memory
//! backend in tests.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Auction, AuctionStatus, Bid, BidView, ProxyBid, User};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("store operation timed out")]
    Timeout,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Relational store operations used by the engine.
///
/// `commit_bid` is the hot path and must be atomic: the bid row, the
/// auction's price and count, the winning-flag handover, and the history
/// row all land in one transaction or not at all.
#[async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn user(&self, id: Uuid) -> StorageResult<User>;
    async fn usernames(&self, ids: &[Uuid]) -> StorageResult<HashMap<Uuid, String>>;

    // Auctions
    async fn auction(&self, id: Uuid) -> StorageResult<Auction>;
    async fn insert_auction(&self, auction: &Auction) -> StorageResult<()>;
    /// Non-terminal auctions, for registry reconstruction on startup
    async fn open_auctions(&self) -> StorageResult<Vec<Auction>>;
    async fn due_to_start(&self, now: DateTime<Utc>) -> StorageResult<Vec<Auction>>;
    async fn due_to_close(&self, now: DateTime<Utc>) -> StorageResult<Vec<Uuid>>;
    async fn mark_live(&self, id: Uuid) -> StorageResult<()>;
    async fn finalize_auction(
        &self,
        id: Uuid,
        status: AuctionStatus,
        winner_id: Option<Uuid>,
    ) -> StorageResult<()>;

    // Bids
    async fn commit_bid(&self, bid: &Bid, new_price: Decimal) -> StorageResult<()>;
    /// Most recent bids first by sequence descending, returned oldest first
    async fn recent_bids(&self, auction_id: Uuid, limit: i64) -> StorageResult<Vec<BidView>>;
    async fn winning_bid(&self, auction_id: Uuid) -> StorageResult<Option<BidView>>;

    // Proxy bids
    async fn active_proxies(&self, auction_id: Uuid) -> StorageResult<Vec<ProxyBid>>;
    async fn upsert_proxy(&self, proxy: &ProxyBid) -> StorageResult<()>;
    async fn deactivate_proxy(&self, auction_id: Uuid, bidder_id: Uuid) -> StorageResult<()>;
    async fn deactivate_proxies(&self, auction_id: Uuid) -> StorageResult<()>;
    async fn record_proxy_progress(
        &self,
        auction_id: Uuid,
        bidder_id: Uuid,
        amount: Decimal,
    ) -> StorageResult<()>;
}
