//! Postgres Store
//!
//! Production backend. Schema lives in `migrations/`; the bid commit is a
//! single transaction so a crash mid-commit never leaves a torn auction.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Auction, AuctionStatus, Bid, BidView, ProxyBid, User};
use crate::settings::DatabaseSettings;

use super::{StorageError, StorageResult, Store};

const AUCTION_COLUMNS: &str = "id, seller_id, category_id, title, description, image_url, \
     starting_price, current_price, reserve_price, start_time, end_time, \
     status, total_bids, winner_id, created_at";

const BID_VIEW_COLUMNS: &str = "b.id, b.auction_id, b.bidder_id, u.username AS bidder_username, \
     b.amount, b.kind, b.winning, b.sequence, b.created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a pool against the configured database
    pub async fn connect(settings: &DatabaseSettings) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the engine's schema migrations
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Conflict(e.to_string()))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn user(&self, id: Uuid) -> StorageResult<User> {
        sqlx::query_as::<_, User>(
            "SELECT id, username, email, role, active, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound("user"))
    }

    async fn usernames(&self, ids: &[Uuid]) -> StorageResult<HashMap<Uuid, String>> {
        let rows = sqlx::query("SELECT id, username FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("username")))
            .collect())
    }

    async fn auction(&self, id: Uuid) -> StorageResult<Auction> {
        sqlx::query_as::<_, Auction>(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound("auction"))
    }

    async fn insert_auction(&self, auction: &Auction) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO auctions (id, seller_id, category_id, title, description, image_url, \
             starting_price, current_price, reserve_price, start_time, end_time, status, \
             total_bids, winner_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(auction.id)
        .bind(auction.seller_id)
        .bind(auction.category_id)
        .bind(&auction.title)
        .bind(&auction.description)
        .bind(&auction.image_url)
        .bind(auction.starting_price)
        .bind(auction.current_price)
        .bind(auction.reserve_price)
        .bind(auction.start_time)
        .bind(auction.end_time)
        .bind(auction.status)
        .bind(auction.total_bids)
        .bind(auction.winner_id)
        .bind(auction.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_auctions(&self) -> StorageResult<Vec<Auction>> {
        Ok(sqlx::query_as::<_, Auction>(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions WHERE status IN ('upcoming', 'live') \
             ORDER BY end_time"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn due_to_start(&self, now: DateTime<Utc>) -> StorageResult<Vec<Auction>> {
        Ok(sqlx::query_as::<_, Auction>(&format!(
            "SELECT {AUCTION_COLUMNS} FROM auctions \
             WHERE status = 'upcoming' AND start_time <= $1 ORDER BY start_time"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn due_to_close(&self, now: DateTime<Utc>) -> StorageResult<Vec<Uuid>> {
        let rows =
            sqlx::query("SELECT id FROM auctions WHERE status = 'live' AND end_time <= $1")
                .bind(now)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    async fn mark_live(&self, id: Uuid) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE auctions SET status = 'live' WHERE id = $1 AND status = 'upcoming'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound("upcoming auction"));
        }
        Ok(())
    }

    async fn finalize_auction(
        &self,
        id: Uuid,
        status: AuctionStatus,
        winner_id: Option<Uuid>,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE auctions SET status = $2, winner_id = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(winner_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn commit_bid(&self, bid: &Bid, new_price: Decimal) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE bids SET winning = FALSE WHERE auction_id = $1 AND winning = TRUE")
            .bind(bid.auction_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO bids (id, auction_id, bidder_id, amount, kind, winning, sequence, \
             created_at) VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7)",
        )
        .bind(bid.id)
        .bind(bid.auction_id)
        .bind(bid.bidder_id)
        .bind(bid.amount)
        .bind(bid.kind)
        .bind(bid.sequence)
        .bind(bid.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE auctions SET current_price = $2, total_bids = total_bids + 1 WHERE id = $1",
        )
        .bind(bid.auction_id)
        .bind(new_price)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO bidding_history (id, auction_id, bidder_id, amount, kind, sequence, \
             recorded_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(bid.auction_id)
        .bind(bid.bidder_id)
        .bind(bid.amount)
        .bind(bid.kind)
        .bind(bid.sequence)
        .bind(bid.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recent_bids(&self, auction_id: Uuid, limit: i64) -> StorageResult<Vec<BidView>> {
        let mut bids = sqlx::query_as::<_, BidView>(&format!(
            "SELECT {BID_VIEW_COLUMNS} FROM bids b JOIN users u ON u.id = b.bidder_id \
             WHERE b.auction_id = $1 ORDER BY b.sequence DESC LIMIT $2"
        ))
        .bind(auction_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        bids.reverse();
        Ok(bids)
    }

    async fn winning_bid(&self, auction_id: Uuid) -> StorageResult<Option<BidView>> {
        Ok(sqlx::query_as::<_, BidView>(&format!(
            "SELECT {BID_VIEW_COLUMNS} FROM bids b JOIN users u ON u.id = b.bidder_id \
             WHERE b.auction_id = $1 AND b.winning = TRUE"
        ))
        .bind(auction_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn active_proxies(&self, auction_id: Uuid) -> StorageResult<Vec<ProxyBid>> {
        Ok(sqlx::query_as::<_, ProxyBid>(
            "SELECT id, auction_id, bidder_id, max_amount, current_amount, active, created_at \
             FROM proxy_bids WHERE auction_id = $1 AND active = TRUE ORDER BY created_at",
        )
        .bind(auction_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_proxy(&self, proxy: &ProxyBid) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO proxy_bids (id, auction_id, bidder_id, max_amount, current_amount, \
             active, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (auction_id, bidder_id) DO UPDATE \
             SET max_amount = EXCLUDED.max_amount, active = EXCLUDED.active",
        )
        .bind(proxy.id)
        .bind(proxy.auction_id)
        .bind(proxy.bidder_id)
        .bind(proxy.max_amount)
        .bind(proxy.current_amount)
        .bind(proxy.active)
        .bind(proxy.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_proxy(&self, auction_id: Uuid, bidder_id: Uuid) -> StorageResult<()> {
        sqlx::query(
            "UPDATE proxy_bids SET active = FALSE WHERE auction_id = $1 AND bidder_id = $2",
        )
        .bind(auction_id)
        .bind(bidder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_proxies(&self, auction_id: Uuid) -> StorageResult<()> {
        sqlx::query("UPDATE proxy_bids SET active = FALSE WHERE auction_id = $1")
            .bind(auction_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_proxy_progress(
        &self,
        auction_id: Uuid,
        bidder_id: Uuid,
        amount: Decimal,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE proxy_bids SET current_amount = $3 \
             WHERE auction_id = $1 AND bidder_id = $2 AND active = TRUE",
        )
        .bind(auction_id)
        .bind(bidder_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
