//! Auction Models
//!
//! Auction rows and their lifecycle states. All mutations to a running
//! auction flow through its worker; everything here is plain data.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single-item English auction
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Auction {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub category_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,

    // Pricing
    pub starting_price: Decimal,
    pub current_price: Decimal,
    pub reserve_price: Option<Decimal>,

    // Timing
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    // Current state
    pub status: AuctionStatus,
    pub total_bids: i32,
    pub winner_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "auction_status", rename_all = "snake_case")]
pub enum AuctionStatus {
    Upcoming,
    Live,
    Closed,
    Cancelled,
}

impl AuctionStatus {
    /// Terminal states accept no further bids, ever
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuctionStatus::Closed | AuctionStatus::Cancelled)
    }
}

impl Auction {
    /// Whether a bid may commit at `now`: status is live and the clock sits
    /// inside the auction window
    pub fn accepts_bids_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AuctionStatus::Live && now >= self.start_time && now < self.end_time
    }

    /// Seconds until the auction ends, clamped at zero
    pub fn time_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }

    pub fn has_bids(&self) -> bool {
        self.total_bids > 0
    }
}

/// Parameters for listing a new auction
#[derive(Debug, Clone, Deserialize)]
pub struct AuctionDraft {
    pub title: String,
    pub description: Option<String>,
    pub category_id: Option<Uuid>,
    pub image_url: Option<String>,
    pub starting_price: Decimal,
    pub reserve_price: Option<Decimal>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
