//! Bid Models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A committed bid
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bid {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub bidder_id: Uuid,
    pub amount: Decimal,
    pub kind: BidKind,
    /// Exactly one bid per auction carries this flag
    pub winning: bool,
    /// Position in the auction's committed sequence, starting at 1
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "bid_kind", rename_all = "snake_case")]
pub enum BidKind {
    /// Placed directly by a person
    Manual,
    /// Counter-bid reacting to a manual bid on behalf of a standing intent
    Proxy,
    /// Step-up produced when an intent is created or raised
    Automatic,
}

impl BidKind {
    pub fn is_auto(&self) -> bool {
        matches!(self, BidKind::Proxy | BidKind::Automatic)
    }
}

/// A bid joined with its bidder's display name, for histories and events
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BidView {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub bidder_id: Uuid,
    pub bidder_username: String,
    pub amount: Decimal,
    pub kind: BidKind,
    pub winning: bool,
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
}
