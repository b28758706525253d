//! Proxy Bid Models
//!
//! A proxy bid is a bidder's standing instruction authorising automatic
//! counter-bids up to a maximum amount.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standing maximum-bid instruction; at most one row per (auction, bidder)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProxyBid {
    pub id: Uuid,
    pub auction_id: Uuid,
    pub bidder_id: Uuid,
    pub max_amount: Decimal,
    /// Highest amount actually bid on behalf of this instruction so far
    pub current_amount: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ProxyBid {
    pub fn new(auction_id: Uuid, bidder_id: Uuid, max_amount: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            auction_id,
            bidder_id,
            max_amount,
            current_amount: Decimal::ZERO,
            active: true,
            created_at: now,
        }
    }

    /// Whether this instruction can still outbid the given price
    pub fn can_beat(&self, price: Decimal) -> bool {
        self.active && self.max_amount > price
    }
}
