//! Wire Protocol
//!
//! JSON messages exchanged over the persistent channel. Amounts travel as
//! fixed-point decimal strings, never as binary floats.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RejectCode;
use crate::models::{AuctionStatus, BidKind};

/// Commands a client may send. The authenticated identity is attached by
/// the session, never taken from the payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinAuction { auction_id: Uuid },
    LeaveAuction { auction_id: Uuid },
    PlaceBid { auction_id: Uuid, amount: Decimal },
    SetProxy { auction_id: Uuid, max_amount: Decimal },
    CancelProxy { auction_id: Uuid },
}

/// Events pushed to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuctionState {
        auction_id: Uuid,
        seller_id: Uuid,
        title: String,
        status: AuctionStatus,
        starting_price: Decimal,
        current_price: Decimal,
        reserve_price: Option<Decimal>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        total_bids: i32,
        winner_id: Option<Uuid>,
        time_remaining_seconds: i64,
        suggested_bid: Decimal,
        next_increment: Decimal,
        predicted_final_price: Decimal,
    },
    BidHistorySnapshot {
        auction_id: Uuid,
        bids: Vec<BidEntry>,
        last_seq: i32,
    },
    NewBid {
        auction_id: Uuid,
        bid_id: Uuid,
        amount: Decimal,
        bidder_id: Uuid,
        bidder_username: String,
        kind: BidKind,
        seq: i32,
        timestamp: DateTime<Utc>,
        total_bids: i32,
    },
    AuctionTransition {
        auction_id: Uuid,
        status: AuctionStatus,
    },
    AuctionEnded {
        auction_id: Uuid,
        winner: Option<WinnerInfo>,
    },
    YouWon {
        auction_id: Uuid,
        amount: Decimal,
    },
    BidRejected {
        auction_id: Uuid,
        reason: RejectCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum_bid: Option<Decimal>,
    },
    ProxySet {
        auction_id: Uuid,
        /// Absent when a proxy was cancelled
        max_amount: Option<Decimal>,
    },
    ProxyRejected {
        auction_id: Uuid,
        reason: RejectCode,
    },
    PeerJoined {
        auction_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    PeerLeft {
        auction_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    Error {
        message: String,
    },
}

/// One history entry in a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BidEntry {
    pub bid_id: Uuid,
    pub bidder_username: String,
    pub amount: Decimal,
    pub kind: BidKind,
    pub seq: i32,
    pub timestamp: DateTime<Utc>,
}

/// Closing result attached to `auction_ended`
#[derive(Debug, Clone, Serialize)]
pub struct WinnerInfo {
    pub user_id: Uuid,
    pub username: String,
    pub amount: Decimal,
}
