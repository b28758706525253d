//! Engine Errors
//!
//! Internal failures and client-visible bid rejections.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageError;

/// Internal engine failure
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("auction {0} is not running")]
    NotRunning(Uuid),
}

/// Stable wire codes for rejected commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    AuthFailed,
    NotLive,
    SellerSelfBid,
    Consecutive,
    BelowMinimum,
    StorageFailure,
    NotFound,
    Forbidden,
    InvalidAmount,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "auth_failed",
            Self::NotLive => "not_live",
            Self::SellerSelfBid => "seller_self_bid",
            Self::Consecutive => "consecutive",
            Self::BelowMinimum => "below_minimum",
            Self::StorageFailure => "storage_failure",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::InvalidAmount => "invalid_amount",
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected command, surfaced synchronously to its originator only
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: RejectCode,
    /// Lowest acceptable amount, populated for `below_minimum`
    pub minimum_bid: Option<Decimal>,
}

impl Rejection {
    pub fn new(code: RejectCode) -> Self {
        Self { code, minimum_bid: None }
    }

    pub fn below_minimum(minimum: Decimal) -> Self {
        Self {
            code: RejectCode::BelowMinimum,
            minimum_bid: Some(minimum),
        }
    }
}

impl From<RejectCode> for Rejection {
    fn from(code: RejectCode) -> Self {
        Self::new(code)
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.minimum_bid {
            Some(min) => write!(f, "{} (minimum {})", self.code, min),
            None => write!(f, "{}", self.code),
        }
    }
}
