//! Gavel Data Models
//!
//! Engine-owned rows and their in-memory shapes:
//! - Users (read-only to the engine)
//! - Auctions and their lifecycle states
//! - Bids and the committed sequence
//! - Proxy bids (standing maximum-bid instructions)

pub mod auction;
pub mod bid;
pub mod proxy;
pub mod user;

pub use auction::{Auction, AuctionDraft, AuctionStatus};
pub use bid::{Bid, BidKind, BidView};
pub use proxy::ProxyBid;
pub use user::{Role, User};
