//! Gavel Engine Services
//!
//! The moving parts of the auction engine: per-auction workers, the
//! registry that owns them, the proxy engine, pricing policy, lifecycle
//! scheduling and broadcast rooms.

pub mod autobid;
pub mod lifecycle;
pub mod pricing;
pub mod registry;
pub mod rooms;
pub mod worker;

pub use autobid::ProxyEngine;
pub use lifecycle::LifecycleScheduler;
pub use registry::AuctionRegistry;
pub use rooms::AuctionRooms;
pub use worker::{AuctionWorker, BidReceipt, BidderRef, WorkerHandle};
