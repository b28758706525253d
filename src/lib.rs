//! Gavel - Real-time English Auction Engine
//!
//! An authoritative auction engine providing:
//! - Per-auction single-writer bid serialization
//! - Automatic (proxy) bidding with greedy counter-bids
//! - Dynamic bid increments computed from live auction telemetry
//! - Wall-clock lifecycle transitions (upcoming -> live -> closed)
//! - Ordered event broadcast to every subscriber of an auction
//!
//! # Architecture
//!
//! The crate follows a layered architecture:
//! - **Models**: Data structures and database entities
//! - **Services**: Workers, registry, proxy engine, pricing, lifecycle, rooms
//! - **Gateway**: WebSocket sessions, wire protocol, connection registry
//! - **Storage**: `Store` trait with Postgres and in-memory backends
//!
//! All mutations to one auction flow through that auction's worker task,
//! which is what makes the price monotonic and the event stream totally
//! ordered without cross-auction coordination.

pub mod auth;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod models;
pub mod services;
pub mod settings;
pub mod storage;

pub use engine::AuctionEngine;
pub use error::{EngineError, RejectCode, Rejection};
pub use settings::GavelSettings;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use auth::{AuthError, Identity, JwtVerifier, TokenVerifier};
pub use gateway::{ClientCommand, ConnectionHandle, ConnectionRegistry, ServerEvent};
pub use models::{Auction, AuctionDraft, AuctionStatus, Bid, BidKind, ProxyBid, Role, User};
pub use services::pricing::{self, Telemetry};
pub use storage::{MemoryStore, PgStore, StorageError, Store};
