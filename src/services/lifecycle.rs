//! Lifecycle Scheduler
//!
//! Wall-clock loop promoting due auctions to live and funnelling closes
//! through each auction's worker so no bid can land after its close. The
//! loop is self-healing: a failed or missed transition is simply retried
//! on the next tick.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::services::registry::AuctionRegistry;
use crate::settings::SchedulerSettings;
use crate::storage::Store;

pub struct LifecycleScheduler {
    store: Arc<dyn Store>,
    registry: Arc<AuctionRegistry>,
    settings: SchedulerSettings,
}

impl LifecycleScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<AuctionRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        Self { store, registry, settings }
    }

    /// Run the tick loop until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(tick_ms = self.settings.tick_ms, "lifecycle scheduler running");
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("lifecycle scheduler stopped");
        })
    }

    async fn tick_once(&self) {
        let now = Utc::now();

        match self.store.due_to_start(now).await {
            Ok(due) => {
                for auction in due {
                    let auction_id = auction.id;
                    let handle = self.registry.adopt(auction);
                    if let Err(error) = handle.promote().await {
                        warn!(%auction_id, %error, "promotion failed, retrying next tick");
                    }
                }
            }
            Err(error) => warn!(%error, "could not scan for due starts"),
        }

        match self.store.due_to_close(now).await {
            Ok(due) => {
                for auction_id in due {
                    match self.registry.ensure(auction_id).await {
                        Ok(handle) => match handle.close().await {
                            Ok(_) => self.registry.evict(auction_id),
                            Err(error) => {
                                warn!(%auction_id, %error, "close failed, retrying next tick")
                            }
                        },
                        // already terminal elsewhere; nothing to do
                        Err(EngineError::NotRunning(_)) => {}
                        Err(error) => warn!(%auction_id, %error, "could not reach auction worker"),
                    }
                }
            }
            Err(error) => warn!(%error, "could not scan for due closes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connections::ConnectionRegistry;
    use crate::models::{Auction, AuctionStatus, Bid, BidKind, Role};
    use crate::services::autobid::ProxyEngine;
    use crate::services::rooms::AuctionRooms;
    use crate::settings::EngineSettings;
    use crate::storage::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use uuid::Uuid;

    struct Rig {
        registry: Arc<AuctionRegistry>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    fn start_scheduler(store: Arc<MemoryStore>) -> Rig {
        let rooms = Arc::new(AuctionRooms::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let proxies = Arc::new(ProxyEngine::new(store.clone()));
        let registry = Arc::new(AuctionRegistry::new(
            store.clone(),
            proxies,
            rooms,
            connections,
            EngineSettings::default(),
        ));
        let scheduler = LifecycleScheduler::new(
            store.clone(),
            registry.clone(),
            SchedulerSettings { tick_ms: 20 },
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = scheduler.spawn(shutdown_rx);
        Rig { registry, shutdown, task }
    }

    async fn seed(
        store: &MemoryStore,
        status: AuctionStatus,
        starts_in: ChronoDuration,
        ends_in: ChronoDuration,
    ) -> Auction {
        let seller = store.add_user("seller", Role::Seller);
        let now = Utc::now();
        let auction = Auction {
            id: Uuid::new_v4(),
            seller_id: seller,
            category_id: None,
            title: "Lot".to_string(),
            description: None,
            image_url: None,
            starting_price: dec!(100),
            current_price: dec!(100),
            reserve_price: None,
            start_time: now + starts_in,
            end_time: now + ends_in,
            status,
            total_bids: 0,
            winner_id: None,
            created_at: now,
        };
        store.insert_auction(&auction).await.unwrap();
        auction
    }

    async fn wait_until_status(store: &MemoryStore, id: Uuid, status: AuctionStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store
                    .auction(id)
                    .await
                    .map(|a| a.status == status)
                    .unwrap_or(false)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("status not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn due_upcoming_auction_goes_live() {
        let store = Arc::new(MemoryStore::new());
        let auction = seed(
            &store,
            AuctionStatus::Upcoming,
            ChronoDuration::seconds(-1),
            ChronoDuration::hours(1),
        )
        .await;
        let rig = start_scheduler(store.clone());

        wait_until_status(&store, auction.id, AuctionStatus::Live).await;
        assert_eq!(rig.registry.active_count(), 1);

        let _ = rig.shutdown.send(true);
        let _ = rig.task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_live_auction_closes_with_winner() {
        let store = Arc::new(MemoryStore::new());
        let auction = seed(
            &store,
            AuctionStatus::Live,
            ChronoDuration::minutes(-10),
            ChronoDuration::seconds(-1),
        )
        .await;
        let bidder = store.add_user("alice", Role::Bidder);
        let bid = Bid {
            id: Uuid::new_v4(),
            auction_id: auction.id,
            bidder_id: bidder,
            amount: dec!(500),
            kind: BidKind::Manual,
            winning: true,
            sequence: 1,
            created_at: Utc::now(),
        };
        store.commit_bid(&bid, dec!(500)).await.unwrap();

        let rig = start_scheduler(store.clone());
        wait_until_status(&store, auction.id, AuctionStatus::Closed).await;

        let closed = store.auction(auction.id).await.unwrap();
        assert_eq!(closed.winner_id, Some(bidder));

        // the finished auction drops out of the registry
        tokio::time::timeout(Duration::from_secs(5), async {
            while rig.registry.active_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry still holds the closed auction");

        let _ = rig.shutdown.send(true);
        let _ = rig.task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn future_auctions_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let auction = seed(
            &store,
            AuctionStatus::Upcoming,
            ChronoDuration::hours(1),
            ChronoDuration::hours(2),
        )
        .await;
        let rig = start_scheduler(store.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let unchanged = store.auction(auction.id).await.unwrap();
        assert_eq!(unchanged.status, AuctionStatus::Upcoming);
        assert_eq!(rig.registry.active_count(), 0);

        let _ = rig.shutdown.send(true);
        let _ = rig.task.await;
    }
}
