//! Proxy Engine
//!
//! Holds the active maximum-bid instructions and computes greedy
//! counter-bids when an auction's price moves. The policy is "bid the
//! minimum you must": a lone contender steps just above the price, while
//! the strongest of several contenders jumps just past the second-best
//! maximum, capped at its own.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::models::ProxyBid;
use crate::services::pricing::{self, Telemetry};
use crate::storage::{StorageResult, Store};

/// An automatic bid the worker should commit next
#[derive(Debug, Clone, PartialEq)]
pub struct AutoBid {
    pub bidder_id: Uuid,
    pub amount: Decimal,
}

/// Active proxy instructions, indexed by auction
pub struct ProxyEngine {
    store: Arc<dyn Store>,
    intents: Mutex<HashMap<Uuid, Vec<ProxyBid>>>,
}

impl ProxyEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            intents: Mutex::new(HashMap::new()),
        }
    }

    /// Prime the in-memory index from the store, called when a worker spawns
    pub async fn load_auction(&self, auction_id: Uuid) -> StorageResult<()> {
        let active = self.store.active_proxies(auction_id).await?;
        self.intents.lock().insert(auction_id, active);
        Ok(())
    }

    /// Create or raise an instruction. Amount validation against the
    /// current price happens in the worker, which owns that price.
    pub async fn set(
        &self,
        auction_id: Uuid,
        bidder_id: Uuid,
        max_amount: Decimal,
    ) -> StorageResult<ProxyBid> {
        let updated = {
            let mut intents = self.intents.lock();
            let list = intents.entry(auction_id).or_default();
            match list.iter_mut().find(|p| p.bidder_id == bidder_id) {
                Some(existing) => {
                    // raises keep the original creation time so long-standing
                    // instructions win max-amount ties
                    existing.max_amount = max_amount;
                    existing.active = true;
                    existing.clone()
                }
                None => {
                    let fresh = ProxyBid::new(auction_id, bidder_id, max_amount, Utc::now());
                    list.push(fresh.clone());
                    fresh
                }
            }
        };
        self.store.upsert_proxy(&updated).await?;
        debug!(%auction_id, %bidder_id, %max_amount, "proxy instruction set");
        Ok(updated)
    }

    /// Deactivate one bidder's instruction; returns whether one was active
    pub async fn cancel(&self, auction_id: Uuid, bidder_id: Uuid) -> StorageResult<bool> {
        let had_active = {
            let mut intents = self.intents.lock();
            intents
                .get_mut(&auction_id)
                .map(|list| {
                    let mut found = false;
                    for proxy in list.iter_mut().filter(|p| p.bidder_id == bidder_id) {
                        found |= proxy.active;
                        proxy.active = false;
                    }
                    found
                })
                .unwrap_or(false)
        };
        if had_active {
            self.store.deactivate_proxy(auction_id, bidder_id).await?;
        }
        Ok(had_active)
    }

    /// Deactivate every instruction for an auction, used at close
    pub async fn deactivate_all(&self, auction_id: Uuid) -> StorageResult<()> {
        self.intents.lock().remove(&auction_id);
        self.store.deactivate_proxies(auction_id).await
    }

    /// Compute the next automatic counter-bid after the price moved to
    /// `price`, excluding the bidder who caused the move. Returns `None`
    /// when no instruction can (or needs to) react.
    pub fn next_counter(
        &self,
        auction_id: Uuid,
        price: Decimal,
        exclude: Option<Uuid>,
        telemetry: &Telemetry,
    ) -> Option<AutoBid> {
        let intents = self.intents.lock();
        let list = intents.get(&auction_id)?;

        let mut contenders: Vec<&ProxyBid> = list
            .iter()
            .filter(|p| p.can_beat(price) && Some(p.bidder_id) != exclude)
            .collect();
        if contenders.is_empty() {
            return None;
        }
        contenders.sort_by(|a, b| {
            b.max_amount
                .cmp(&a.max_amount)
                .then(a.created_at.cmp(&b.created_at))
        });

        let increment = pricing::proxy_increment(telemetry);
        let top = contenders[0];
        let counter = match contenders.get(1) {
            None => price + increment,
            Some(second) => (second.max_amount + increment)
                .min(top.max_amount)
                .max(price + increment),
        };
        if counter > top.max_amount {
            return None;
        }
        Some(AutoBid {
            bidder_id: top.bidder_id,
            amount: counter,
        })
    }

    /// Persist how far an instruction has actually bid, after its
    /// counter-bid committed
    pub async fn record_progress(
        &self,
        auction_id: Uuid,
        bidder_id: Uuid,
        amount: Decimal,
    ) -> StorageResult<()> {
        {
            let mut intents = self.intents.lock();
            if let Some(list) = intents.get_mut(&auction_id) {
                if let Some(proxy) = list.iter_mut().find(|p| p.bidder_id == bidder_id && p.active)
                {
                    proxy.current_amount = amount;
                }
            }
        }
        self.store.record_proxy_progress(auction_id, bidder_id, amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn telemetry(current: Decimal) -> Telemetry {
        let now = Utc::now();
        Telemetry {
            starting_price: dec!(100),
            current_price: current,
            total_bids: 0,
            now,
            ends_at: now + Duration::hours(2),
            recent: Vec::new(),
        }
    }

    async fn engine() -> (ProxyEngine, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let engine = ProxyEngine::new(store);
        let auction_id = Uuid::new_v4();
        engine.load_auction(auction_id).await.unwrap();
        (engine, auction_id)
    }

    #[tokio::test]
    async fn lone_instruction_steps_past_the_price() {
        let (engine, auction_id) = engine().await;
        let bidder = Uuid::new_v4();
        engine.set(auction_id, bidder, dec!(200)).await.unwrap();

        // proxy increment at a price of 100 is 4 (0.7 * 5 snapped to 1s)
        let counter = engine
            .next_counter(auction_id, dec!(100), None, &telemetry(dec!(100)))
            .unwrap();
        assert_eq!(counter, AutoBid { bidder_id: bidder, amount: dec!(104) });
    }

    #[tokio::test]
    async fn strongest_instruction_beats_the_second_best_max() {
        let (engine, auction_id) = engine().await;
        let weak = Uuid::new_v4();
        let strong = Uuid::new_v4();
        engine.set(auction_id, weak, dec!(150)).await.unwrap();
        engine.set(auction_id, strong, dec!(200)).await.unwrap();

        // price 104: increment 5, so min(150 + 5, 200) = 155
        let counter = engine
            .next_counter(auction_id, dec!(104), None, &telemetry(dec!(104)))
            .unwrap();
        assert_eq!(counter.bidder_id, strong);
        assert_eq!(counter.amount, dec!(155));
    }

    #[tokio::test]
    async fn counter_is_capped_by_own_max() {
        let (engine, auction_id) = engine().await;
        let close_pair_low = Uuid::new_v4();
        let close_pair_high = Uuid::new_v4();
        engine.set(auction_id, close_pair_low, dec!(197)).await.unwrap();
        engine.set(auction_id, close_pair_high, dec!(200)).await.unwrap();

        // second.max + increment overshoots; the counter clamps to top.max
        let counter = engine
            .next_counter(auction_id, dec!(110), None, &telemetry(dec!(110)))
            .unwrap();
        assert_eq!(counter.bidder_id, close_pair_high);
        assert_eq!(counter.amount, dec!(200));
    }

    #[tokio::test]
    async fn exhausted_instructions_stay_silent() {
        let (engine, auction_id) = engine().await;
        let bidder = Uuid::new_v4();
        engine.set(auction_id, bidder, dec!(120)).await.unwrap();

        assert!(engine
            .next_counter(auction_id, dec!(120), None, &telemetry(dec!(120)))
            .is_none());
        // nearly exhausted: the minimum step would overshoot the max
        assert!(engine
            .next_counter(auction_id, dec!(118), None, &telemetry(dec!(118)))
            .is_none());
    }

    #[tokio::test]
    async fn triggering_bidder_is_excluded() {
        let (engine, auction_id) = engine().await;
        let bidder = Uuid::new_v4();
        engine.set(auction_id, bidder, dec!(500)).await.unwrap();

        assert!(engine
            .next_counter(auction_id, dec!(110), Some(bidder), &telemetry(dec!(110)))
            .is_none());
    }

    #[tokio::test]
    async fn max_tie_goes_to_the_earlier_instruction() {
        let (engine, auction_id) = engine().await;
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        engine.set(auction_id, early, dec!(300)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        engine.set(auction_id, late, dec!(300)).await.unwrap();

        let counter = engine
            .next_counter(auction_id, dec!(100), None, &telemetry(dec!(100)))
            .unwrap();
        assert_eq!(counter.bidder_id, early);
    }

    #[tokio::test]
    async fn raise_keeps_original_creation_time() {
        let (engine, auction_id) = engine().await;
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        engine.set(auction_id, early, dec!(250)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        engine.set(auction_id, late, dec!(300)).await.unwrap();
        engine.set(auction_id, early, dec!(300)).await.unwrap();

        // both now cap at 300; the earlier instruction still wins the tie
        let counter = engine
            .next_counter(auction_id, dec!(100), None, &telemetry(dec!(100)))
            .unwrap();
        assert_eq!(counter.bidder_id, early);
    }

    #[tokio::test]
    async fn cancel_and_close_deactivate() {
        let (engine, auction_id) = engine().await;
        let bidder = Uuid::new_v4();
        engine.set(auction_id, bidder, dec!(200)).await.unwrap();

        assert!(engine.cancel(auction_id, bidder).await.unwrap());
        assert!(!engine.cancel(auction_id, bidder).await.unwrap());
        assert!(engine
            .next_counter(auction_id, dec!(100), None, &telemetry(dec!(100)))
            .is_none());

        engine.set(auction_id, bidder, dec!(200)).await.unwrap();
        engine.deactivate_all(auction_id).await.unwrap();
        assert!(engine
            .next_counter(auction_id, dec!(100), None, &telemetry(dec!(100)))
            .is_none());
    }
}
