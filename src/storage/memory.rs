//! In-memory Store
//!
//! Backend for tests and local experiments. Mirrors the transactional
//! behaviour of the Postgres backend under a single mutex, and can be
//! primed to fail so storage-error paths are testable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Auction, AuctionStatus, Bid, BidView, ProxyBid, Role, User};

use super::{StorageError, StorageResult, Store};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    auctions: HashMap<Uuid, Auction>,
    bids: HashMap<Uuid, Vec<Bid>>,
    proxies: HashMap<Uuid, Vec<ProxyBid>>,
    history_rows: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user, returning its id
    pub fn add_user(&self, username: &str, role: Role) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().users.insert(
            id,
            User {
                id,
                username: username.to_string(),
                email: format!("{username}@example.com"),
                role,
                active: true,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn deactivate_user(&self, id: Uuid) {
        if let Some(user) = self.inner.lock().users.get_mut(&id) {
            user.active = false;
        }
    }

    /// Make every subsequent bid commit fail, to exercise error paths
    pub fn fail_next_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Committed bids for an auction in sequence order
    pub fn bids(&self, auction_id: Uuid) -> Vec<Bid> {
        self.inner.lock().bids.get(&auction_id).cloned().unwrap_or_default()
    }

    /// Rows written to the audit history
    pub fn history_len(&self) -> usize {
        self.inner.lock().history_rows
    }

    fn view(inner: &Inner, bid: &Bid) -> BidView {
        let username = inner
            .users
            .get(&bid.bidder_id)
            .map(|u| u.username.clone())
            .unwrap_or_default();
        BidView {
            id: bid.id,
            auction_id: bid.auction_id,
            bidder_id: bid.bidder_id,
            bidder_username: username,
            amount: bid.amount,
            kind: bid.kind,
            winning: bid.winning,
            sequence: bid.sequence,
            created_at: bid.created_at,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user(&self, id: Uuid) -> StorageResult<User> {
        self.inner
            .lock()
            .users
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound("user"))
    }

    async fn usernames(&self, ids: &[Uuid]) -> StorageResult<HashMap<Uuid, String>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.users.get(id).map(|u| (*id, u.username.clone())))
            .collect())
    }

    async fn auction(&self, id: Uuid) -> StorageResult<Auction> {
        self.inner
            .lock()
            .auctions
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound("auction"))
    }

    async fn insert_auction(&self, auction: &Auction) -> StorageResult<()> {
        self.inner.lock().auctions.insert(auction.id, auction.clone());
        Ok(())
    }

    async fn open_auctions(&self) -> StorageResult<Vec<Auction>> {
        let inner = self.inner.lock();
        let mut open: Vec<Auction> = inner
            .auctions
            .values()
            .filter(|a| !a.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|a| a.end_time);
        Ok(open)
    }

    async fn due_to_start(&self, now: DateTime<Utc>) -> StorageResult<Vec<Auction>> {
        let inner = self.inner.lock();
        let mut due: Vec<Auction> = inner
            .auctions
            .values()
            .filter(|a| a.status == AuctionStatus::Upcoming && a.start_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|a| a.start_time);
        Ok(due)
    }

    async fn due_to_close(&self, now: DateTime<Utc>) -> StorageResult<Vec<Uuid>> {
        let inner = self.inner.lock();
        Ok(inner
            .auctions
            .values()
            .filter(|a| a.status == AuctionStatus::Live && a.end_time <= now)
            .map(|a| a.id)
            .collect())
    }

    async fn mark_live(&self, id: Uuid) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let auction = inner
            .auctions
            .get_mut(&id)
            .ok_or(StorageError::NotFound("auction"))?;
        if auction.status != AuctionStatus::Upcoming {
            return Err(StorageError::NotFound("upcoming auction"));
        }
        auction.status = AuctionStatus::Live;
        Ok(())
    }

    async fn finalize_auction(
        &self,
        id: Uuid,
        status: AuctionStatus,
        winner_id: Option<Uuid>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let auction = inner
            .auctions
            .get_mut(&id)
            .ok_or(StorageError::NotFound("auction"))?;
        auction.status = status;
        auction.winner_id = winner_id;
        Ok(())
    }

    async fn commit_bid(&self, bid: &Bid, new_price: Decimal) -> StorageResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StorageError::Timeout);
        }
        let mut inner = self.inner.lock();
        {
            let auction = inner
                .auctions
                .get_mut(&bid.auction_id)
                .ok_or(StorageError::NotFound("auction"))?;
            auction.current_price = new_price;
            auction.total_bids += 1;
        }
        let bids = inner.bids.entry(bid.auction_id).or_default();
        for prior in bids.iter_mut() {
            prior.winning = false;
        }
        bids.push(Bid { winning: true, ..bid.clone() });
        inner.history_rows += 1;
        Ok(())
    }

    async fn recent_bids(&self, auction_id: Uuid, limit: i64) -> StorageResult<Vec<BidView>> {
        let inner = self.inner.lock();
        let bids = inner.bids.get(&auction_id).cloned().unwrap_or_default();
        let skip = bids.len().saturating_sub(limit as usize);
        Ok(bids[skip..].iter().map(|b| Self::view(&inner, b)).collect())
    }

    async fn winning_bid(&self, auction_id: Uuid) -> StorageResult<Option<BidView>> {
        let inner = self.inner.lock();
        Ok(inner
            .bids
            .get(&auction_id)
            .and_then(|bids| bids.iter().find(|b| b.winning))
            .map(|b| Self::view(&inner, b)))
    }

    async fn active_proxies(&self, auction_id: Uuid) -> StorageResult<Vec<ProxyBid>> {
        let inner = self.inner.lock();
        let mut active: Vec<ProxyBid> = inner
            .proxies
            .get(&auction_id)
            .map(|list| list.iter().filter(|p| p.active).cloned().collect())
            .unwrap_or_default();
        active.sort_by_key(|p| p.created_at);
        Ok(active)
    }

    async fn upsert_proxy(&self, proxy: &ProxyBid) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let list = inner.proxies.entry(proxy.auction_id).or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.bidder_id == proxy.bidder_id) {
            existing.max_amount = proxy.max_amount;
            existing.active = proxy.active;
        } else {
            list.push(proxy.clone());
        }
        Ok(())
    }

    async fn deactivate_proxy(&self, auction_id: Uuid, bidder_id: Uuid) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.proxies.get_mut(&auction_id) {
            for proxy in list.iter_mut().filter(|p| p.bidder_id == bidder_id) {
                proxy.active = false;
            }
        }
        Ok(())
    }

    async fn deactivate_proxies(&self, auction_id: Uuid) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.proxies.get_mut(&auction_id) {
            for proxy in list.iter_mut() {
                proxy.active = false;
            }
        }
        Ok(())
    }

    async fn record_proxy_progress(
        &self,
        auction_id: Uuid,
        bidder_id: Uuid,
        amount: Decimal,
    ) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(list) = inner.proxies.get_mut(&auction_id) {
            if let Some(proxy) = list.iter_mut().find(|p| p.bidder_id == bidder_id && p.active) {
                proxy.current_amount = amount;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BidKind;
    use rust_decimal_macros::dec;

    fn sample_auction(seller_id: Uuid) -> Auction {
        let now = Utc::now();
        Auction {
            id: Uuid::new_v4(),
            seller_id,
            category_id: None,
            title: "Sample".to_string(),
            description: None,
            image_url: None,
            starting_price: dec!(100),
            current_price: dec!(100),
            reserve_price: None,
            start_time: now,
            end_time: now + chrono::Duration::hours(2),
            status: AuctionStatus::Live,
            total_bids: 0,
            winner_id: None,
            created_at: now,
        }
    }

    #[tokio::test]
    async fn commit_moves_winning_flag() {
        let store = MemoryStore::new();
        let seller = store.add_user("seller", Role::Seller);
        let bidder_a = store.add_user("alice", Role::Bidder);
        let bidder_b = store.add_user("bob", Role::Bidder);
        let auction = sample_auction(seller);
        store.insert_auction(&auction).await.unwrap();

        for (i, (bidder, amount)) in [(bidder_a, dec!(110)), (bidder_b, dec!(120))]
            .into_iter()
            .enumerate()
        {
            let bid = Bid {
                id: Uuid::new_v4(),
                auction_id: auction.id,
                bidder_id: bidder,
                amount,
                kind: BidKind::Manual,
                winning: true,
                sequence: i as i32 + 1,
                created_at: Utc::now(),
            };
            store.commit_bid(&bid, amount).await.unwrap();
        }

        let winners: Vec<Bid> = store
            .bids(auction.id)
            .into_iter()
            .filter(|b| b.winning)
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].amount, dec!(120));
        assert_eq!(store.auction(auction.id).await.unwrap().total_bids, 2);
        assert_eq!(store.history_len(), 2);
    }

    #[tokio::test]
    async fn upsert_keeps_one_proxy_per_bidder() {
        let store = MemoryStore::new();
        let auction_id = Uuid::new_v4();
        let bidder = Uuid::new_v4();
        let first = ProxyBid::new(auction_id, bidder, dec!(200), Utc::now());
        store.upsert_proxy(&first).await.unwrap();
        let second = ProxyBid::new(auction_id, bidder, dec!(300), Utc::now());
        store.upsert_proxy(&second).await.unwrap();

        let active = store.active_proxies(auction_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].max_amount, dec!(300));
        // the original instruction is updated in place, keeping its creation time
        assert_eq!(active[0].id, first.id);
    }
}
