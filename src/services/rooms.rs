//! Broadcast Rooms
//!
//! Per-auction subscriber sets. Events are produced by one auction worker
//! at a time, so delivery order to each subscriber matches commit order.
//! Delivery is best-effort: a subscriber whose queue is full is evicted
//! rather than ever blocking the engine.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::gateway::connections::{ConnectionHandle, ConnectionId};
use crate::gateway::protocol::ServerEvent;

#[derive(Default)]
struct Room {
    members: HashMap<ConnectionId, ConnectionHandle>,
}

/// Subscriber sets for every auction with at least one watcher
#[derive(Default)]
pub struct AuctionRooms {
    rooms: Mutex<HashMap<Uuid, Room>>,
}

impl AuctionRooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber and announce it to the existing members
    pub fn join(&self, auction_id: Uuid, handle: ConnectionHandle) {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(auction_id).or_default();
        if room.members.contains_key(&handle.id) {
            return;
        }
        let announce = ServerEvent::PeerJoined {
            auction_id,
            user_id: handle.user_id,
            username: handle.username.clone(),
        };
        room.members.retain(|_, member| member.send(announce.clone()));
        room.members.insert(handle.id, handle);
    }

    /// Remove a subscriber and announce the departure
    pub fn leave(&self, auction_id: Uuid, connection_id: ConnectionId) {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&auction_id) else {
            return;
        };
        let Some(gone) = room.members.remove(&connection_id) else {
            return;
        };
        let announce = ServerEvent::PeerLeft {
            auction_id,
            user_id: gone.user_id,
            username: gone.username,
        };
        room.members.retain(|_, member| member.send(announce.clone()));
        if room.members.is_empty() {
            rooms.remove(&auction_id);
        }
    }

    /// Drop a disconnected subscriber from every room it had joined
    pub fn leave_all(&self, connection_id: ConnectionId) {
        let auction_ids: Vec<Uuid> = {
            let rooms = self.rooms.lock();
            rooms
                .iter()
                .filter(|(_, room)| room.members.contains_key(&connection_id))
                .map(|(id, _)| *id)
                .collect()
        };
        for auction_id in auction_ids {
            self.leave(auction_id, connection_id);
        }
    }

    /// Fan an event out to every subscriber of an auction, evicting any
    /// whose outbound queue is full
    pub fn publish(&self, auction_id: Uuid, event: &ServerEvent) {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(&auction_id) else {
            return;
        };
        let before = room.members.len();
        room.members.retain(|_, member| member.send(event.clone()));
        let evicted = before - room.members.len();
        if evicted > 0 {
            debug!(%auction_id, evicted, "evicted slow subscribers");
        }
    }

    pub fn member_count(&self, auction_id: Uuid) -> usize {
        self.rooms
            .lock()
            .get(&auction_id)
            .map(|room| room.members.len())
            .unwrap_or(0)
    }
}
