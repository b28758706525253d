//! Pricing Policy
//!
//! Pure functions computing the dynamic bid increment, its proxy
//! derivative, the suggested next bid, and a rough final-price projection
//! from auction telemetry. Deterministic given their inputs; callers stamp
//! `now` with the commit clock.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use uuid::Uuid;

/// Increment bounds in price units
const MIN_INCREMENT: Decimal = dec!(1.00);
const MAX_INCREMENT: Decimal = dec!(500.00);
const BASE_INCREMENT: Decimal = dec!(5.00);

/// Window over which bid velocity is measured
pub const VELOCITY_WINDOW_MINUTES: i64 = 10;
/// Bids considered when counting distinct competitors
pub const COMPETITION_DEPTH: usize = 20;
/// Bids considered when projecting the final price
const PROJECTION_DEPTH: usize = 10;

/// One committed bid, as seen by the policy
#[derive(Debug, Clone)]
pub struct RecentBid {
    pub bidder_id: Uuid,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Inputs to the pricing policy, snapshotted at the commit clock
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub starting_price: Decimal,
    pub current_price: Decimal,
    pub total_bids: i32,
    pub now: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Most recent bids, oldest first. Must span the full
    /// [`VELOCITY_WINDOW_MINUTES`] window as well as the last
    /// [`COMPETITION_DEPTH`] bids, or the velocity factor undercounts.
    pub recent: Vec<RecentBid>,
}

/// Minimum step a manual bid must clear above the current price
pub fn bid_increment(t: &Telemetry) -> Decimal {
    let raw = BASE_INCREMENT
        * price_jump_factor(t)
        * velocity_factor(t)
        * time_pressure_factor(t)
        * competition_factor(t);
    let clamped = raw.clamp(MIN_INCREMENT, MAX_INCREMENT);
    round_to_step(clamped, t.current_price)
}

/// Conservative derivative of the standard increment used for automatic
/// counter-bids: 0.7x with a floor of one price unit
pub fn proxy_increment(t: &Telemetry) -> Decimal {
    let scaled = (dec!(0.7) * bid_increment(t)).max(MIN_INCREMENT);
    round_to_step(scaled, t.current_price)
}

/// What a client should offer to stay ahead
pub fn suggested_next_bid(t: &Telemetry) -> Decimal {
    t.current_price + bid_increment(t)
}

/// Projection of the closing price from recent bid cadence. With fewer than
/// three bids there is no cadence to project, so a flat 1.2x is returned.
pub fn predicted_final_price(t: &Telemetry) -> Decimal {
    if t.recent.len() < 3 {
        return (t.current_price * dec!(1.2)).round_dp(2);
    }

    let skip = t.recent.len().saturating_sub(PROJECTION_DEPTH);
    let window = &t.recent[skip..];
    let first = &window[0];
    let last = &window[window.len() - 1];
    let steps = Decimal::from(window.len() as i64 - 1);

    let span_seconds = (last.created_at - first.created_at).num_seconds();
    let avg_gap_seconds = span_seconds / (window.len() as i64 - 1);
    if avg_gap_seconds <= 0 {
        return t.current_price;
    }
    let avg_step = (last.amount - first.amount) / steps;

    let remaining_seconds = (t.ends_at - t.now).num_seconds().max(0);
    let projected_bids = Decimal::from(remaining_seconds / avg_gap_seconds);

    (t.current_price + avg_step * projected_bids * dec!(0.8)).round_dp(2)
}

/// Factor on how far the price has climbed above its start
fn price_jump_factor(t: &Telemetry) -> Decimal {
    if t.starting_price <= Decimal::ZERO {
        return dec!(1.0);
    }
    let ratio = t.current_price / t.starting_price;
    if ratio <= dec!(1.5) {
        dec!(1.0)
    } else if ratio <= dec!(2.0) {
        dec!(1.5)
    } else if ratio <= dec!(3.0) {
        dec!(2.0)
    } else if ratio <= dec!(5.0) {
        dec!(3.0)
    } else {
        dec!(4.0)
    }
}

/// Factor on bids per minute over the trailing window
fn velocity_factor(t: &Telemetry) -> Decimal {
    let cutoff = t.now - Duration::minutes(VELOCITY_WINDOW_MINUTES);
    let in_window = t.recent.iter().filter(|b| b.created_at >= cutoff).count();
    let per_minute = Decimal::from(in_window as i64) / Decimal::from(VELOCITY_WINDOW_MINUTES);
    if per_minute < dec!(0.5) {
        dec!(1.0)
    } else if per_minute < dec!(1.0) {
        dec!(1.2)
    } else if per_minute < dec!(2.0) {
        dec!(1.5)
    } else if per_minute < dec!(5.0) {
        dec!(2.0)
    } else {
        dec!(3.0)
    }
}

/// Factor on how close the hammer is
fn time_pressure_factor(t: &Telemetry) -> Decimal {
    let minutes_left = (t.ends_at - t.now).num_minutes();
    if minutes_left > 60 {
        dec!(1.0)
    } else if minutes_left > 30 {
        dec!(1.1)
    } else if minutes_left > 15 {
        dec!(1.3)
    } else if minutes_left > 5 {
        dec!(1.5)
    } else if minutes_left > 1 {
        dec!(2.0)
    } else {
        dec!(3.0)
    }
}

/// Factor on distinct bidders among the recent bids
fn competition_factor(t: &Telemetry) -> Decimal {
    let mut bidders: Vec<Uuid> = t
        .recent
        .iter()
        .rev()
        .take(COMPETITION_DEPTH)
        .map(|b| b.bidder_id)
        .collect();
    bidders.sort_unstable();
    bidders.dedup();
    let distinct = bidders.len();
    if distinct <= 2 {
        dec!(1.0)
    } else if distinct <= 4 {
        dec!(1.2)
    } else if distinct <= 6 {
        dec!(1.4)
    } else if distinct <= 10 {
        dec!(1.6)
    } else {
        dec!(2.0)
    }
}

/// Snap a value to the display step for the price band; never returns less
/// than one step
fn round_to_step(value: Decimal, current_price: Decimal) -> Decimal {
    let step = if current_price <= dec!(100) {
        dec!(1)
    } else if current_price <= dec!(500) {
        dec!(5)
    } else if current_price <= dec!(1000) {
        dec!(10)
    } else if current_price <= dec!(5000) {
        dec!(25)
    } else {
        dec!(50)
    };
    let rounded = (value / step)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * step;
    rounded.max(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(starting: Decimal, current: Decimal, minutes_left: i64) -> Telemetry {
        let now = Utc::now();
        Telemetry {
            starting_price: starting,
            current_price: current,
            total_bids: 0,
            now,
            ends_at: now + Duration::minutes(minutes_left),
            recent: Vec::new(),
        }
    }

    fn push_bids(t: &mut Telemetry, bids: &[(Uuid, Decimal, i64)]) {
        for (bidder, amount, seconds_ago) in bids {
            t.recent.push(RecentBid {
                bidder_id: *bidder,
                amount: *amount,
                created_at: t.now - Duration::seconds(*seconds_ago),
            });
        }
        t.recent.sort_by_key(|b| b.created_at);
        t.total_bids = t.recent.len() as i32;
    }

    #[test]
    fn quiet_auction_uses_base_increment() {
        let t = telemetry(dec!(100), dec!(100), 120);
        assert_eq!(bid_increment(&t), dec!(5));
        assert_eq!(suggested_next_bid(&t), dec!(105));
    }

    #[test]
    fn proxy_increment_rounds_within_band() {
        // 0.7 * 5.00 = 3.50, snapped to the 1-unit step at a price of 100
        let t = telemetry(dec!(100), dec!(100), 120);
        assert_eq!(proxy_increment(&t), dec!(4));

        // above 100 the step is 5, so the same raw value snaps to 5
        let t = telemetry(dec!(100), dec!(104), 120);
        assert_eq!(proxy_increment(&t), dec!(5));
    }

    #[test]
    fn price_jump_scales_increment() {
        // ratio 1.8 -> 1.5x; 7.50 snaps to 10 on the 5-unit step
        let t = telemetry(dec!(100), dec!(180), 120);
        assert_eq!(bid_increment(&t), dec!(10));
    }

    #[test]
    fn deep_jump_hits_top_factor() {
        // ratio 6 -> 4.0x; 20.00 sits exactly on the 10-unit step
        let t = telemetry(dec!(100), dec!(600), 120);
        assert_eq!(bid_increment(&t), dec!(20));
    }

    #[test]
    fn velocity_raises_increment() {
        let mut t = telemetry(dec!(100), dec!(100), 120);
        let b1 = Uuid::new_v4();
        let b2 = Uuid::new_v4();
        // 12 bids inside the window from two bidders: 1.2/min -> 1.5x
        let bids: Vec<(Uuid, Decimal, i64)> = (0..12)
            .map(|i| {
                let who = if i % 2 == 0 { b1 } else { b2 };
                (who, dec!(100) + Decimal::from(i), (i as i64) * 45)
            })
            .collect();
        push_bids(&mut t, &bids);
        assert_eq!(bid_increment(&t), dec!(8)); // 7.50 snaps to 8 at step 1
    }

    #[test]
    fn time_pressure_raises_increment() {
        let t = telemetry(dec!(100), dec!(100), 3);
        // under five minutes -> 2.0x
        assert_eq!(bid_increment(&t), dec!(10));

        let t = telemetry(dec!(100), dec!(100), 0);
        // final minute -> 3.0x
        assert_eq!(bid_increment(&t), dec!(15));
    }

    #[test]
    fn competition_raises_increment() {
        let mut t = telemetry(dec!(100), dec!(100), 120);
        let bidders: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        // five distinct bidders, all outside the velocity window
        let bids: Vec<(Uuid, Decimal, i64)> = bidders
            .iter()
            .enumerate()
            .map(|(i, b)| (*b, dec!(100) + Decimal::from(i as i64), 3600 + i as i64))
            .collect();
        push_bids(&mut t, &bids);
        assert_eq!(bid_increment(&t), dec!(7)); // 5 * 1.4
    }

    #[test]
    fn extreme_auction_stays_within_bounds() {
        // enormous jump, frantic pace, final minute, crowded field: every
        // factor at its ceiling (5 * 4 * 3 * 3 * 2 = 360, step 50 -> 350)
        let mut t = telemetry(dec!(10), dec!(9000), 0);
        let bidders: Vec<Uuid> = (0..12).map(|_| Uuid::new_v4()).collect();
        let bids: Vec<(Uuid, Decimal, i64)> = (0..60)
            .map(|i| {
                (
                    bidders[i % bidders.len()],
                    dec!(8000) + Decimal::from(i as i64),
                    (i as i64) * 5,
                )
            })
            .collect();
        push_bids(&mut t, &bids);
        let increment = bid_increment(&t);
        assert_eq!(increment, dec!(350));
        assert!(increment <= dec!(500.00));
    }

    #[test]
    fn predicted_price_flat_when_sparse() {
        let t = telemetry(dec!(100), dec!(150), 60);
        assert_eq!(predicted_final_price(&t), dec!(180.00));
    }

    #[test]
    fn predicted_price_projects_cadence() {
        let mut t = telemetry(dec!(100), dec!(150), 10);
        let b1 = Uuid::new_v4();
        let b2 = Uuid::new_v4();
        // five bids, one per minute, climbing 10 per bid
        let bids: Vec<(Uuid, Decimal, i64)> = (0..5)
            .map(|i| {
                let who = if i % 2 == 0 { b1 } else { b2 };
                (who, dec!(110) + Decimal::from(i * 10), (4 - i as i64) * 60)
            })
            .collect();
        push_bids(&mut t, &bids);
        // avg gap 60 s, avg step 10, ten minutes left -> ten more bids
        // 150 + 10 * 10 * 0.8 = 230
        assert_eq!(predicted_final_price(&t), dec!(230.00));
    }
}
