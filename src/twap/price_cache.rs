//! In-memory price cache
//!
//! Per-pair shards hold points in ascending timestamp order and are
//! trimmed against `max_age` on every insert. Readers on other pairs are
//! never blocked; writers on the same pair serialise on the shard entry.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use ethers::types::{U256, U512};

use crate::error::{OrchestratorError, Result};
use crate::model::PricePoint;

/// Window consulted by `latest`; a "current" price older than this is no
/// current price at all.
const CURRENT_PRICE_WINDOW_SECS: u64 = 3600;

pub struct PriceCache {
    shards: DashMap<String, Vec<PricePoint>>,
    max_age: Duration,
}

impl PriceCache {
    pub fn new(max_age: std::time::Duration) -> Self {
        Self {
            shards: DashMap::new(),
            max_age: Duration::from_std(max_age).unwrap_or_else(|_| Duration::hours(24)),
        }
    }

    /// Insert a point, keeping the shard ordered and trimming entries
    /// older than `now - max_age`.
    pub fn record(&self, point: PricePoint) {
        let cutoff = Utc::now() - self.max_age;
        let mut shard = self.shards.entry(point.token_pair.clone()).or_default();

        // Points arrive roughly in order; walk back from the tail.
        let at = shard
            .iter()
            .rposition(|p| p.timestamp <= point.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        shard.insert(at, point);

        let stale = shard.iter().take_while(|p| p.timestamp < cutoff).count();
        if stale > 0 {
            shard.drain(0..stale);
        }
    }

    /// Points for `pair` with timestamp >= now - window, ascending
    pub fn points_since(&self, pair: &str, window: std::time::Duration) -> Vec<PricePoint> {
        let cutoff =
            Utc::now() - Duration::from_std(window).unwrap_or_else(|_| Duration::hours(24));
        self.shards
            .get(pair)
            .map(|shard| {
                shard
                    .iter()
                    .filter(|p| p.timestamp >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent point within the last hour
    pub fn latest(&self, pair: &str) -> Result<PricePoint> {
        self.points_since(pair, std::time::Duration::from_secs(CURRENT_PRICE_WINDOW_SECS))
            .last()
            .cloned()
            .ok_or_else(|| OrchestratorError::PriceUnavailable {
                pair: pair.to_string(),
            })
    }

    /// Time-weighted average price over the window; zero when no data.
    pub fn twap(&self, pair: &str, window_minutes: u32) -> U256 {
        let window = std::time::Duration::from_secs(window_minutes as u64 * 60);
        let points = self.points_since(pair, window);
        time_weighted_average(&points)
    }

    pub fn pair_count(&self) -> usize {
        self.shards.len()
    }

    pub fn point_count(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }
}

/// Weighted TWAP over points in ascending timestamp order.
///
/// The first point carries a sentinel weight of 1; every later point is
/// weighted by its gap in seconds to the previous point. Zero total
/// weight (impossible with the sentinel, but kept for symmetry) and an
/// empty window both yield zero; a single point yields its own price.
pub fn time_weighted_average(points: &[PricePoint]) -> U256 {
    if points.is_empty() {
        return U256::zero();
    }
    if points.len() == 1 {
        return points[0].price;
    }

    let mut total_value = U512::zero();
    let mut total_weight = U256::zero();

    for (i, point) in points.iter().enumerate() {
        let weight = if i == 0 {
            U256::one()
        } else {
            let gap = (point.timestamp - points[i - 1].timestamp)
                .num_seconds()
                .max(0);
            U256::from(gap as u64)
        };
        total_value += point.price.full_mul(weight);
        total_weight += weight;
    }

    if total_weight.is_zero() {
        return U256::zero();
    }
    let avg = total_value / U512::from(total_weight);
    let mut buf = [0u8; 64];
    avg.to_big_endian(&mut buf);
    U256::from_big_endian(&buf[32..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::money::PRICE_SCALE;

    fn px(n: u64) -> U256 {
        U256::from(n) * PRICE_SCALE
    }

    fn point(pair: &str, price: U256, age_secs: i64) -> PricePoint {
        PricePoint::new(pair, "test", price, Utc::now() - Duration::seconds(age_secs))
    }

    #[test]
    fn empty_window_yields_zero() {
        let cache = PriceCache::new(std::time::Duration::from_secs(86_400));
        assert_eq!(cache.twap("ETH_USDC", 20), U256::zero());
    }

    #[test]
    fn single_point_yields_its_price() {
        let cache = PriceCache::new(std::time::Duration::from_secs(86_400));
        cache.record(point("ETH_USDC", px(2000), 60));
        assert_eq!(cache.twap("ETH_USDC", 20), px(2000));
    }

    #[test]
    fn constant_price_yields_that_price() {
        let cache = PriceCache::new(std::time::Duration::from_secs(86_400));
        for age in [300, 240, 180, 120, 60] {
            cache.record(point("ETH_USDC", px(2000), age));
        }
        assert_eq!(cache.twap("ETH_USDC", 20), px(2000));
    }

    #[test]
    fn gaps_weight_later_points() {
        // p0 at t-100 (weight 1), p1 at t-90 (weight 10), p2 at t-0 (weight 90)
        let points = vec![
            point("ETH_USDC", px(1000), 100),
            point("ETH_USDC", px(2000), 90),
            point("ETH_USDC", px(3000), 0),
        ];
        let twap = time_weighted_average(&points);
        let expected = (px(1000) + px(2000) * 10u64 + px(3000) * 90u64) / U256::from(101u64);
        assert_eq!(twap, expected);
    }

    #[test]
    fn identical_timestamps_collapse_to_first_point() {
        let now = Utc::now();
        let points = vec![
            PricePoint::new("ETH_USDC", "a", px(1500), now),
            PricePoint::new("ETH_USDC", "b", px(9000), now),
        ];
        // weight 1 for the first point, 0s gap for the second
        assert_eq!(time_weighted_average(&points), px(1500));
    }

    #[test]
    fn record_trims_old_points_and_keeps_order() {
        let cache = PriceCache::new(std::time::Duration::from_secs(600));
        cache.record(point("ETH_USDC", px(1000), 3000));
        cache.record(point("ETH_USDC", px(2000), 120));
        // out-of-order arrival
        cache.record(point("ETH_USDC", px(1500), 240));

        let points = cache.points_since("ETH_USDC", std::time::Duration::from_secs(600));
        let prices: Vec<U256> = points.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![px(1500), px(2000)]);
    }

    #[test]
    fn latest_requires_recent_data() {
        let cache = PriceCache::new(std::time::Duration::from_secs(86_400));
        cache.record(point("ETH_USDC", px(2000), 7200));
        assert!(matches!(
            cache.latest("ETH_USDC"),
            Err(OrchestratorError::PriceUnavailable { .. })
        ));
        cache.record(point("ETH_USDC", px(2010), 30));
        assert_eq!(cache.latest("ETH_USDC").unwrap().price, px(2010));
    }

    #[test]
    fn pairs_are_isolated() {
        let cache = PriceCache::new(std::time::Duration::from_secs(86_400));
        cache.record(point("ETH_USDC", px(2000), 10));
        cache.record(point("ATOM_USDC", px(12), 10));
        assert_eq!(cache.pair_count(), 2);
        assert_eq!(cache.twap("ATOM_USDC", 20), px(12));
        assert_eq!(cache.twap("ETH_USDC", 20), px(2000));
    }
}
