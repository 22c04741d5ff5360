//! TWAP scheduling, pricing, and execution
//!
//! The engine runs four cooperating loops (price feed, scheduler,
//! executor, metrics) over a bounded execution queue; the cache and feed
//! supply the windowed prices the scheduler validates against.

pub mod engine;
pub mod feed;
pub mod price_cache;

pub use engine::{Engine, EngineMetrics, ExecutionRequest};
pub use feed::{PriceFeedAggregator, PriceSource};
pub use price_cache::{time_weighted_average, PriceCache};
