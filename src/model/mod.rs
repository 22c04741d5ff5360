//! Core data model: orders, executions, HTLCs, price points, chain status
//!
//! Entities are flat rows keyed by ids; orders reference execution records
//! and HTLCs by id only, never as object graphs. All money fields use
//! fixed-point [`ethers::types::U256`] (see [`money`]).

pub mod chain;
pub mod htlc;
pub mod money;
pub mod order;
pub mod price;

pub use chain::{ChainHealth, ChainStatusRecord};
pub use htlc::{hash_secret, Htlc, HtlcStatus};
pub use money::{parse_fixed, slippage_bps, weighted_price, PRICE_DECIMALS, PRICE_SCALE};
pub use order::{ExecutionRecord, Order, OrderStatus};
pub use price::PricePoint;
