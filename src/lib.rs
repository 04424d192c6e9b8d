//! Staffa is a line-protocol broker for a single simulated trading pair
//! (SRD-BTC quoted in USD). Authenticated clients hold a two-currency wallet,
//! submit BUY/SELL orders that are serialised through one execution queue, and
//! can run an embedded Bollinger-band trader against the live price feed.

pub mod bot;
pub mod broker;
pub mod config;
pub mod exec;
pub mod feed;
pub mod session;
pub mod wallet;
