//! Tradeloop
//!
//! Per-user automated trading loops: each active, subscribed user gets an
//! async loop that watches one symbol, enters on a price threshold and exits
//! on take-profit, stop-loss or a forced exit, recording every trade in a
//! persistent ledger. A scheduler keeps the set of running loops in line with
//! the settings store.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod secrets;
