pub mod actors;

pub use actors::{LoopContext, TradingScheduler};
