pub mod pnl;
pub mod price;

pub use pnl::PnL;
pub use price::Price;
