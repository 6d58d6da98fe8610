pub mod order;
pub mod trade;
pub mod user_config;
