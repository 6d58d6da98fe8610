pub mod retry;
pub mod strategy;
