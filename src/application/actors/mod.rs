pub mod scheduler;
pub mod user_loop;

pub use scheduler::{SchedulerStats, TradingScheduler};
pub use user_loop::{
    CycleOutcome, LoopContext, LoopExit, LoopHandle, LoopState, LoopStats, StopReason, UserLoop,
};
