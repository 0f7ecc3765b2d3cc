pub mod monitor;
pub mod pool;
pub mod process;
pub mod queue;
