pub mod barrier_sync;
pub mod monitor;
