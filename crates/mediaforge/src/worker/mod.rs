pub mod pool;

pub use pool::{PoolSettings, WorkerPool};
