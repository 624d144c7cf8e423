//! Derivative generation for stored files: video transcodes, thumbnails and
//! document previews, each driven by a durable per-kind job queue and a pool
//! of workers that shell out to external converters.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod job;
pub mod maintenance;
pub mod queue;
pub mod recovery;
pub mod sanitize;
pub mod service;
pub mod storage;
pub mod worker;

pub use broadcast::{JobProgressEvent, LiveProgress, ProgressBroadcaster};
pub use config::{load_config, resolve_config_path, Config};
pub use db::job_repo::{JobFilter, StallSweep};
pub use db::stats_repo::QueueStats;
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, DriverError, MediaforgeError, QueueError, Result, StorageError};
pub use job::{
    ConversionJob, JobHandle, JobKind, JobPayload, JobStatus, JobStatusView, TranscodeQuality,
};
pub use maintenance::MaintenanceScheduler;
pub use queue::{ConversionQueue, DerivativeOutcome};
pub use recovery::RecoveryOps;
pub use service::{ConversionService, WorkerSet};
pub use storage::StorageLayout;
pub use worker::{PoolSettings, WorkerPool};
