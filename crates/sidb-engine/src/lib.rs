//! In-process deduplication store engine host
//!
//! The [`Engine`] owns the catalog, the deduplication index and the
//! storage engines, and exposes the job-submitter callbacks and metadata
//! queries. The [`Scheduler`] drives pruning, verification, data aging and
//! persistence for the `sidbd` daemon.

pub mod config;
pub mod engine;
pub mod metrics;
pub mod persistence;
pub mod scheduler;
pub mod tasks;

pub use config::EngineConfig;
pub use engine::{
    ChunkPath, Engine, MountPathUsage, StoreStatus, SubstoreSummary, WriteOutcome,
};
pub use metrics::{Metrics, MetricsConfig};
pub use persistence::{PersistenceConfig, PersistenceManager, StateData};
pub use scheduler::Scheduler;
pub use tasks::{TaskRegistry, TaskSnapshot, WorkerType};
