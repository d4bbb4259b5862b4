// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod cadence;
pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod rate_limiter;
pub mod reconcile;
pub mod retry;

// Ingestion, upstream access and storage seams
pub mod ingest;
pub mod repository;
pub mod upstream;

// Run coordination
pub mod orchestrator;
pub mod scheduler;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::error::{ErrorKind, SyncError, SyncResult};
pub use crate::lock::ResourceClass;
pub use crate::orchestrator::{RunOptions, RunStatus, SyncContext, SyncOrchestrator, SyncRunSummary};
pub use crate::scheduler::SyncScheduler;
