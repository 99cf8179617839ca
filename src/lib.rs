//! Portsnap - concurrent open-port snapshots for validator hosts
//!
//! Fetches the latest address of every known identity, probes each host with
//! nmap (falling back to a reduced top-ports scan), and records the open ports
//! as one snapshot per host per UTC day in a TimescaleDB table.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod output;
pub mod pool;
pub mod probe;
pub mod storage;
pub mod targets;

// Re-export commonly used types
pub use config::{DatabaseConfig, EngineConfig};
pub use coordinator::{RunCoordinator, RunPhase, RunSummary};
pub use error::{EngineError, EngineResult, PersistenceError, ProbeError, ProbeFailure};
pub use model::{PortObservation, ProbeStrategy, Protocol, ScanOutcome, ScanTarget};
pub use pool::{TargetJob, WorkerPool};
pub use probe::{NmapProber, ProbeAdapter, ProbeOptions, Prober, ProberFactory};
pub use storage::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore, SnapshotWriter};
pub use targets::{PgTargetSource, StaticTargetSource, TargetSource};
