//! Probing capability and the adapter that turns its reports into observations
//!
//! The capability itself ([`Prober`]) is a black box: one call runs one scan of
//! one address and returns either a structured or a simplified report. Handles
//! are not assumed to be safe for concurrent reuse, so every method takes
//! `&mut self` and each pool worker builds its own through a [`ProberFactory`].

pub mod adapter;
pub mod nmap;
pub mod report;

use crate::error::ProbeFailure;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use adapter::{ProbeAdapter, ProbeOptions, StrategyOutcome};
pub use nmap::NmapProber;
pub use report::{HostPorts, ProbeReport, RawPort, SimplifiedReport, StructuredReport};

/// Settings for a structured scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMode {
    /// Capability-specific arguments (nmap flags for [`NmapProber`])
    pub args: Vec<String>,
    /// Per-host time budget handed to the capability
    pub host_timeout: Duration,
}

impl ProbeMode {
    pub fn new(args: Vec<String>, host_timeout: Duration) -> Self {
        Self { args, host_timeout }
    }
}

impl Default for ProbeMode {
    fn default() -> Self {
        Self {
            args: vec!["-Pn".to_string(), "-F".to_string()],
            host_timeout: Duration::from_secs(30),
        }
    }
}

/// The underlying port-probing capability
#[async_trait]
pub trait Prober: Send {
    /// Full scan producing a structured report
    async fn scan(&mut self, address: &str, mode: &ProbeMode) -> Result<ProbeReport, ProbeFailure>;

    /// Reduced scan of the `n` most common ports producing a simplified report
    async fn scan_top(&mut self, address: &str, n: u16) -> Result<ProbeReport, ProbeFailure>;
}

/// Builds one private [`Prober`] per worker
pub type ProberFactory = Arc<dyn Fn() -> Box<dyn Prober> + Send + Sync>;
