//! Core data types shared by the probe, pool, storage and coordinator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One host to scan: a stable identity key and its current address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanTarget {
    pub identity: String,
    pub address: String,
}

impl ScanTarget {
    pub fn new(identity: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            address: address.into(),
        }
    }

    /// Shortened identity for log lines
    pub fn short_identity(&self) -> &str {
        match self.identity.char_indices().nth(8) {
            Some((idx, _)) => &self.identity[..idx],
            None => &self.identity,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}...)", self.address, self.short_identity())
    }
}

/// Transport protocol of an observed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    Ip,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::Ip => "ip",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            "ip" => Ok(Protocol::Ip),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Which probing tier produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    Primary,
    Fallback,
}

impl ProbeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStrategy::Primary => "primary",
            ProbeStrategy::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open port seen during one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortObservation {
    pub protocol: Protocol,
    pub port: u16,
    pub service: String,
    pub label: ProbeStrategy,
}

impl PortObservation {
    pub fn new(protocol: Protocol, port: u16, service: impl Into<String>) -> Self {
        Self {
            protocol,
            port,
            service: service.into(),
            label: ProbeStrategy::Primary,
        }
    }

    pub fn with_label(mut self, label: ProbeStrategy) -> Self {
        self.label = label;
        self
    }
}

impl fmt::Display for PortObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} - {}", self.port, self.protocol, self.service)
    }
}

/// Result of handling one target in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub target: ScanTarget,
    pub ports: Vec<PortObservation>,
    pub succeeded: bool,
    pub error: Option<String>,
    pub duration: Duration,
    /// Rows written for this target
    pub saved: usize,
    /// Tier that produced `ports`, if any succeeded
    pub strategy: Option<ProbeStrategy>,
}

impl ScanOutcome {
    pub fn success(
        target: ScanTarget,
        ports: Vec<PortObservation>,
        strategy: ProbeStrategy,
        duration: Duration,
    ) -> Self {
        Self {
            target,
            ports,
            succeeded: true,
            error: None,
            duration,
            saved: 0,
            strategy: Some(strategy),
        }
    }

    pub fn failure(target: ScanTarget, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            target,
            ports: Vec::new(),
            succeeded: false,
            error: Some(error.into()),
            duration,
            saved: 0,
            strategy: None,
        }
    }

    pub fn with_saved(mut self, saved: usize) -> Self {
        self.saved = saved;
        self
    }

    /// Turn a successful probe into a failure, e.g. when its snapshot could not be saved
    pub fn mark_failed(mut self, error: impl Into<String>) -> Self {
        self.succeeded = false;
        self.error = Some(error.into());
        self.saved = 0;
        self
    }
}
