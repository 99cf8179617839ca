//! Fake probing capabilities shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use portsnap::error::ProbeFailure;
use portsnap::probe::{
    HostPorts, ProbeMode, ProbeReport, Prober, ProberFactory, RawPort, SimplifiedReport, StructuredReport,
};
use portsnap::ScanTarget;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What one tier answers for an address
#[derive(Debug, Clone)]
pub enum Answer {
    Ports(Vec<RawPort>),
    Fail(ProbeFailure),
    /// Report arrives but marks the host as timed out
    TimedOut,
}

impl Answer {
    pub fn ssh() -> Self {
        Answer::Ports(vec![RawPort::new("tcp", "22", "open", Some("ssh"))])
    }

    pub fn timeout() -> Self {
        Answer::Fail(ProbeFailure::Timeout(Duration::from_secs(30)))
    }
}

/// Per-address script plus shared instrumentation
#[derive(Debug, Default)]
pub struct Script {
    pub primary: HashMap<String, Answer>,
    pub fallback: HashMap<String, Answer>,
    pub delay: Duration,
    pub primary_calls: AtomicUsize,
    pub fallback_calls: AtomicUsize,
    pub handles_built: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn primary(mut self, address: &str, answer: Answer) -> Self {
        self.primary.insert(address.to_string(), answer);
        self
    }

    pub fn fallback(mut self, address: &str, answer: Answer) -> Self {
        self.fallback.insert(address.to_string(), answer);
        self
    }

    /// Factory building a fresh handle per worker over this script
    pub fn factory(self: &Arc<Self>) -> ProberFactory {
        let script = self.clone();
        Arc::new(move || {
            script.handles_built.fetch_add(1, Ordering::SeqCst);
            Box::new(ScriptedProber {
                script: script.clone(),
            }) as Box<dyn Prober>
        })
    }

    async fn answer(&self, table: &HashMap<String, Answer>, address: &str, structured: bool) -> Result<ProbeReport, ProbeFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Unscripted addresses answer with no open ports
        let answer = table.get(address).cloned().unwrap_or(Answer::Ports(Vec::new()));
        match answer {
            Answer::Fail(cause) => Err(cause),
            Answer::Ports(_) | Answer::TimedOut => {
                let timed_out = matches!(answer, Answer::TimedOut);
                let ports = match answer {
                    Answer::Ports(ports) => ports,
                    _ => Vec::new(),
                };
                let hosts = vec![HostPorts {
                    addresses: vec![address.to_string()],
                    ports,
                    timed_out,
                }];
                Ok(if structured {
                    ProbeReport::Structured(StructuredReport { hosts })
                } else {
                    ProbeReport::Simplified(SimplifiedReport { hosts })
                })
            }
        }
    }
}

pub struct ScriptedProber {
    script: Arc<Script>,
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn scan(&mut self, address: &str, _mode: &ProbeMode) -> Result<ProbeReport, ProbeFailure> {
        self.script.primary_calls.fetch_add(1, Ordering::SeqCst);
        self.script.answer(&self.script.primary, address, true).await
    }

    async fn scan_top(&mut self, address: &str, _n: u16) -> Result<ProbeReport, ProbeFailure> {
        self.script.fallback_calls.fetch_add(1, Ordering::SeqCst);
        self.script.answer(&self.script.fallback, address, false).await
    }
}

pub fn targets(n: usize) -> Vec<ScanTarget> {
    (0..n)
        .map(|i| ScanTarget::new(format!("identity-{:02}", i), format!("10.0.0.{}", i + 1)))
        .collect()
}
