//! Primary→fallback probing strategy

use super::{ProbeMode, Prober};
use crate::config::EngineConfig;
use crate::error::{ProbeError, ProbeFailure};
use crate::model::{PortObservation, ProbeStrategy};
use log::{debug, warn};

/// Strategy settings shared by every adapter in a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub primary: ProbeMode,
    pub fallback_top_ports: u16,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            primary: ProbeMode::default(),
            fallback_top_ports: 100,
        }
    }
}

impl ProbeOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            primary: ProbeMode::new(config.primary_args.clone(), config.host_timeout_duration()),
            fallback_top_ports: config.fallback_top_ports,
        }
    }
}

/// Tagged result of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    PrimaryOk(Vec<PortObservation>),
    FallbackOk {
        ports: Vec<PortObservation>,
        primary_cause: ProbeFailure,
    },
    BothFailed(ProbeError),
}

impl StrategyOutcome {
    /// Which tier produced the ports, if any did
    pub fn strategy(&self) -> Option<ProbeStrategy> {
        match self {
            StrategyOutcome::PrimaryOk(_) => Some(ProbeStrategy::Primary),
            StrategyOutcome::FallbackOk { .. } => Some(ProbeStrategy::Fallback),
            StrategyOutcome::BothFailed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Vec<PortObservation>, ProbeError> {
        match self {
            StrategyOutcome::PrimaryOk(ports) | StrategyOutcome::FallbackOk { ports, .. } => Ok(ports),
            StrategyOutcome::BothFailed(err) => Err(err),
        }
    }
}

/// Wraps one worker's private [`Prober`]
pub struct ProbeAdapter {
    prober: Box<dyn Prober>,
    options: ProbeOptions,
}

impl std::fmt::Debug for ProbeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeAdapter")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ProbeAdapter {
    pub fn new(prober: Box<dyn Prober>, options: ProbeOptions) -> Self {
        Self { prober, options }
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Open ports of `address`, trying the fallback once if the primary fails
    pub async fn probe(&mut self, address: &str) -> Result<Vec<PortObservation>, ProbeError> {
        self.run_strategy(address).await.into_result()
    }

    /// Run the two-tier strategy and report which tier answered
    pub async fn run_strategy(&mut self, address: &str) -> StrategyOutcome {
        let budget = self.options.primary.host_timeout;
        let primary_cause = match self.prober.scan(address, &self.options.primary).await {
            Ok(report) if report.timed_out(address) => ProbeFailure::Timeout(budget),
            Ok(report) => {
                let ports = report.open_ports(address, ProbeStrategy::Primary);
                debug!("Found {} open ports for {}", ports.len(), address);
                return StrategyOutcome::PrimaryOk(ports);
            }
            Err(cause) => cause,
        };

        warn!("Primary scan failed for {}: {}; trying fallback", address, primary_cause);

        match self
            .prober
            .scan_top(address, self.options.fallback_top_ports)
            .await
        {
            Ok(report) if report.timed_out(address) => StrategyOutcome::BothFailed(ProbeError {
                address: address.to_string(),
                primary_cause,
                fallback_cause: ProbeFailure::Timeout(budget),
            }),
            Ok(report) => {
                let ports = report.open_ports(address, ProbeStrategy::Fallback);
                debug!("Fallback found {} open ports for {}", ports.len(), address);
                StrategyOutcome::FallbackOk { ports, primary_cause }
            }
            Err(fallback_cause) => StrategyOutcome::BothFailed(ProbeError {
                address: address.to_string(),
                primary_cause,
                fallback_cause,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use crate::probe::{HostPorts, ProbeReport, RawPort, SimplifiedReport, StructuredReport};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Scripted capability: each tier either answers with ports or fails
    struct Scripted {
        primary: Result<Vec<RawPort>, ProbeFailure>,
        fallback: Result<Vec<RawPort>, ProbeFailure>,
    }

    fn hosts(address: &str, ports: Vec<RawPort>) -> Vec<HostPorts> {
        vec![HostPorts {
            addresses: vec![address.to_string()],
            ports,
            timed_out: false,
        }]
    }

    #[async_trait]
    impl Prober for Scripted {
        async fn scan(&mut self, address: &str, _mode: &ProbeMode) -> Result<ProbeReport, ProbeFailure> {
            self.primary.clone().map(|ports| {
                ProbeReport::Structured(StructuredReport {
                    hosts: hosts(address, ports),
                })
            })
        }

        async fn scan_top(&mut self, address: &str, _n: u16) -> Result<ProbeReport, ProbeFailure> {
            self.fallback.clone().map(|ports| {
                ProbeReport::Simplified(SimplifiedReport {
                    hosts: hosts(address, ports),
                })
            })
        }
    }

    fn ssh() -> Vec<RawPort> {
        vec![RawPort::new("tcp", "22", "open", Some("ssh"))]
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let prober = Scripted {
            primary: Ok(ssh()),
            fallback: Err(ProbeFailure::Other("unused".into())),
        };
        let mut adapter = ProbeAdapter::new(Box::new(prober), ProbeOptions::default());

        let outcome = adapter.run_strategy("10.0.0.1").await;
        assert_eq!(outcome.strategy(), Some(ProbeStrategy::Primary));
        assert_eq!(
            outcome.into_result().unwrap(),
            vec![PortObservation::new(Protocol::Tcp, 22, "ssh")]
        );
    }

    #[tokio::test]
    async fn fallback_answers_when_primary_fails() {
        let prober = Scripted {
            primary: Err(ProbeFailure::Timeout(Duration::from_secs(30))),
            fallback: Ok(ssh()),
        };
        let mut adapter = ProbeAdapter::new(Box::new(prober), ProbeOptions::default());

        match adapter.run_strategy("10.0.0.1").await {
            StrategyOutcome::FallbackOk { ports, primary_cause } => {
                assert_eq!(ports.len(), 1);
                assert_eq!(ports[0].label, ProbeStrategy::Fallback);
                assert_eq!(primary_cause, ProbeFailure::Timeout(Duration::from_secs(30)));
            }
            other => panic!("expected fallback success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn both_failures_are_reported_together() {
        let prober = Scripted {
            primary: Err(ProbeFailure::Parse("truncated".into())),
            fallback: Err(ProbeFailure::ExitStatus {
                code: Some(1),
                stderr: "boom".into(),
            }),
        };
        let mut adapter = ProbeAdapter::new(Box::new(prober), ProbeOptions::default());

        let err = adapter.probe("10.0.0.2").await.unwrap_err();
        assert_eq!(err.address, "10.0.0.2");
        assert_eq!(err.primary_cause, ProbeFailure::Parse("truncated".into()));
        assert!(matches!(err.fallback_cause, ProbeFailure::ExitStatus { .. }));
    }

    /// Capability whose primary scan reports the host as timed out
    struct TimesOut {
        fallback_times_out: bool,
    }

    #[async_trait]
    impl Prober for TimesOut {
        async fn scan(&mut self, _address: &str, _mode: &ProbeMode) -> Result<ProbeReport, ProbeFailure> {
            let xml = r#"<nmaprun scanner="nmap"><host timedout="true"><address addr="10.0.0.1"/></host></nmaprun>"#;
            StructuredReport::parse(xml).map(ProbeReport::Structured)
        }

        async fn scan_top(&mut self, address: &str, _n: u16) -> Result<ProbeReport, ProbeFailure> {
            Ok(ProbeReport::Simplified(SimplifiedReport {
                hosts: vec![HostPorts {
                    addresses: vec![address.to_string()],
                    ports: ssh(),
                    timed_out: self.fallback_times_out,
                }],
            }))
        }
    }

    #[tokio::test]
    async fn host_timeout_in_report_triggers_fallback() {
        let prober = TimesOut { fallback_times_out: false };
        let mut adapter = ProbeAdapter::new(Box::new(prober), ProbeOptions::default());

        match adapter.run_strategy("10.0.0.1").await {
            StrategyOutcome::FallbackOk { ports, primary_cause } => {
                assert_eq!(ports, vec![PortObservation::new(Protocol::Tcp, 22, "ssh").with_label(ProbeStrategy::Fallback)]);
                assert_eq!(primary_cause, ProbeFailure::Timeout(Duration::from_secs(30)));
            }
            other => panic!("expected fallback success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn host_timeout_on_both_tiers_fails() {
        let prober = TimesOut { fallback_times_out: true };
        let mut adapter = ProbeAdapter::new(Box::new(prober), ProbeOptions::default());

        let err = adapter.probe("10.0.0.1").await.unwrap_err();
        assert!(matches!(err.primary_cause, ProbeFailure::Timeout(_)));
        assert!(matches!(err.fallback_cause, ProbeFailure::Timeout(_)));
    }

    #[test]
    fn options_follow_config() {
        let config = EngineConfig::default()
            .with_host_timeout(12)
            .with_fallback_top_ports(50);
        let options = ProbeOptions::from_config(&config);
        assert_eq!(options.primary.host_timeout, Duration::from_secs(12));
        assert_eq!(options.fallback_top_ports, 50);
    }
}
