//! Nmap-backed probing capability

use super::{ProbeMode, ProbeReport, Prober, SimplifiedReport, StructuredReport};
use crate::config::EngineConfig;
use crate::error::ProbeFailure;
use async_trait::async_trait;
use log::debug;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Runs one nmap subprocess per call. Each worker owns its own instance.
#[derive(Debug)]
pub struct NmapProber {
    nmap_path: String,
    /// Wall-clock bound on the subprocess, on top of nmap's own host timeout
    deadline: Duration,
    scans_run: u64,
}

impl NmapProber {
    pub fn new(nmap_path: impl Into<String>, deadline: Duration) -> Self {
        Self {
            nmap_path: nmap_path.into(),
            deadline,
            scans_run: 0,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.nmap_path.clone(), config.probe_deadline())
    }

    /// Number of subprocesses this handle has launched
    pub fn scans_run(&self) -> u64 {
        self.scans_run
    }

    /// Arguments for the structured scan of `address`
    pub fn structured_args(mode: &ProbeMode, address: &str) -> Vec<String> {
        let mut args = mode.args.clone();
        if !args.iter().any(|a| a == "--host-timeout") {
            args.push("--host-timeout".to_string());
            args.push(format!("{}s", mode.host_timeout.as_secs().max(1)));
        }
        args.push("-oX".to_string());
        args.push("-".to_string());
        args.push(address.to_string());
        args
    }

    /// Arguments for the reduced top-ports scan of `address`
    pub fn top_ports_args(n: u16, address: &str) -> Vec<String> {
        vec![
            "-Pn".to_string(),
            "--top-ports".to_string(),
            n.to_string(),
            "-oG".to_string(),
            "-".to_string(),
            address.to_string(),
        ]
    }

    async fn execute(&mut self, args: &[String]) -> Result<CommandOutput, ProbeFailure> {
        self.scans_run += 1;
        debug!("Executing {} with args: {:?}", self.nmap_path, args);

        let mut cmd = Command::new(&self.nmap_path);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let output = match timeout(self.deadline, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProbeFailure::Spawn(format!(
                    "failed to execute {}: {}",
                    self.nmap_path, e
                )))
            }
            Err(_) => return Err(ProbeFailure::Timeout(self.deadline)),
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            success: output.status.success(),
            exit_code: output.status.code(),
        };
        debug!(
            "nmap finished in {:?} with status {:?}",
            started.elapsed(),
            result.exit_code
        );

        if !result.success {
            return Err(ProbeFailure::ExitStatus {
                code: result.exit_code,
                stderr: result.stderr,
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl Prober for NmapProber {
    async fn scan(&mut self, address: &str, mode: &ProbeMode) -> Result<ProbeReport, ProbeFailure> {
        let args = Self::structured_args(mode, address);
        let output = self.execute(&args).await?;
        StructuredReport::parse(&output.stdout).map(ProbeReport::Structured)
    }

    async fn scan_top(&mut self, address: &str, n: u16) -> Result<ProbeReport, ProbeFailure> {
        let args = Self::top_ports_args(n, address);
        let output = self.execute(&args).await?;
        SimplifiedReport::parse(&output.stdout).map(ProbeReport::Simplified)
    }
}

/// Command execution output
#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
    exit_code: Option<i32>,
}
