use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use colored::*;
use log::{info, warn};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use portsnap::{
    config::EngineConfig,
    coordinator::{PhaseObserver, RunCoordinator, RunObserver, RunPhase},
    model::ScanOutcome,
    output::{print_banner, OutputConfig, OutputFormat, OutputManager, RunProgress},
    probe::{NmapProber, ProbeOptions, Prober, ProberFactory},
    storage::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore, SnapshotWriter},
    targets::{PgTargetSource, StaticTargetSource, TargetSource},
};

fn build_cli() -> Command {
    Command::new("portsnap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scan validator hosts with nmap and store daily open-port snapshots")
        .arg(
            Arg::new("limit")
                .short('l')
                .long("limit")
                .value_name("N")
                .help("Only scan the first N targets")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("Number of concurrent scans [default: 20]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show progress and per-host failure details")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file [default: ~/.portsnap.toml]"),
        )
        .arg(
            Arg::new("test-ips")
                .long("test-ips")
                .value_name("IP")
                .help("Scan these addresses instead of the gossip_peers table")
                .num_args(1..)
                .value_delimiter(','),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Scan but keep snapshots in memory instead of the database")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the run summary as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("host-timeout")
                .long("host-timeout")
                .value_name("SECS")
                .help("Per-host nmap timeout in seconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("fallback-top-ports")
                .long("fallback-top-ports")
                .value_name("N")
                .help("Ports probed by the fallback scan")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("nmap-path")
                .long("nmap-path")
                .value_name("PATH")
                .help("Path to the nmap binary"),
        )
        .arg(
            Arg::new("min-stake")
                .long("min-stake")
                .value_name("LAMPORTS")
                .help("Only scan identities with at least this much activated stake")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("no-banner")
                .long("no-banner")
                .help("Hide the banner")
                .action(ArgAction::SetTrue),
        )
}

fn load_config(matches: &clap::ArgMatches) -> anyhow::Result<EngineConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config file {}", path))?,
        None => EngineConfig::load_default_config()?,
    };

    config.database = config.database.apply_env()?;

    if let Some(threads) = matches.get_one::<usize>("threads") {
        config = config.with_threads(*threads);
    }
    if let Some(secs) = matches.get_one::<u64>("host-timeout") {
        config = config.with_host_timeout(*secs);
    }
    if let Some(n) = matches.get_one::<u16>("fallback-top-ports") {
        config = config.with_fallback_top_ports(*n);
    }
    if let Some(path) = matches.get_one::<String>("nmap-path") {
        config = config.with_nmap_path(path.clone());
    }
    if let Some(lamports) = matches.get_one::<u64>("min-stake") {
        config = config.with_min_activated_stake(Some(*lamports));
    }

    config.validate()?;
    Ok(config)
}

async fn run(matches: clap::ArgMatches) -> anyhow::Result<()> {
    let verbose = matches.get_flag("verbose");
    let json = matches.get_flag("json");
    let dry_run = matches.get_flag("dry-run");
    let limit = matches.get_one::<usize>("limit").copied();
    let test_ips: Option<Vec<String>> = matches
        .get_many::<String>("test-ips")
        .map(|vals| vals.map(|s| s.to_string()).collect());

    let config = load_config(&matches)?;

    if !matches.get_flag("no-banner") && !json {
        print_banner();
    }

    // The database is only needed for targets (without --test-ips) or storage (without --dry-run)
    let pg = if test_ips.is_none() || !dry_run {
        let store = PgSnapshotStore::connect(&config.database)
            .await
            .with_context(|| format!("cannot connect to database at {}", config.database.describe()))?;
        Some(Arc::new(store))
    } else {
        None
    };

    let source: Arc<dyn TargetSource> = match (&test_ips, &pg) {
        (Some(ips), _) => {
            info!("Using {} test addresses", ips.len());
            Arc::new(StaticTargetSource::from_test_ips(ips))
        }
        (None, Some(pg)) => Arc::new(
            PgTargetSource::new(pg.pool().clone()).with_min_activated_stake(config.min_activated_stake),
        ),
        (None, None) => anyhow::bail!("no target source available"),
    };

    let store: Arc<dyn SnapshotStore> = match (&pg, dry_run) {
        (Some(pg), false) => pg.clone() as Arc<dyn SnapshotStore>,
        _ => {
            info!("Dry run: snapshots are kept in memory");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    let prober_config = config.clone();
    let factory: ProberFactory =
        Arc::new(move || Box::new(NmapProber::from_config(&prober_config)) as Box<dyn Prober>);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight scans");
            ctrl_c.cancel();
        }
    });

    let progress = Arc::new(RunProgress::new(verbose && !json));
    let observer_progress = progress.clone();
    let observer: RunObserver = Arc::new(move |completed: usize, total: usize, outcome: &ScanOutcome| {
        observer_progress.observe(completed, total, outcome);
    });
    let phase_progress = progress.clone();
    let phase_observer: PhaseObserver = Arc::new(move |phase: RunPhase| phase_progress.enter(phase));

    let coordinator = RunCoordinator::new(
        source,
        SnapshotWriter::new(store.clone()),
        factory,
        ProbeOptions::from_config(&config),
    )
    .with_cancellation(cancel)
    .with_failure_preview(config.failure_preview)
    .with_observer(observer)
    .with_phase_observer(phase_observer);

    let result = coordinator.run(limit, config.threads).await;
    progress.finish();
    if let Some(pg) = &pg {
        pg.close().await;
    }

    let summary = result?;
    let output = OutputManager::new(OutputConfig {
        format: if json { OutputFormat::Json } else { OutputFormat::Text },
        colored: !json,
        verbose,
    });
    output.write_summary(&summary)?;

    Ok(())
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let matches = build_cli().get_matches();

    let default_level = if matches.get_flag("verbose") { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    if let Err(e) = run(matches).await {
        eprintln!("{} {:#}", "[!] ERROR:".bright_red().bold(), e);
        process::exit(1);
    }
}
