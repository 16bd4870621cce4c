//! xbatd entry point: configuration, signal wiring and the startup
//! sequence around the collection engine.
//!
//! Startup: read config, install logging, resolve the job id, register the
//! job with the control plane, benchmark and register the node when the
//! configuration hash is unseen, then hand over to the lifecycle
//! controller. A first SIGINT/SIGTERM latches the cancellation flag for a
//! graceful drain; a second one terminates immediately with failure.

use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;
use log::{debug, error, info};
use signal_hook::consts::{SIGINT, SIGTERM};

use xbatd::cancel::CancelFlag;
use xbatd::config::{Config, DEFAULT_CONFIG_PATH, JOB_INFO_PATH, LOG_FILE_PATH};
use xbatd::lifecycle::{self, EngineSettings};
use xbatd::restapi::ControlPlaneClient;
use xbatd::topology::CpuTopology;
use xbatd::writer::WriterOutcome;
use xbatd::{benchmark, logging, sysinfo};

/// Per-node measurement daemon of the xbat job monitoring system.
#[derive(Parser, Debug)]
#[command(name = "xbatd")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// ID of current job (overwrites /run/xbatd/job for local testing)
    #[arg(short, long)]
    job: Option<u32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let cancel = CancelFlag::new();
    if let Err(e) = install_signal_handlers(&cancel) {
        eprintln!("xbatd: failed to install signal handlers: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli, cancel) {
        Ok(outcome) => match outcome {
            WriterOutcome::Canceled => ExitCode::SUCCESS,
            WriterOutcome::Fatal => ExitCode::FAILURE,
        },
        Err(e) => {
            error!("{e:#}");
            eprintln!("xbatd: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// First delivery latches the flag; the second exits immediately with
/// failure (operator override).
fn install_signal_handlers(cancel: &CancelFlag) -> std::io::Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, 1, cancel.as_atomic())?;
        signal_hook::flag::register(signal, cancel.as_atomic())?;
    }
    Ok(())
}

fn run(cli: Cli, cancel: CancelFlag) -> anyhow::Result<WriterOutcome> {
    let config = Config::load(&cli.config)
        .map_err(|e| anyhow!("invalid configuration at {}: {e}", cli.config))?;

    logging::init(
        config.general.log_level,
        config.general.log_level_file,
        LOG_FILE_PATH,
    )
    .map_err(|e| anyhow!("failed to install logger: {e}"))?;

    let job_id = match cli.job {
        Some(id) => id,
        None => read_job_id().context("failed to read job ID")?,
    };
    debug!("monitoring for job {job_id}");

    let hostname = sysinfo::hostname().context("failed to get hostname")?;

    let system_info = sysinfo::gather_system_info(&hostname);
    let hash = sysinfo::config_hash(&system_info);
    debug!("node configuration hash: {hash}");

    let mut client =
        ControlPlaneClient::new(&config.restapi).context("failed to set up REST client")?;
    client
        .login()
        .context("failed to log in to the control plane")?;

    let job_settings = client
        .register_job(job_id, &hostname, &hash)
        .context("failed to register job")?;
    debug!("job settings: {job_settings:?}");

    let topology = match CpuTopology::detect() {
        Ok(topology) => Arc::new(topology),
        Err(e) => {
            client.logout();
            return Err(anyhow!("failed to read CPU topology: {e}"));
        }
    };

    if job_settings.benchmark_required {
        info!("benchmarking system...");
        let values = benchmark::benchmark_system(&topology);
        if values.is_empty() {
            error!("failed to benchmark system");
        }

        let mut registration = system_info.clone();
        registration["benchmarks"] = serde_json::json!(values);
        if let Err(e) = client.register_node(&hash, &registration) {
            error!("failed to register node - {e}");
        } else {
            info!("benchmarking completed - node successfully registered");
        }
    }

    client.logout();

    if !job_settings.enable_monitoring {
        info!("monitoring is disabled for this job - returning");
        return Ok(WriterOutcome::Canceled);
    }

    let settings = EngineSettings {
        job_id,
        hostname,
        interval_ms: job_settings.interval as i64 * 1000,
        enable_likwid: job_settings.enable_likwid,
    };

    Ok(lifecycle::run(&config, &settings, topology, cancel))
}

fn read_job_id() -> anyhow::Result<u32> {
    let raw = fs::read_to_string(JOB_INFO_PATH)
        .with_context(|| format!("cannot read {JOB_INFO_PATH}"))?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("{JOB_INFO_PATH} does not contain a job id: `{}`", raw.trim()))
}
