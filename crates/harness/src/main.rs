//! Hardware stress-orchestration and machine-check harvesting harness.
//!
//! Repeatedly executes external stress binaries pinned to configured
//! logical core sets, sampling per-core MCA bank registers after each
//! run. See `README` / `SPEC_FULL.md` for the configuration format.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use mca_harness::config::Settings;
use mca_harness::executor::Executor;
use mca_harness::lifecycle::Lifecycle;
use mca_harness::logging::{init_tracing, ResultLog};
use mca_harness::mca::{McaSampler, SocketLookup};
use mca_harness::msr::MsrGateway;
use mca_harness::partition::PartitionResolver;
use mca_harness::scheduler::Scheduler;
use mca_harness::topology::{socket_id_for_core, Topology};
use mca_harness::HarnessError;

#[derive(Parser, Debug)]
#[command(name = "mca-harness", about = "Hardware stress and machine-check harvesting harness")]
struct Cli {
    /// Path to a YAML/JSON settings file, or an inline JSON settings string.
    settings: String,

    /// Overrides the settings document's `Run_Directory`.
    #[arg(long = "run_dir")]
    run_dir: Option<String>,

    /// Overrides the settings document's `Log_Directory`.
    #[arg(long = "log_dir")]
    log_dir: Option<String>,
}

struct SysfsSockets;

impl SocketLookup for SysfsSockets {
    fn socket_id(&self, core_id: usize) -> mca_harness::Result<u32> {
        socket_id_for_core(core_id, Path::new("/sys/devices/system/cpu"))
    }
}

fn uptime_seconds() -> String {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().map(str::to_string))
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("fatal: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut lifecycle = Lifecycle::new();
    lifecycle
        .validate_environment(Path::new("/"))
        .context("environment validation failed")?;

    let topology = Topology::probe().context("failed to probe CPU topology")?;

    let settings = Settings::load(&cli.settings, cli.run_dir.clone(), cli.log_dir.clone(), &topology)
        .context("failed to load settings")?;

    let _tracing_guard = init_tracing(&settings.log_directory, settings.log_level.as_filter_directive())
        .context("failed to initialize logging")?;

    info!("topology: {:?}", topology);
    lifecycle.raise_resource_limits();

    let mut result_log = ResultLog::open(&settings.log_directory).context("failed to open result log")?;

    let msr = MsrGateway::open(topology.num_logical_cores).context("failed to open MSR gateway")?;
    let sampler = McaSampler::new(&msr);
    let sockets = SysfsSockets;

    let resolver = PartitionResolver::new(&settings.run_directory, topology)
        .context("failed to initialize partition resolver")?;
    let divisions = resolver
        .resolve_all(
            &settings.core_config.requests,
            &settings.core_config.explicit_cores,
            &settings.core_config.thread_list(),
        )
        .context("failed to resolve core partitions")?;

    let mut scheduler = Scheduler::new(&settings, divisions).context("failed to initialize scheduler")?;
    let executor = Executor::new();

    let shutdown = install_signal_handlers();

    let guard = lifecycle
        .acquire_check_interval()
        .context("failed to set machine-check polling interval")?;
    lifecycle.flush_mces().await.context("MCA flush failed")?;
    lifecycle.enter_running();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            warn!("shutdown requested; stopping before next command");
            break;
        }

        let command = match scheduler.next_command() {
            Ok(cmd) => cmd,
            Err(HarnessError::Exhausted) => {
                info!("test schedule exhausted; run complete");
                break;
            }
            Err(e) => {
                lifecycle.mark_fault();
                return Err(e).context("scheduler failed");
            }
        };

        let uptime = uptime_seconds();
        result_log
            .record_current(command.sequence, &command.command_line, &command.cores, &uptime)
            .context("failed to record in-flight command")?;
        info!("running command #{}: {}", command.sequence, command.command_line);

        let execution = executor
            .run(command.clone())
            .await
            .context("failed to execute command")?;

        lifecycle.enter_sampling();
        let mce_banks = if settings.constant_mce_checking {
            match sampler.sample(topology.num_logical_cores, &sockets) {
                Ok(banks) => banks,
                Err(e) => {
                    warn!("MCA sampling failed: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        lifecycle.resume_running();

        let failing_cores = execution.failing_cores();
        let acf_details: String = execution
            .core_results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| {
                format!(
                    "core {} exited {:?}: stderr: {}",
                    r.core, r.exit_code, r.stderr
                )
            })
            .collect::<Vec<_>>()
            .join(";");

        result_log
            .record_result(
                command.sequence,
                &command.command_line,
                &command.cores,
                execution.is_acf(),
                &failing_cores,
                &acf_details,
                &mce_banks,
                &uptime,
            )
            .context("failed to record command result")?;
    }

    lifecycle.finish();
    drop(guard);
    Ok(())
}

/// Installs SIGTERM/SIGINT handlers that flip a shared flag rather than
/// terminate immediately — the run loop only checks it between commands,
/// so an in-flight fan-out is always joined before exit.
fn install_signal_handlers() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_term = Arc::clone(&flag);
    tokio::spawn(async move {
        if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            term.recv().await;
            flag_term.store(true, Ordering::Relaxed);
        }
    });
    let flag_int = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag_int.store(true, Ordering::Relaxed);
        }
    });
    flag
}
