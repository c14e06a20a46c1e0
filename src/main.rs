use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use evergreen_agent::agent::{AgentRunOptions, UpdateAgent};
use evergreen_agent::config::Settings;
use evergreen_agent::controller::UpdateController;
use evergreen_agent::observability::ObservabilityGuard;
use evergreen_agent::snapshot::RevertOutcome;

#[derive(Parser, Debug)]
#[command(name = "evergreen-agent")]
#[command(about = "Keeps a managed Jenkins on its approved update level", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate runtime configuration.
    Doctor,
    /// Poll the Directory and apply updates until interrupted.
    Run {
        /// Stop after N poll cycles.
        #[arg(long, value_parser = parse_positive_usize)]
        max_cycles: Option<usize>,
    },
    /// Run a single query/apply cycle.
    Once,
    /// Print the persisted update level.
    Level,
    /// Probe the managed instance once.
    Healthcheck,
    /// Take a checkpoint of JENKINS_HOME.
    Snapshot {
        #[arg(long)]
        message: String,
    },
    /// List checkpoints, newest first.
    Snapshots,
    /// Restore JENKINS_HOME to the state captured before a level.
    Revert {
        #[arg(long)]
        level: u64,
    },
    /// Print the applied-update audit log as JSON.
    Audit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;
    let _observability = ObservabilityGuard::init();

    match cli.command.unwrap_or(Commands::Doctor) {
        Commands::Doctor => print_doctor(&settings),
        Commands::Run { max_cycles } => {
            let controller = Arc::new(UpdateController::from_settings(&settings)?);
            let agent = UpdateAgent::new(
                controller,
                Duration::from_secs(settings.poll_interval_secs),
            );
            let options = AgentRunOptions {
                max_cycles,
                shutdown: Some(install_shutdown_flag()?),
            };
            let runtime = agent_runtime()?;
            runtime.block_on(agent.run(&options))?;
        }
        Commands::Once => {
            let controller = Arc::new(UpdateController::from_settings(&settings)?);
            let agent = UpdateAgent::new(controller, Duration::ZERO);
            let runtime = agent_runtime()?;
            let outcome = runtime.block_on(async {
                agent.controller().prepare()?;
                agent.run_once().await
            })?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Level => {
            let controller = UpdateController::from_settings(&settings)?;
            println!("{}", controller.get_current_level()?);
        }
        Commands::Healthcheck => {
            let controller = UpdateController::from_settings(&settings)?;
            let runtime = agent_runtime()?;
            let report = runtime.block_on(controller.health().check());
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                bail!("instance is unhealthy: {}", report.message);
            }
        }
        Commands::Snapshot { message } => {
            let controller = UpdateController::from_settings(&settings)?;
            controller.prepare()?;
            match controller.snapshotter().snapshot(&message)? {
                Some(commit) => println!("{commit}"),
                None => println!("snapshotting disabled"),
            }
        }
        Commands::Snapshots => {
            let controller = UpdateController::from_settings(&settings)?;
            let history = controller.snapshotter().history()?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Revert { level } => {
            let controller = UpdateController::from_settings(&settings)?;
            match controller.snapshotter().revert_to_level_before(level)? {
                RevertOutcome::Reverted { commit, message } => {
                    println!("reverted to {commit} ({message})")
                }
                RevertOutcome::NotFound => bail!("no checkpoint found for level {level}"),
                RevertOutcome::Disabled => bail!("snapshotting is disabled"),
            }
        }
        Commands::Audit => {
            let controller = UpdateController::from_settings(&settings)?;
            let records = controller.state().audit_records()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn print_doctor(settings: &Settings) {
    let report = settings.doctor_report();
    println!("Evergreen Agent Doctor");
    println!("data_dir: {}", report.data_dir.display());
    println!("jenkins_home: {}", report.jenkins_home.display());
    println!("jenkins_url: {}", report.jenkins_url);
    println!("endpoint: {}", report.endpoint);
    println!(
        "instance_id: {}",
        report.instance_id.unwrap_or_else(|| "<generated>".to_string())
    );
    println!("directory_token_loaded: {}", report.directory_token_loaded);
    println!("supervisor_url: {}", report.supervisor_url);
    println!("process_name: {}", report.process_name);
    println!("snapshotting_enabled: {}", report.snapshotting_enabled);
    println!("poll_interval_secs: {}", report.poll_interval_secs);
    println!("request_timeout_secs: {}", report.request_timeout_secs);
    for (name, policy) in [
        ("download", report.download),
        ("health_identity", report.health_identity),
        ("health_metrics", report.health_metrics),
    ] {
        println!(
            "{name}_retry: retries={} delay_ms={} backoff_factor={}",
            policy.retry, policy.delay_ms, policy.backoff_factor
        );
    }
    if report.warnings.is_empty() {
        println!("status: ok");
    } else {
        println!("status: warning");
        for warning in report.warnings {
            println!("- {}", warning);
        }
    }
}

fn agent_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed building agent runtime")
}

fn install_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        signal_flag.store(true, Ordering::SeqCst);
        tracing::info!(signal = "interrupt", action = "graceful_stop", "shutdown requested");
    })?;
    Ok(shutdown)
}

fn parse_positive_usize(value: &str) -> std::result::Result<usize, String> {
    let parsed = value
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid positive integer: {value}"))?;
    if parsed == 0 {
        return Err("value must be >= 1".to_string());
    }
    Ok(parsed)
}
