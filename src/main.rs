use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use guardian_agent::config::PolicyUpdate;
use guardian_agent::ingest::{install_panic_hook, spawn_line_forwarder, tail_file, MonitorLayer};
use guardian_agent::llm::{LlmAgent, ReasoningAgent};
use guardian_agent::{Guardian, GuardianConfig};

/// Guardian - self-healing supervisor for a running web application
#[derive(Parser, Debug)]
#[command(name = "guardian-agent", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project directory to heal (ignored when --config is given)
    #[arg(short, long, default_value = ".")]
    project_root: PathBuf,

    /// Application log file to tail
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// Read application log lines from stdin
    #[arg(long)]
    stdin: bool,

    /// Apply patches without waiting for approval
    #[arg(long)]
    auto_apply: bool,

    /// Do not pause sessions for operator approval
    #[arg(long)]
    no_approval: bool,

    /// Start the managed server before watching
    #[arg(long)]
    start_server: bool,
}

fn load_config(args: &Args) -> Result<GuardianConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => GuardianConfig::from_file(path)?,
        None => GuardianConfig::for_project(args.project_root.clone()),
    };
    if let Some(path) = &args.log_file {
        config.monitor.log_file = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

fn build_agents(config: &GuardianConfig) -> Vec<Arc<dyn ReasoningAgent>> {
    let mut agents: Vec<Arc<dyn ReasoningAgent>> = Vec::new();
    for agent_config in &config.proposals.agents {
        match LlmAgent::from_config(agent_config) {
            Ok(agent) => agents.push(Arc::new(agent)),
            Err(e) => warn!(agent = %agent_config.id, error = %e, "reasoning agent disabled"),
        }
    }
    agents
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let guardian = Arc::new(Guardian::from_config(&config, build_agents(&config)));
    let monitor = Arc::clone(guardian.monitor());

    // Events go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(MonitorLayer::new(Arc::clone(&monitor)))
        .init();
    install_panic_hook(Arc::clone(&monitor));

    info!(
        project_root = %config.patcher.project_root.display(),
        agents = config.proposals.agents.len(),
        "guardian agent starting"
    );

    let mut events = guardian.subscribe();
    guardian.start(Some(PolicyUpdate {
        auto_apply: args.auto_apply.then_some(true),
        require_approval: args.no_approval.then_some(false),
        ..Default::default()
    }));

    if let Some(path) = &config.monitor.log_file {
        tail_file(
            path.clone(),
            Arc::clone(&monitor),
            Duration::from_millis(config.monitor.tail_interval_ms),
        );
    }
    if args.stdin {
        spawn_line_forwarder(tokio::io::stdin(), Arc::clone(&monitor));
    }
    if args.start_server {
        match guardian.restart_server().await {
            Ok(pid) => info!(pid, "managed server started"),
            Err(e) => error!(error = %e, "failed to start managed server"),
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(error = %e, "failed to encode event"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event printer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    guardian.stop();
    let stats = guardian.stats();
    info!(
        started = stats.sessions_started,
        completed = stats.sessions_completed,
        failed = stats.sessions_failed,
        success_rate = stats.success_rate(),
        "guardian agent stopped"
    );
    Ok(())
}
