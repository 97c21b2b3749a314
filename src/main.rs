//! rqd entry point.

use clap::Parser;
use rqd::agent::{Agent, IdleAction};
use rqd::api::state::ApiState;
use rqd::config::RqdConfig;
use rqd::dispatcher::HttpDispatcher;
use rqd::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// rqd - render-host agent
#[derive(Parser, Debug)]
#[command(name = "rqd")]
#[command(about = "Render-host agent: books cores, supervises frames, reports to the dispatcher")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control-plane listen address; overrides the configuration file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Disable NIMBY even on desktops.
    #[arg(long)]
    nimby_off: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    tracing::debug!(version = rqd::VERSION, "starting rqd");

    let action = match run(&cli) {
        Ok(action) => action,
        Err(e) => {
            tracing::error!(error = %e, "rqd failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if action == Some(IdleAction::Restart) {
        restart_self();
    }
}

fn run(cli: &Cli) -> Result<Option<IdleAction>> {
    let mut config = RqdConfig::load(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        config.server.listen = listen.clone();
    }
    if cli.nimby_off {
        config.overrides.nimby = Some(false);
    }

    let addr: SocketAddr = config.server.listen.parse().map_err(|e| {
        Error::Config(format!(
            "invalid listen address '{}': {}",
            config.server.listen, e
        ))
    })?;

    // Desktop frames expect an X display.
    if std::env::var_os("DISPLAY").is_none() {
        std::env::set_var("DISPLAY", ":0");
    }

    let dispatcher = Arc::new(HttpDispatcher::new(&config.dispatcher)?);
    let agent = Agent::new(Arc::new(config), dispatcher)?;
    agent.start()?;

    let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
    let served = runtime.block_on(serve(Arc::clone(&agent), addr));

    agent.stop();
    agent.wait();
    served?;
    Ok(agent.exit_action())
}

async fn serve(agent: Arc<Agent>, addr: SocketAddr) -> Result<()> {
    let app = rqd::api::create_router(Arc::new(ApiState::new(Arc::clone(&agent))));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::op(&format!("bind {}", addr), e))?;

    tracing::info!(address = %addr, "control plane listening");

    let stopped = {
        let agent = Arc::clone(&agent);
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupted");
                    agent.stop();
                }
                _ = wait_stopped(Arc::clone(&agent)) => {}
            }
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(stopped)
        .await
        .map_err(Error::Io)?;

    Ok(())
}

async fn wait_stopped(agent: Arc<Agent>) {
    while !agent.is_shutdown() {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

/// Replace this process with a fresh copy of itself.
fn restart_self() {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            tracing::error!(error = %e, "cannot locate own executable");
            std::process::exit(1);
        }
    };
    tracing::info!(exe = %exe.display(), "restarting");
    let err = std::process::Command::new(&exe)
        .args(std::env::args_os().skip(1))
        .exec();
    tracing::error!(error = %err, "restart failed");
    std::process::exit(1);
}

/// Initialize the tracing subscriber.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "rqd=debug" } else { "rqd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
