use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use tokio::net::TcpListener;

use ash::api;
use ash::bootstrap;
use ash::config::{Config, RunnerConfig};
use ash::runner::wire::{HeartbeatRequest, INTERNAL_SECRET_HEADER, RegisterRequest};

#[derive(Debug, Parser)]
#[command(
    name = "ash",
    author,
    version,
    about = "Ash - sandboxed AI-agent session orchestration.",
    propagate_version = true
)]
struct Cli {
    /// Reduce output to only errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the coordinator / standalone HTTP server.
    Serve(ServeCommand),
    /// Start a runner node that hosts sandboxes for a coordinator.
    Runner(RunnerCommand),
}

#[derive(Debug, clap::Args)]
struct ServeCommand {
    #[command(flatten)]
    config: Config,
}

#[derive(Debug, clap::Args)]
struct RunnerCommand {
    #[command(flatten)]
    config: Config,
    #[command(flatten)]
    runner: RunnerConfig,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command {
        Command::Serve(cmd) => run_async(serve(cmd.config)),
        Command::Runner(cmd) => run_async(run_runner(cmd.config, cmd.runner)),
    };

    if let Err(err) = result {
        error!("{err:?}");
        std::process::exit(2);
    }
}

#[tokio::main]
async fn run_async(fut: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    fut.await
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if cli.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ash={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(io::stderr().is_terminal())
                .with_target(cli.verbose > 0),
        )
        .try_init()
        .ok();

    // Bridge for log-crate macros used throughout the library.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.try_init().ok();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Ash server on {}:{}", config.host, config.port);

    let coordinator = bootstrap::build_coordinator(&config).await?;
    let app = api::create_router(coordinator.state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    let listener = TcpListener::bind(addr).await.context("binding listener")?;
    info!("Ash listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain local sandboxes: shutdown to every bridge, grace, then kill.
    if let Some(stack) = coordinator.local {
        info!("Shutting down local sandboxes");
        stack.manager.shutdown_all().await;
        for task in stack.background {
            task.abort();
        }
    }

    Ok(())
}

async fn run_runner(config: Config, runner: RunnerConfig) -> Result<()> {
    let (state, stack, runner_id) = bootstrap::build_runner(&config, &runner).await?;
    let app = api::create_runner_router(state);

    let addr: SocketAddr = format!("{}:{}", runner.host, runner.port)
        .parse()
        .context("invalid runner bind address")?;
    let listener = TcpListener::bind(addr).await.context("binding listener")?;
    info!("Runner {} listening on {}", runner_id, addr);

    let heartbeat = tokio::spawn(heartbeat_loop(
        runner_id.clone(),
        runner.clone(),
        config.clone(),
        stack.pool.clone(),
    ));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("runner server error")?;

    heartbeat.abort();
    info!("Shutting down runner sandboxes");
    stack.manager.shutdown_all().await;
    for task in stack.background {
        task.abort();
    }
    Ok(())
}

/// Register with the coordinator, then heartbeat on the configured
/// interval; re-register when the coordinator forgets us.
async fn heartbeat_loop(
    runner_id: String,
    runner: RunnerConfig,
    config: Config,
    pool: std::sync::Arc<ash::sandbox::SandboxPool>,
) {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();

    let authed = |builder: reqwest::RequestBuilder| match &config.internal_secret {
        Some(secret) => builder.header(INTERNAL_SECRET_HEADER, secret),
        None => builder,
    };

    let register = RegisterRequest {
        id: runner_id.clone(),
        host: runner.advertise_host(),
        port: runner.port as i64,
        max_sandboxes: config.max_sandboxes as i64,
    };
    let register_url = format!("{}/api/internal/runners/register", runner.server_url);
    let heartbeat_url = format!("{}/api/internal/runners/heartbeat", runner.server_url);

    // Initial registration, retried until the coordinator is reachable.
    loop {
        match authed(client.post(&register_url)).json(&register).send().await {
            Ok(res) if res.status().is_success() => {
                info!("Registered with coordinator at {}", runner.server_url);
                break;
            }
            Ok(res) => warn!("Registration rejected: {}", res.status()),
            Err(e) => warn!("Registration failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(runner.heartbeat_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let metrics = pool.metrics().await;
        let body = HeartbeatRequest {
            id: runner_id.clone(),
            active_count: (metrics.warm + metrics.waiting + metrics.running) as i64,
            warming_count: metrics.warming as i64,
        };
        match authed(client.post(&heartbeat_url)).json(&body).send().await {
            Ok(res) if res.status().as_u16() == 404 => {
                warn!("Coordinator lost our registration, re-registering");
                let _ = authed(client.post(&register_url)).json(&register).send().await;
            }
            Ok(res) if !res.status().is_success() => {
                warn!("Heartbeat rejected: {}", res.status());
            }
            Ok(_) => {}
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}
