mod assistant;
mod collectors;
mod commands;
mod config;
mod generate;
mod heuristics;
mod http;
mod jobs;
mod metrics;
mod monitor;
mod scheduler;
mod state;

use axum::serve;
use clap::Parser;
use collectors::system::SysinfoProvider;
use collectors::{ProviderFactory, SystemProvider};
use config::Config;
use generate::Generator;
use metrics::{now_unix, Metrics};
use monitor::Monitor;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "osaid")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "automation_off")]
    automation_on: bool,
    #[arg(long, conflicts_with = "automation_on")]
    automation_off: bool,
    /// Take one snapshot, print the tick report as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cli.automation_on {
        cfg.monitor.automation_enabled = true;
    } else if cli.automation_off {
        cfg.monitor.automation_enabled = false;
    }

    let providers: ProviderFactory =
        Arc::new(|| Box::new(SysinfoProvider::new()) as Box<dyn SystemProvider>);

    if cli.once {
        let monitor_cfg = cfg.monitor.clone();
        let factory = providers.clone();
        let report = tokio::task::spawn_blocking(move || {
            monitor::single_tick(&monitor_cfg, factory())
        })
        .await;
        match report.map(|r| serde_json::to_string_pretty(&r)) {
            Ok(Ok(json)) => println!("{json}"),
            Ok(Err(err)) => {
                error!(error = %err, "failed to serialize tick report");
                std::process::exit(1);
            }
            Err(err) => {
                error!(error = %err, "single tick failed");
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.monitor.interval_secs,
        automation = cfg.monitor.automation_enabled,
        "starting osaid"
    );

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let app_state = http::HttpAppState {
            metrics: metrics.clone(),
            state: shared_state.clone(),
            providers: providers.clone(),
            generator: Arc::new(Generator::new(cfg.llm.clone())),
            monitor_cfg: cfg.monitor.clone(),
            cpu_stability: cfg.cpu_stability.clone(),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to bind HTTP server");
                    return;
                }
            };
            info!(%addr, "HTTP server listening");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let mut monitor = Monitor::new(cfg.monitor.clone(), providers, metrics, shared_state);
    monitor.start();

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    monitor.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
