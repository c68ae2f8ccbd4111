use anyhow::Context as _;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod clock;
mod collector;
mod config;
mod stamper;
mod state;
mod storage;

use config::{CliArgs, Config};
use stamper::{Point, Stamper};
use state::LatencySample;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let latency_state = Arc::new(state::LatencyState::new());

    // ── XDP stampers ──────────────────────────────────────────────────
    let stamper_task = if config.ingress_interface.is_some() || config.egress_interface.is_some() {
        let mut stamper = Stamper::load(Path::new(&config.ebpf_object))?;
        if let Some(ref iface) = config.ingress_interface {
            stamper.attach(Point::Ingress, iface, config.xdp_mode)?;
        }
        if let Some(ref iface) = config.egress_interface {
            stamper.attach(Point::Egress, iface, config.xdp_mode)?;
        }

        // The task owns the stamper; aborting it detaches the programs.
        let state_counters = latency_state.clone();
        Some(tokio::spawn(async move {
            let mut poll_interval = interval(Duration::from_secs(1));
            loop {
                poll_interval.tick().await;
                match stamper.counters() {
                    Ok(counters) => state_counters.set_stamps(&counters),
                    Err(e) => tracing::error!("Reading stamp counters failed: {}", e),
                }
            }
        }))
    } else {
        tracing::info!("No ingress or egress interface configured, stampers not attached");
        None
    };

    // ── Storage ───────────────────────────────────────────────────────
    let storage = Arc::new(storage::Storage::new(&config.db_path)?);
    let (tx, rx) = mpsc::channel::<LatencySample>(10000);

    let storage_writer = storage.clone();
    let writer = tokio::spawn(async move {
        storage_writer.run_writer(rx).await;
    });

    // ── Data Retention Task ───────────────────────────────────────────
    if let Some(retention_seconds) = config.data_retention_seconds {
        let storage_retention = storage.clone();
        tokio::spawn(async move {
            let mut retention_interval = interval(Duration::from_secs(60));
            loop {
                retention_interval.tick().await;
                match storage_retention.delete_old_data(retention_seconds) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!("Data retention: deleted {} old samples", deleted);
                    }
                    Err(e) => {
                        tracing::error!("Data retention cleanup failed: {}", e);
                    }
                    _ => {}
                }
            }
        });
    }

    // ── Collector ─────────────────────────────────────────────────────
    let collector_ip = collector_address(&config)?;
    let mut collectors = JoinSet::new();
    if !config.collector_ports.is_empty() {
        let sockets =
            collector::bind(collector_ip, &config.collector_ports, config.recv_buffer_bytes)?;
        for (port, socket) in sockets {
            collectors.spawn(collector::run_port(
                socket,
                port,
                tx.clone(),
                latency_state.clone(),
            ));
        }
        tracing::info!(
            "{} collecting UDP timing payloads on {}:{:?}",
            collector::pod_id(collector_ip),
            collector_ip,
            config.collector_ports
        );
    }
    // Collectors hold the only senders from here on.
    drop(tx);

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        latency: latency_state.clone(),
        storage: storage.clone(),
        start_time: std::time::Instant::now(),
    });

    let app = api::router(app_state, &config.allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Shutdown ──────────────────────────────────────────────────────
    let collecting = !collectors.is_empty();
    collectors.shutdown().await;
    writer.await.context("sample writer task failed")?;

    if collecting {
        let pod_id = collector::pod_id(collector_ip);
        let path = storage.export_json(Path::new(&config.output_dir), &pod_id, collector_ip)?;
        tracing::info!("Entries saved to {}", path.display());
    }

    if let Some(task) = stamper_task {
        task.abort();
        let _ = task.await;
        tracing::info!("XDP programs detached");
    }

    Ok(())
}

/// Address the collector binds to: explicit `bind_address`, else the IPv4
/// address of `collector_interface`, else all addresses.
fn collector_address(config: &Config) -> anyhow::Result<Ipv4Addr> {
    if let Some(ip) = config.bind_address {
        return Ok(ip);
    }
    match config.collector_interface {
        Some(ref iface) => collector::interface_ipv4(iface),
        None => Ok(Ipv4Addr::UNSPECIFIED),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received SIGINT, saving entries and exiting...");
}
