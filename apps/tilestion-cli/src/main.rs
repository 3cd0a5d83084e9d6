mod config;
mod simulate;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tilestion_bus::MemoryBus;
use tilestion_connection::ConnectionManager;
use tilestion_protocol::TelemetryValue;
use tilestion_protocol::channels::DEFAULT_CHANNELS;
use tilestion_telemetry::TelemetrySession;

use config::CliConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tilestion=debug")),
        )
        .init();

    let cfg = CliConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load configuration, using defaults");
        CliConfig::default()
    });
    info!(config = ?cfg, "starting");

    let bus = MemoryBus::new();
    if !cfg.username.is_empty() {
        bus.add_user(&cfg.username, &cfg.password);
    }

    let manager = Arc::new(ConnectionManager::with_config(
        Arc::new(bus.clone()),
        cfg.connection_config(),
    ));
    let session = TelemetrySession::new(Arc::clone(&manager), cfg.aggregator_config());

    let observations: Vec<_> = DEFAULT_CHANNELS
        .iter()
        .map(|(id, _)| {
            session.observe(id, |channel: &str, value: &TelemetryValue| match value {
                TelemetryValue::Vector(v) => {
                    println!("{channel:>8}  {value}  |{:.3}|", v.magnitude())
                }
                TelemetryValue::Scalar(_) => println!("{channel:>8}  {value}"),
            })
        })
        .collect();

    let username = if cfg.username.is_empty() {
        "anonymous"
    } else {
        cfg.username.as_str()
    };
    if let Err(e) = session.login(&cfg.bus_url, username, &cfg.password).await {
        anyhow::bail!("login failed: {e}");
    }
    info!(url = %cfg.bus_url, user = username, "logged in");

    let cancel = CancellationToken::new();
    let publisher = cfg
        .simulate
        .then(|| simulate::spawn(bus.clone(), cfg.simulate_interval(), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    cancel.cancel();
    if let Some(publisher) = publisher {
        let _ = publisher.await;
    }
    drop(observations);
    session.logout().await;

    for (id, _) in DEFAULT_CHANNELS {
        let stats = session.aggregator().stats(id).unwrap_or_default();
        info!(
            channel = id,
            points = session.series(id).len(),
            latest = ?session.latest(id),
            received = stats.received,
            parse_errors = stats.parse_errors,
            "channel summary"
        );
    }

    Ok(())
}
