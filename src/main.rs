use clap::Parser;
use plant_telemetry_lib::views::{kpi_tiles, recent_anomalies};
use plant_telemetry_lib::{AppError, ClientArgs, DecodeFailurePolicy, TelemetryClient};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

/// Headless plant telemetry client: follows the telemetry and alert streams and logs what it sees.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON config file; flags given here override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Telemetry websocket endpoint (ws:// or wss://)
    #[arg(long)]
    telemetry_url: Option<String>,

    /// Alert websocket endpoint (ws:// or wss://)
    #[arg(long)]
    alerts_url: Option<String>,

    /// Number of records kept in the rolling window
    #[arg(long)]
    capacity: Option<usize>,

    /// Keep the last frame that failed to decode
    #[arg(long)]
    degraded: bool,

    /// How often the window summary is logged
    #[arg(long, default_value = "5000")]
    report_interval_ms: u64,
}

impl Cli {
    fn client_args(&self) -> ClientArgs {
        ClientArgs {
            telemetry_url: self.telemetry_url.clone(),
            alerts_url: self.alerts_url.clone(),
            window_capacity: self.capacity,
            decode_failure_policy: self.degraded.then_some(DecodeFailurePolicy::Degraded),
            ..ClientArgs::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = ClientArgs::from_env()?;
    if let Some(path) = &cli.config {
        args = args.overlay(ClientArgs::from_json_file(path)?);
    }
    let config = args.overlay(cli.client_args()).normalize()?;

    tracing::info!(
        telemetry = %config.telemetry_url,
        alerts = %config.alerts_url,
        capacity = config.window_capacity,
        "starting plant-telemetry v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = TelemetryClient::start(&config);
    let subscription = client.subscribe_to_alerts(|alert| {
        tracing::warn!("{}", alert.describe());
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(cli.report_interval_ms.max(100)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(error) = result {
                    tracing::error!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = ticker.tick() => report(&client),
        }
    }

    tracing::info!("shutting down");
    subscription.unsubscribe().await;
    client.dispose().await;
    Ok(())
}

fn report(client: &TelemetryClient) {
    let snapshot = client.snapshot();
    let stats = client.ingest_stats();
    tracing::info!(
        telemetry = client.connection_state().as_str(),
        alerts = client.alert_connection_state().as_str(),
        records = snapshot.len(),
        appended = stats.appended,
        rejected = stats.rejected,
        anomalies = recent_anomalies(&snapshot, 10).len(),
        "stream summary"
    );

    let tiles = kpi_tiles(snapshot.last())
        .into_iter()
        .map(|tile| format!("{}={}{}", tile.label, tile.value, tile.unit))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!("latest {tiles}");
}
