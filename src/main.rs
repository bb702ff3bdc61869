use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;

use lattice_activity::{ActivityRegistry, GroupCoordinator};
use lattice_core::{Envelope, PeerId};
use lattice_host::{HandlerState, HostWindowing, ServerConfig, WindowClientRegistry};
use lattice_store::{ChannelRegistry, ContextStore};
use lattice_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "lattice", about = "Cross-process context synchronization host")]
struct Args {
    /// Port for the window client WebSocket endpoint
    #[arg(long, default_value_t = 9180)]
    port: u16,

    /// Human-readable log output instead of JSON lines
    #[arg(long)]
    pretty_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        json_output: !args.pretty_logs,
        ..TelemetryConfig::default()
    });

    tracing::info!("Starting lattice host");

    // Every context mutation flows out on this channel; the host bridge
    // fans it to subscribed window clients.
    let (envelope_tx, envelope_rx) = broadcast::channel::<Envelope>(1024);
    let (event_tx, activity_rx) = broadcast::channel(1024);

    let clients = Arc::new(WindowClientRegistry::new(256));
    let store = Arc::new(ContextStore::new(PeerId::new(), envelope_tx));
    let windowing = Arc::new(HostWindowing::new(Arc::clone(&clients)));
    let activities = Arc::new(ActivityRegistry::new(Arc::clone(&store), windowing, event_tx));
    let coordinator = Arc::new(GroupCoordinator::new(Arc::clone(&activities)));
    let channels = Arc::new(ChannelRegistry::new(Arc::clone(&store)));

    let mut handler_state = HandlerState::new(store, activities, coordinator, channels, clients);
    if let Some(metrics) = telemetry.metrics() {
        handler_state = handler_state.with_metrics(Arc::clone(metrics));
    }

    let config = ServerConfig {
        port: args.port,
        ..ServerConfig::default()
    };
    let handle = lattice_host::start(config, Arc::new(handler_state), envelope_rx, activity_rx)
        .await
        .expect("Failed to start host server");

    tracing::info!(port = handle.port, "Lattice host ready");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");
    tracing::info!("Shutting down");
}
