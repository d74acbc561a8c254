use std::sync::Arc;

use onboard_sync::config::CoreConfig;
use onboard_sync::delivery::{self, DeliveryMux};
use onboard_sync::gateway::Gateway;
use onboard_sync::gateway::routes::sync_routes;
use onboard_sync::provision::{HttpProvisioner, NoopProvisioner, ProvisionConfig, Provisioner};
use onboard_sync::registry::{MemoryStore, SessionRegistry};
use onboard_sync::run::heuristic::Heuristic;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CoreConfig::from_env();

    eprintln!("onboard-sync v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!("   Health: http://0.0.0.0:{}/health", config.port);

    let provisioner: Arc<dyn Provisioner> = match ProvisionConfig::from_env() {
        Some(provision_config) => {
            eprintln!("   Provisioning: http ({})", provision_config.tracker_url);
            Arc::new(HttpProvisioner::new(provision_config))
        }
        None => {
            eprintln!("   Provisioning: noop (ONBOARD_SYNC_TRACKER_URL not set)");
            Arc::new(NoopProvisioner)
        }
    };

    let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), config.channel_capacity);
    let mux = DeliveryMux::new(Arc::clone(&registry));
    let gateway = Gateway::new(
        Arc::clone(&registry),
        Arc::clone(&mux),
        provisioner,
        Heuristic::new(config.min_proof_len),
        config.event_log_cap,
    );

    // Background maintenance: channel liveness and terminal-run cleanup.
    let _heartbeat_handle =
        delivery::spawn_heartbeat_task(Arc::clone(&mux), config.heartbeat_interval);
    let _reap_handle =
        delivery::spawn_reap_task(Arc::clone(&mux), config.reap_interval, config.reap_grace);

    let app = sync_routes(gateway, registry);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Sync server started");
    axum::serve(listener, app).await?;

    Ok(())
}
