//! Sentinel agent - hypervisor monitoring and forecasting
//!
//! Runs either as a monitor on each Proxmox host, polling the local
//! hypervisor API and publishing samples, or as cerebro, the central
//! aggregator hosting the broker, the store and the forecasting pool.

use anyhow::{Context, Result};
use sentinel_lib::{
    aggregator::Aggregator,
    health::{components, HealthRegistry},
    monitor::{ConnectionRegistry, MonitorAgent, ProxmoxClient},
    observability::{SentinelMetrics, StructuredLogger},
    store::InMemoryStore,
    transport::{
        Broker, BrokerConfig, BrokerServer, Credentials, LocalTransport, TcpTransport,
        TcpTransportConfig, Transport,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{AgentConfig, Role};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting sentinel-agent");

    let config = AgentConfig::load()?;
    let agent_id = config.agent_id();
    info!(role = config.role.as_str(), agent_id = %agent_id, "Agent configured");

    let health_registry = HealthRegistry::new();
    let metrics = SentinelMetrics::new();
    let logger = StructuredLogger::new(&agent_id);
    logger.log_startup(AGENT_VERSION, config.role.as_str());

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let mut tasks = Vec::new();

    let app_state = api::AppState::new(health_registry.clone(), metrics);
    let app_state = match config.role {
        Role::Cerebro => {
            let aggregator =
                start_cerebro(&config, &health_registry, &shutdown_tx, &mut tasks).await?;
            app_state.with_aggregator(aggregator)
        }
        Role::Monitor => {
            start_monitor(&config, &health_registry, &shutdown_tx, &mut tasks).await?;
            app_state
        }
    };

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, Arc::new(app_state)));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }
    api_handle.abort();

    Ok(())
}

/// Broker, broker listener, store, aggregator and store flushing
async fn start_cerebro(
    config: &AgentConfig,
    health: &HealthRegistry,
    shutdown: &broadcast::Sender<()>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<Arc<Aggregator>> {
    let identity = config.agent_id();
    health.register(components::TRANSPORT).await;

    let broker = Broker::new(BrokerConfig::default());
    for (peer, secret) in &config.credentials {
        broker.add_credentials(peer.as_str(), secret.as_str());
    }
    broker.add_credentials(identity.as_str(), config.secret.as_str());

    let listener = tokio::net::TcpListener::bind(&config.broker_addr)
        .await
        .with_context(|| format!("failed to bind broker on {}", config.broker_addr))?;
    info!(addr = %config.broker_addr, peers = config.credentials.len(), "Broker listening");
    tasks.push(tokio::spawn(
        BrokerServer::new(broker.clone()).serve(listener, shutdown.subscribe()),
    ));

    let store = Arc::new(
        InMemoryStore::open(config.store_config()).context("failed to open store")?,
    );
    let aggregator = Arc::new(
        Aggregator::new(config.aggregator_config(), store.clone()).with_health(health.clone()),
    );

    let session = LocalTransport::new(broker)
        .connect(&identity, &Credentials::new(config.secret.as_str()))
        .await
        .context("aggregator failed to attach to its broker")?;
    session
        .subscribe(aggregator.clone())
        .context("aggregator failed to subscribe")?;
    health.set_healthy(components::TRANSPORT).await;

    let mut closing = shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
        let _ = closing.recv().await;
        session.close().await;
    }));
    tasks.push(tokio::spawn(aggregator.clone().run(shutdown.subscribe())));
    tasks.push(tokio::spawn(flush_store(
        store,
        Duration::from_secs(config.flush_interval_secs.max(1)),
        shutdown.subscribe(),
    )));

    Ok(aggregator)
}

/// Hypervisor client and monitor agent
async fn start_monitor(
    config: &AgentConfig,
    health: &HealthRegistry,
    shutdown: &broadcast::Sender<()>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    health.register(components::TRANSPORT).await;
    health.register(components::COLLECTOR).await;

    let client = ProxmoxClient::new(config.proxmox_config())
        .context("failed to build hypervisor client")?;
    let registry = ConnectionRegistry::new();
    registry.register(config.node_name.as_str(), Arc::new(client));

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(TcpTransportConfig {
        addr: config.broker_addr.clone(),
        ..Default::default()
    }));

    let agent = MonitorAgent::new(
        config.monitor_config(),
        transport,
        Credentials::new(config.secret.as_str()),
        registry,
    )
    .with_health(health.clone());
    tasks.push(tokio::spawn(agent.run(shutdown.subscribe())));

    Ok(())
}

/// Prune past retention and write store snapshots while data keeps
/// changing, and once more on exit
async fn flush_store(
    store: Arc<InMemoryStore>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let pruned = store.prune(chrono::Utc::now().timestamp()).await;
                if pruned > 0 {
                    info!(pruned, "Pruned store entries past retention");
                }
                if store.should_flush() {
                    if let Err(e) = store.flush().await {
                        error!(error = %e, "Failed to flush store");
                    }
                }
            }
        }
    }

    if let Err(e) = store.flush().await {
        error!(error = %e, "Final store flush failed");
    }
}
