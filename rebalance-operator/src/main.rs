use std::sync::Arc;

use anyhow::Context;
use coordination_store::leader_election::LeaderElectionConfig;
use coordination_store::{EtcdStore, StoreConfig};
use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use rebalance_operator::config::Config;
use rebalance_operator::cruise_control::HttpEngineConnector;
use rebalance_operator::health::{self, OperatorHealth};
use rebalance_operator::operator::Operator;
use rebalance_operator::reconciler::ClusterReconciler;
use rebalance_operator::store::EtcdResourceStore;

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;

    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    tracing::info!("Starting rebalance-operator");
    tracing::info!("etcd endpoints: {}", config.etcd_endpoints);
    tracing::info!("etcd prefix: {}", config.etcd_prefix);
    tracing::info!("HTTP address: {}", config.bind_address());

    let health = OperatorHealth::new(config.liveness_deadline());
    let recorder = health::setup_metrics_recorder().context("failed to install metrics recorder")?;
    let router = health::router(health.clone(), Some(recorder));

    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "health server error");
        }
    });

    let etcd = EtcdStore::connect(StoreConfig {
        endpoints: config.etcd_endpoint_list(),
        prefix: config.etcd_prefix.clone(),
    })
    .await
    .context("failed to connect to etcd")?;
    let client = etcd.client().clone();

    let store = Arc::new(EtcdResourceStore::new(etcd));
    let connector = Arc::new(HttpEngineConnector::new(config.engine_request_timeout()));
    let reconciler = ClusterReconciler::new(
        store.clone(),
        connector,
        config.hard_goal_list(),
        config.allocation_max_attempts,
    );
    let operator = Operator::new(store, reconciler, config.reconcile_interval(), health);

    let election = LeaderElectionConfig {
        name: config.operator_name.clone(),
        leader_key: config.leader_key(),
        lease_ttl: config.leader_lease_ttl_secs,
        keepalive_interval: config.leader_keepalive_interval(),
        retry_interval: config.election_retry_interval(),
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    operator.run(client, election, cancel).await?;
    tracing::info!("rebalance-operator stopped");
    Ok(())
}
