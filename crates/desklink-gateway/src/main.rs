mod config;
mod telemetry;

use anyhow::Context;
use command_gateway::{
    build_mqtt_client, run_subscriber, CommandGateway, IdempotencyCache, MqttPublisher,
    MqttSettings,
};
use config::ServiceConfig;
use desklink_domain::HomeworkChangeHandler;
use desklink_postgres::{
    ChangeListenerConfig, HomeworkChangeListener, PostgresClient, PostgresProcedureClient,
    PostgresSettings, ProcedureClientConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    telemetry::init_telemetry(&config.log_level);

    info!(
        broker = %config.mqtt_url,
        client_id = %config.mqtt_client_id,
        "starting desklink gateway"
    );

    if let Err(e) = run(config).await {
        error!("gateway failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    let postgres_settings = PostgresSettings {
        host: config.postgres_host.clone(),
        port: config.postgres_port,
        database: config.postgres_database.clone(),
        username: config.postgres_username.clone(),
        password: config.postgres_password.clone(),
    };

    let postgres = PostgresClient::new(&postgres_settings, config.postgres_pool_size)?;
    postgres.ping().await.context("datastore unreachable")?;

    let procedures = Arc::new(PostgresProcedureClient::new(
        postgres,
        ProcedureClientConfig {
            call_timeout: Duration::from_secs(config.procedure_timeout_secs),
            binding_fanout_limit: config.binding_fanout_limit,
        },
    ));

    let ca = match &config.mqtt_ca_path {
        Some(path) => Some(std::fs::read(path).with_context(|| format!("reading CA {}", path))?),
        None => None,
    };
    let (mqtt_client, eventloop) = build_mqtt_client(&MqttSettings {
        broker_url: config.mqtt_url.clone(),
        client_id: config.mqtt_client_id.clone(),
        username: config.mqtt_username.clone(),
        password: config.mqtt_password.clone(),
        ca,
        keepalive: Duration::from_secs(config.mqtt_keepalive_secs),
    })?;
    let publisher = Arc::new(MqttPublisher::new(mqtt_client.clone()));

    let idempotency = IdempotencyCache::new(Duration::from_secs(config.idempotency_ttl_secs));
    let gateway = Arc::new(CommandGateway::new(
        procedures,
        publisher,
        idempotency.clone(),
    )?);

    let token = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let sweeper = idempotency.spawn_sweeper(
        Duration::from_secs(config.idempotency_sweep_secs),
        token.clone(),
    );

    tasks.spawn(run_subscriber(
        mqtt_client,
        eventloop,
        Arc::clone(&gateway),
        token.clone(),
    ));

    let listener = HomeworkChangeListener::new(
        ChangeListenerConfig {
            postgres: postgres_settings,
            channel: config.change_channel.clone(),
            retry_delay: Duration::from_secs(config.change_retry_delay_secs),
        },
        Arc::clone(&gateway) as Arc<dyn HomeworkChangeHandler>,
    );
    tasks.spawn(listener.run(token.clone()));

    wait_for_shutdown(&token).await;

    // Drain: let the subscriber disconnect and in-flight handlers finish.
    let drained = tokio::time::timeout(Duration::from_secs(config.drain_timeout_secs), async {
        while tasks.join_next().await.is_some() {}
        let _ = sweeper.await;
    })
    .await;
    if drained.is_err() {
        error!(
            timeout_secs = config.drain_timeout_secs,
            "drain timed out, aborting remaining tasks"
        );
    }

    info!("gateway stopped");
    Ok(())
}

async fn wait_for_shutdown(token: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received shutdown signal"),
            _ = sigterm.recv() => info!("received SIGTERM signal"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received shutdown signal");
    }

    token.cancel();
}
