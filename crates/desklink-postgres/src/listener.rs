use crate::client::PostgresSettings;
use anyhow::Result;
use desklink_domain::{HomeworkChangeEvent, HomeworkChangeHandler};
use futures_util::{stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ChangeListenerConfig {
    pub postgres: PostgresSettings,
    /// NOTIFY channel raised by the homework-state table trigger.
    pub channel: String,
    pub retry_delay: Duration,
}

/// Subscribes to homework-state change notifications and hands each event to
/// the gateway's fan-out path.
///
/// Runs on its own dedicated connection (LISTEN is session-scoped, so the
/// pooled client cannot carry it). Connection loss is retried indefinitely
/// with a fixed delay; the command path does not depend on this listener.
pub struct HomeworkChangeListener {
    config: ChangeListenerConfig,
    handler: Arc<dyn HomeworkChangeHandler>,
}

impl HomeworkChangeListener {
    pub fn new(config: ChangeListenerConfig, handler: Arc<dyn HomeworkChangeHandler>) -> Self {
        Self { config, handler }
    }

    /// Run until cancelled, reconnecting on failure.
    pub async fn run(self, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }

            match self.listen_once(&token).await {
                Ok(()) => {
                    // Clean exit (cancellation)
                    break;
                }
                Err(e) => {
                    error!(error = %e, "change listener connection error");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }

        info!("change listener stopped");
    }

    /// Run a single LISTEN session until cancellation or connection loss.
    async fn listen_once(&self, token: &CancellationToken) -> Result<()> {
        let (client, mut connection) =
            tokio_postgres::connect(&self.config.postgres.connection_string(), NoTls).await?;

        // The connection only makes progress while polled; drive it on its
        // own task and forward notifications through a channel.
        let (tx, mut rx) = mpsc::channel::<Notification>(64);
        let driver = tokio::spawn(async move {
            let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "change notification connection lost");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", self.config.channel))
            .await?;
        info!(channel = %self.config.channel, "listening for homework state changes");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    driver.abort();
                    return Ok(());
                }
                maybe = rx.recv() => match maybe {
                    Some(notification) => {
                        self.dispatch(notification.channel(), notification.payload()).await
                    }
                    None => anyhow::bail!("change notification stream ended"),
                }
            }
        }
    }

    async fn dispatch(&self, channel: &str, payload: &str) {
        let event = match parse_change_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel, error = %e, "ignoring malformed change notification");
                return;
            }
        };

        self.handler.on_homework_change(event).await;
    }
}

fn parse_change_payload(payload: &str) -> Result<HomeworkChangeEvent> {
    Ok(serde_json::from_str(payload)?)
}
