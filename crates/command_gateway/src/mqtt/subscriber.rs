use crate::gateway::CommandGateway;
use crate::mqtt::topic::SUBSCRIPTION_FILTERS;
use desklink_domain::{DomainError, DomainResult};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const EVENT_CHANNEL_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker connection parameters. The CA bytes are loaded by the caller;
/// `mqtts://` URLs require one (deployments pin a private CA).
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca: Option<Vec<u8>>,
    pub keepalive: Duration,
}

/// Build the shared MQTT client and its event loop from settings.
pub fn build_mqtt_client(settings: &MqttSettings) -> DomainResult<(AsyncClient, EventLoop)> {
    let (tls, host, port) = parse_broker_url(&settings.broker_url)?;

    let mut options = MqttOptions::new(&settings.client_id, host, port);
    options.set_keep_alive(settings.keepalive);
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
        options.set_credentials(username, password);
    }
    if tls {
        let ca = settings.ca.clone().ok_or_else(|| {
            DomainError::InvalidBrokerConfig("mqtts:// requires a CA certificate".to_string())
        })?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(AsyncClient::new(options, EVENT_CHANNEL_CAPACITY))
}

/// Run the broker read loop until cancelled.
///
/// Each inbound publish is handled on its own task so in-flight remote calls
/// never block the read loop; the broker may deliver the next message before
/// the previous handler finishes. Subscriptions are (re)established on every
/// ConnAck, which covers the initial connect and every reconnect.
pub async fn run_subscriber(
    client: AsyncClient,
    mut eventloop: EventLoop,
    gateway: Arc<CommandGateway>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = client.disconnect().await;
                info!("mqtt subscriber stopped");
                return;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    if let Err(e) = subscribe_all(&client).await {
                        error!(error = %e, "subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let gateway = Arc::clone(&gateway);
                    tokio::spawn(async move {
                        gateway.handle_publish(&publish.topic, &publish.payload).await;
                    });
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("broker disconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT event loop error");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
}

async fn subscribe_all(client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
    for filter in SUBSCRIPTION_FILTERS {
        client.subscribe(filter, QoS::AtLeastOnce).await?;
        info!(filter, "subscribed");
    }
    Ok(())
}

/// Parse a broker URL in the form `mqtt://host:port`, `mqtts://host:port`,
/// `tcp://host:port`, or bare `host[:port]`. Returns whether TLS is wanted
/// plus host and port.
fn parse_broker_url(url: &str) -> DomainResult<(bool, String, u16)> {
    let (tls, rest, default_port) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (true, rest, 8883)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (false, rest, 1883)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (false, rest, 1883)
    } else {
        (false, url, 1883)
    };

    let parts: Vec<&str> = rest.split(':').collect();
    match parts.len() {
        1 if !parts[0].is_empty() => Ok((tls, parts[0].to_string(), default_port)),
        2 => {
            let port = parts[1].parse::<u16>().map_err(|_| {
                DomainError::InvalidBrokerConfig(format!("invalid port in broker URL: {}", parts[1]))
            })?;
            Ok((tls, parts[0].to_string(), port))
        }
        _ => Err(DomainError::InvalidBrokerConfig(format!(
            "invalid broker URL: {}",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url_with_port() {
        let (tls, host, port) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert!(!tls);
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_tls() {
        let (tls, host, port) = parse_broker_url("mqtts://broker.example.com:8883").unwrap();
        assert!(tls);
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 8883);
    }

    #[test]
    fn test_parse_broker_url_tls_default_port() {
        let (tls, host, port) = parse_broker_url("mqtts://broker.example.com").unwrap();
        assert!(tls);
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 8883);
    }

    #[test]
    fn test_parse_broker_url_without_scheme() {
        let (tls, host, port) = parse_broker_url("broker.local:1884").unwrap();
        assert!(!tls);
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1884);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let (tls, host, port) = parse_broker_url("tcp://broker.local").unwrap();
        assert!(!tls);
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_rejects_garbage() {
        assert!(parse_broker_url("").is_err());
        assert!(parse_broker_url("mqtt://host:port:extra").is_err());
        assert!(parse_broker_url("mqtt://host:not-a-port").is_err());
    }

    #[test]
    fn test_build_client_requires_ca_for_tls() {
        let settings = MqttSettings {
            broker_url: "mqtts://broker.example.com".to_string(),
            client_id: "desklink-test".to_string(),
            username: None,
            password: None,
            ca: None,
            keepalive: Duration::from_secs(30),
        };

        assert!(build_mqtt_client(&settings).is_err());
    }
}
