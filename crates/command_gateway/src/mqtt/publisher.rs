use async_trait::async_trait;
use desklink_domain::{BrokerPublisher, DomainError, DomainResult};
use rumqttc::{AsyncClient, QoS};

/// Broker publisher over the shared MQTT client. All publishes are QoS 1,
/// retain false.
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BrokerPublisher for MqttPublisher {
    async fn publish_json(&self, topic: &str, payload: serde_json::Value) -> DomainResult<()> {
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| DomainError::PublishError(topic.to_string(), e.to_string()))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| DomainError::PublishError(topic.to_string(), e.to_string()))
    }
}
