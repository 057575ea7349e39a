use crate::error::DomainResult;
use async_trait::async_trait;

/// Outbound seam to the broker.
///
/// Implementations publish with QoS 1, retain false. Handlers depend on this
/// trait so ack and fan-out plumbing is testable without a live broker.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    async fn publish_json(&self, topic: &str, payload: serde_json::Value) -> DomainResult<()>;
}
