//! The desklink command gateway core: topic routing, payload validation,
//! idempotent command application, binding lifecycle side effects, and
//! change-triggered fan-out.

pub mod gateway;
pub mod idempotency;
pub mod mqtt;
pub mod schema;

pub use gateway::CommandGateway;
pub use idempotency::IdempotencyCache;
pub use mqtt::publisher::MqttPublisher;
pub use mqtt::subscriber::{build_mqtt_client, run_subscriber, MqttSettings};
pub use mqtt::topic::{route_topic, Route};
pub use schema::HomeworkCommandValidator;
