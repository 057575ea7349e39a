use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // MQTT configuration
    /// Broker URL (mqtt://, mqtts://, tcp:// or bare host:port)
    #[serde(default = "default_mqtt_url")]
    pub mqtt_url: String,

    /// Broker username
    #[serde(default)]
    pub mqtt_username: Option<String>,

    /// Broker password
    #[serde(default)]
    pub mqtt_password: Option<String>,

    /// MQTT client id
    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    /// Path to the broker's CA certificate (required for mqtts://)
    #[serde(default)]
    pub mqtt_ca_path: Option<String>,

    /// MQTT keepalive in seconds
    #[serde(default = "default_mqtt_keepalive_secs")]
    pub mqtt_keepalive_secs: u64,

    // PostgreSQL configuration
    /// PostgreSQL host
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    /// PostgreSQL port
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    /// PostgreSQL database name
    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    /// PostgreSQL username
    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    /// PostgreSQL password
    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    /// Connection pool size
    #[serde(default = "default_postgres_pool_size")]
    pub postgres_pool_size: usize,

    // Gateway behavior
    /// Upper bound on any single stored-procedure call, in seconds
    #[serde(default = "default_procedure_timeout_secs")]
    pub procedure_timeout_secs: u64,

    /// Binding-directory result bound for fan-out
    #[serde(default = "default_binding_fanout_limit")]
    pub binding_fanout_limit: i64,

    /// Idempotency key retention window in seconds
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Idempotency sweep interval in seconds
    #[serde(default = "default_idempotency_sweep_secs")]
    pub idempotency_sweep_secs: u64,

    // Change listener
    /// NOTIFY channel raised by the homework-state trigger
    #[serde(default = "default_change_channel")]
    pub change_channel: String,

    /// Delay before re-establishing a lost LISTEN connection, in seconds
    #[serde(default = "default_change_retry_delay_secs")]
    pub change_retry_delay_secs: u64,

    /// Shutdown drain window in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

// MQTT defaults
fn default_mqtt_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    format!("desklink-gateway-{}", uuid::Uuid::new_v4())
}

fn default_mqtt_keepalive_secs() -> u64 {
    30
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "desklink".to_string()
}

fn default_postgres_username() -> String {
    "desklink".to_string()
}

fn default_postgres_password() -> String {
    "desklink".to_string()
}

fn default_postgres_pool_size() -> usize {
    5
}

// Gateway defaults
fn default_procedure_timeout_secs() -> u64 {
    10
}

fn default_binding_fanout_limit() -> i64 {
    10
}

fn default_idempotency_ttl_secs() -> u64 {
    600
}

fn default_idempotency_sweep_secs() -> u64 {
    60
}

// Change listener defaults
fn default_change_channel() -> String {
    "homework_state_changed".to_string()
}

fn default_change_retry_delay_secs() -> u64 {
    5
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("DESKLINK"))
            .build()?
            .try_deserialize()
    }
}
