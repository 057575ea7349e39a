//! PostgreSQL side of the desklink gateway: the pooled client, the stored
//! procedure façade, and the LISTEN/NOTIFY change listener.

pub mod client;
pub mod listener;
pub mod procedure_client;

pub use client::{PostgresClient, PostgresSettings};
pub use listener::{ChangeListenerConfig, HomeworkChangeListener};
pub use procedure_client::{PostgresProcedureClient, ProcedureClientConfig};
