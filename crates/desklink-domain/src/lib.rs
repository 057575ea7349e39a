//! Domain types and trait seams for the desklink command gateway.
//!
//! The gateway bridges an MQTT broker to a datastore exposed as named stored
//! procedures. This crate holds the message types, the procedure-client and
//! broker-publisher seams, and the change-event types; it has no knowledge of
//! MQTT or PostgreSQL.

pub mod change;
pub mod command;
pub mod error;
pub mod procedures;
pub mod publisher;

pub use change::{HomeworkChangeEvent, HomeworkChangeHandler};
pub use command::{HomeworkAction, HomeworkCommand};
pub use error::{DomainError, DomainResult};
pub use procedures::{
    BindDevice, DeviceRef, HomeworkRef, HomeworkStart, PresenceRecord, ProcedureClient, StudentRef,
};
pub use publisher::BrokerPublisher;

#[cfg(any(test, feature = "testing"))]
pub use change::MockHomeworkChangeHandler;
#[cfg(any(test, feature = "testing"))]
pub use procedures::MockProcedureClient;
#[cfg(any(test, feature = "testing"))]
pub use publisher::MockBrokerPublisher;
