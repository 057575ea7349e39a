use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidationFailed(String),

    #[error("Invalid broker configuration: {0}")]
    InvalidBrokerConfig(String),

    #[error("Procedure {0} timed out")]
    ProcedureTimeout(String),

    #[error("Publish to {0} failed: {1}")]
    PublishError(String, String),

    #[error("Change listener error: {0}")]
    ListenerError(String),

    #[error("Datastore error: {0}")]
    DatastoreError(#[from] anyhow::Error),
}
