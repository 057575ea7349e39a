use crate::error::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// `(academy_id, item_id)` scope for homework procedures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeworkRef {
    pub academy_id: String,
    pub item_id: String,
}

/// `start_homework` additionally names the student the item is started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeworkStart {
    pub academy_id: String,
    pub student_id: String,
    pub item_id: String,
}

/// `(academy_id, student_id)` scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRef {
    pub academy_id: String,
    pub student_id: String,
}

/// `(academy_id, device_id)` scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRef {
    pub academy_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindDevice {
    pub academy_id: String,
    pub device_id: String,
    pub student_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub academy_id: String,
    pub device_id: String,
    pub online: bool,
    pub at: DateTime<Utc>,
}

/// Typed façade over the datastore's stored procedures.
///
/// Each method is a single atomic remote operation; the gateway never
/// composes multi-step transactions on top of this. Listing procedures return
/// opaque rows; the gateway forwards them without inspecting their shape.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProcedureClient: Send + Sync {
    async fn start_homework(&self, params: HomeworkStart) -> DomainResult<()>;
    async fn pause_homework(&self, params: HomeworkRef) -> DomainResult<()>;
    async fn submit_homework(&self, params: HomeworkRef) -> DomainResult<()>;
    async fn confirm_homework(&self, params: HomeworkRef) -> DomainResult<()>;
    async fn wait_homework(&self, params: HomeworkRef) -> DomainResult<()>;
    async fn complete_homework(&self, params: HomeworkRef) -> DomainResult<()>;
    async fn pause_all_for_student(&self, params: StudentRef) -> DomainResult<()>;

    async fn bind_device(&self, params: BindDevice) -> DomainResult<()>;
    async fn unbind_device(&self, params: DeviceRef) -> DomainResult<()>;
    async fn unbind_by_student(&self, params: StudentRef) -> DomainResult<()>;

    async fn list_students_today(&self, academy_id: &str) -> DomainResult<Vec<serde_json::Value>>;
    async fn list_homeworks_for_student(
        &self,
        params: StudentRef,
    ) -> DomainResult<Vec<serde_json::Value>>;
    async fn get_student_info(&self, params: StudentRef)
        -> DomainResult<Option<serde_json::Value>>;

    async fn record_arrival(&self, params: StudentRef) -> DomainResult<()>;
    async fn record_departure(&self, params: StudentRef) -> DomainResult<()>;
    async fn record_presence(&self, params: PresenceRecord) -> DomainResult<()>;

    /// Devices currently bound to the student. Implementations bound the
    /// result size as a fan-out safety valve.
    async fn active_bindings_for(&self, params: StudentRef) -> DomainResult<Vec<String>>;
}
