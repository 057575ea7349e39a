use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Homework command action, one stored procedure per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeworkAction {
    Start,
    Pause,
    Submit,
    Confirm,
    Wait,
    Complete,
    PauseAll,
}

impl HomeworkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HomeworkAction::Start => "start",
            HomeworkAction::Pause => "pause",
            HomeworkAction::Submit => "submit",
            HomeworkAction::Confirm => "confirm",
            HomeworkAction::Wait => "wait",
            HomeworkAction::Complete => "complete",
            HomeworkAction::PauseAll => "pause_all",
        }
    }
}

/// Homework command payload, deserialized only after the JSON schema gate has
/// passed. The academy/student/item ids used for procedure dispatch come from
/// the topic, not from this payload.
#[derive(Debug, Clone, Deserialize)]
pub struct HomeworkCommand {
    pub action: HomeworkAction,
    pub academy_id: String,
    #[serde(default)]
    pub student_id: Option<String>,
    pub item_id: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    pub at: DateTime<Utc>,
}
