use async_trait::async_trait;
use serde::Deserialize;

/// Row-level change on the homework-state table, as carried by the
/// datastore's notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HomeworkChangeEvent {
    pub academy_id: String,
    pub student_id: String,
}

/// Consumer of homework-state changes. The change listener calls this for
/// every event; implementations must not block and must swallow their own
/// failures (fan-out is a convenience signal, not the source of truth).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait HomeworkChangeHandler: Send + Sync {
    async fn on_homework_change(&self, event: HomeworkChangeEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_from_notification_payload() {
        let event: HomeworkChangeEvent =
            serde_json::from_str(r#"{"academy_id":"A1","student_id":"S1"}"#).unwrap();
        assert_eq!(event.academy_id, "A1");
        assert_eq!(event.student_id, "S1");
    }

    #[test]
    fn test_event_requires_both_ids() {
        assert!(serde_json::from_str::<HomeworkChangeEvent>(r#"{"academy_id":"A1"}"#).is_err());
    }
}
