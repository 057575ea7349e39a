//! End-to-end handler flows against mocked datastore and broker seams.

use chrono::{TimeZone, Utc};
use command_gateway::{CommandGateway, IdempotencyCache};
use desklink_domain::{
    BindDevice, HomeworkChangeEvent, HomeworkChangeHandler, HomeworkStart, MockBrokerPublisher,
    MockProcedureClient, PresenceRecord, StudentRef,
};
use mockall::Sequence;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn make_gateway(procedures: MockProcedureClient, publisher: MockBrokerPublisher) -> CommandGateway {
    CommandGateway::new(
        Arc::new(procedures),
        Arc::new(publisher),
        IdempotencyCache::new(Duration::from_secs(600)),
    )
    .unwrap()
}

fn start_command(idempotency_key: Option<&str>) -> Vec<u8> {
    let mut payload = json!({
        "action": "start",
        "academy_id": "A1",
        "student_id": "S1",
        "item_id": "I1",
        "at": "2024-01-01T00:00:00Z",
    });
    if let Some(key) = idempotency_key {
        payload["idempotency_key"] = json!(key);
    }
    serde_json::to_vec(&payload).unwrap()
}

const START_TOPIC: &str = "academies/A1/students/S1/homework/I1/command";

#[tokio::test]
async fn start_command_invokes_procedure_and_acks() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_start_homework()
        .withf(|params: &HomeworkStart| {
            params.academy_id == "A1" && params.student_id == "S1" && params.item_id == "I1"
        })
        .times(1)
        .returning(|_| Ok(()));
    procedures
        .expect_active_bindings_for()
        .times(1)
        .returning(|_| Ok(vec![]));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/ack/K1" && *payload == json!({ "ok": true, "action": "start" })
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(START_TOPIC, &start_command(Some("K1")))
        .await;
}

#[tokio::test]
async fn duplicate_idempotency_key_applies_once() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_start_homework()
        .times(1)
        .returning(|_| Ok(()));
    procedures
        .expect_active_bindings_for()
        .times(1)
        .returning(|_| Ok(vec![]));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, _: &Value| topic == "academies/A1/ack/K1")
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    let payload = start_command(Some("K1"));
    gateway.handle_publish(START_TOPIC, &payload).await;
    gateway.handle_publish(START_TOPIC, &payload).await;
}

#[tokio::test]
async fn missing_idempotency_key_is_never_deduplicated() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_start_homework()
        .times(2)
        .returning(|_| Ok(()));
    procedures
        .expect_active_bindings_for()
        .times(2)
        .returning(|_| Ok(vec![]));

    // No idempotency key, no ack.
    let publisher = MockBrokerPublisher::new();

    let gateway = make_gateway(procedures, publisher);
    let payload = start_command(None);
    gateway.handle_publish(START_TOPIC, &payload).await;
    gateway.handle_publish(START_TOPIC, &payload).await;
}

#[tokio::test]
async fn schema_failure_blocks_procedures_and_acks() {
    let gateway = make_gateway(MockProcedureClient::new(), MockBrokerPublisher::new());

    // item_id missing: fails the schema gate before any side effect.
    let payload = json!({
        "action": "start",
        "academy_id": "A1",
        "idempotency_key": "K1",
        "at": "2024-01-01T00:00:00Z",
    });
    gateway
        .handle_publish(START_TOPIC, &serde_json::to_vec(&payload).unwrap())
        .await;
}

#[tokio::test]
async fn unparseable_payload_is_dropped() {
    let gateway = make_gateway(MockProcedureClient::new(), MockBrokerPublisher::new());
    gateway.handle_publish(START_TOPIC, b"not json").await;
}

#[tokio::test]
async fn unrecognized_topic_never_triggers_a_handler() {
    let gateway = make_gateway(MockProcedureClient::new(), MockBrokerPublisher::new());
    gateway
        .handle_publish(
            "academies/A1/devices/D1/homeworks",
            &serde_json::to_vec(&json!({ "action": "bind" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn procedure_failure_still_acks_with_error() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_start_homework()
        .times(1)
        .returning(|_| Err(anyhow::anyhow!("relation does not exist").into()));
    procedures
        .expect_active_bindings_for()
        .times(1)
        .returning(|_| Ok(vec![]));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/ack/K1"
                && payload["ok"] == false
                && payload["action"] == "start"
                && payload["error"].is_string()
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(START_TOPIC, &start_command(Some("K1")))
        .await;
}

#[tokio::test]
async fn homework_command_refreshes_bound_devices() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_start_homework()
        .times(1)
        .returning(|_| Ok(()));
    procedures
        .expect_active_bindings_for()
        .withf(|scope: &StudentRef| scope.academy_id == "A1" && scope.student_id == "S1")
        .times(1)
        .returning(|_| Ok(vec!["D1".to_string()]));
    procedures
        .expect_list_homeworks_for_student()
        .times(1)
        .returning(|_| Ok(vec![json!({ "item_id": "I1", "phase": "started" })]));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, _: &Value| topic == "academies/A1/ack/K1")
        .times(1)
        .returning(|_, _| Ok(()));
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/homeworks" && payload["items"].is_array()
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(START_TOPIC, &start_command(Some("K1")))
        .await;
}

#[tokio::test]
async fn list_today_publishes_listing_and_ack() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_list_students_today()
        .withf(|academy_id: &str| academy_id == "A1")
        .times(1)
        .returning(|_| {
            Ok(vec![
                json!({ "student_id": "S1", "name": "Kim" }),
                json!({ "student_id": "S2", "name": "Lee" }),
            ])
        });

    let mut publisher = MockBrokerPublisher::new();
    let mut seq = Sequence::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/students_today"
                && payload["students"].as_array().map(Vec::len) == Some(2)
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack"
                && *payload == json!({ "ok": true, "action": "list_today", "count": 2 })
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "list_today" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn list_today_failure_logs_without_ack() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_list_students_today()
        .times(1)
        .returning(|_| Err(anyhow::anyhow!("timeout").into()));

    let gateway = make_gateway(procedures, MockBrokerPublisher::new());
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "list_today" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn bind_publishes_homeworks_before_ack() {
    let mut seq = Sequence::new();

    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_bind_device()
        .withf(|params: &BindDevice| {
            params.academy_id == "A1" && params.device_id == "D1" && params.student_id == "S1"
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    procedures
        .expect_record_arrival()
        .withf(|scope: &StudentRef| scope.academy_id == "A1" && scope.student_id == "S1")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    procedures
        .expect_list_homeworks_for_student()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(vec![json!({ "item_id": "I1" })]));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/homeworks"
                && payload["items"].as_array().map(Vec::len) == Some(1)
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack"
                && payload["ok"] == true
                && payload["action"] == "bind"
                && payload["student_id"] == "S1"
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "bind", "student_id": "S1" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn bind_without_student_acks_failure() {
    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack"
                && payload["ok"] == false
                && payload["action"] == "bind"
                && payload["error"].is_string()
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(MockProcedureClient::new(), publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "bind" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn unbind_by_student_records_departure_before_unbind() {
    let mut seq = Sequence::new();

    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_record_departure()
        .withf(|scope: &StudentRef| scope.academy_id == "A1" && scope.student_id == "S1")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    procedures
        .expect_unbind_by_student()
        .withf(|scope: &StudentRef| scope.academy_id == "A1" && scope.student_id == "S1")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack"
                && payload["ok"] == true
                && payload["action"] == "unbind_by_student"
                && payload["student_id"] == "S1"
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "unbind_by_student", "student_id": "S1" }))
                .unwrap(),
        )
        .await;
}

#[tokio::test]
async fn unbind_with_known_student_records_departure_first() {
    let mut seq = Sequence::new();

    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_record_departure()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    procedures
        .expect_unbind_device()
        .withf(|device: &desklink_domain::DeviceRef| {
            device.academy_id == "A1" && device.device_id == "D1"
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack" && payload["action"] == "unbind"
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "unbind", "student_id": "S1" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn unbind_without_student_skips_departure() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_unbind_device()
        .times(1)
        .returning(|_| Ok(()));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack" && payload["ok"] == true
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "unbind" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn student_info_publishes_row_and_ack() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_get_student_info()
        .times(1)
        .returning(|_| Ok(Some(json!({ "student_id": "S1", "name": "Kim" }))));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/student_info"
                && payload["student"]["name"] == "Kim"
        })
        .times(1)
        .returning(|_, _| Ok(()));
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            topic == "academies/A1/devices/D1/ack" && payload["action"] == "student_info"
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "student_info", "student_id": "S1" }))
                .unwrap(),
        )
        .await;
}

#[tokio::test]
async fn unknown_device_action_is_dropped() {
    let gateway = make_gateway(MockProcedureClient::new(), MockBrokerPublisher::new());
    gateway
        .handle_publish(
            "academies/A1/devices/D1/command",
            &serde_json::to_vec(&json!({ "action": "reboot" })).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn presence_records_without_ack() {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_record_presence()
        .withf(move |record: &PresenceRecord| {
            record.academy_id == "A1" && record.device_id == "D1" && record.online && record.at == at
        })
        .times(1)
        .returning(|_| Ok(()));

    // No ack for presence: fire-and-forget telemetry.
    let gateway = make_gateway(procedures, MockBrokerPublisher::new());
    gateway
        .handle_publish(
            "academies/A1/devices/D1/presence",
            &serde_json::to_vec(&json!({ "online": true, "at": "2024-01-01T00:00:00Z" }))
                .unwrap(),
        )
        .await;
}

#[tokio::test]
async fn presence_defaults_to_offline() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_record_presence()
        .withf(|record: &PresenceRecord| !record.online)
        .times(1)
        .returning(|_| Ok(()));

    let gateway = make_gateway(procedures, MockBrokerPublisher::new());
    gateway
        .handle_publish(
            "academies/A1/devices/D1/presence",
            &serde_json::to_vec(&json!({})).unwrap(),
        )
        .await;
}

#[tokio::test]
async fn change_event_fans_out_to_all_bound_devices() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_active_bindings_for()
        .withf(|scope: &StudentRef| scope.academy_id == "A1" && scope.student_id == "S1")
        .times(1)
        .returning(|_| Ok(vec!["D1".to_string(), "D2".to_string()]));
    procedures
        .expect_list_homeworks_for_student()
        .times(1)
        .returning(|_| Ok(vec![json!({ "item_id": "I1" })]));

    let mut publisher = MockBrokerPublisher::new();
    publisher
        .expect_publish_json()
        .withf(|topic: &str, payload: &Value| {
            (topic == "academies/A1/devices/D1/homeworks"
                || topic == "academies/A1/devices/D2/homeworks")
                && payload["items"].is_array()
        })
        .times(2)
        .returning(|_, _| Ok(()));

    let gateway = make_gateway(procedures, publisher);
    gateway
        .on_homework_change(HomeworkChangeEvent {
            academy_id: "A1".to_string(),
            student_id: "S1".to_string(),
        })
        .await;
}

#[tokio::test]
async fn change_event_with_no_bindings_is_silent() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_active_bindings_for()
        .times(1)
        .returning(|_| Ok(vec![]));

    let gateway = make_gateway(procedures, MockBrokerPublisher::new());
    gateway
        .on_homework_change(HomeworkChangeEvent {
            academy_id: "A1".to_string(),
            student_id: "S1".to_string(),
        })
        .await;
}

#[tokio::test]
async fn fan_out_lookup_failure_never_escalates() {
    let mut procedures = MockProcedureClient::new();
    procedures
        .expect_active_bindings_for()
        .times(1)
        .returning(|_| Err(anyhow::anyhow!("lookup failed").into()));

    let gateway = make_gateway(procedures, MockBrokerPublisher::new());
    gateway
        .on_homework_change(HomeworkChangeEvent {
            academy_id: "A1".to_string(),
            student_id: "S1".to_string(),
        })
        .await;
}
