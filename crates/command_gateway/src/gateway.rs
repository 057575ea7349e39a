//! The gateway state machine: one handler invocation per broker delivery,
//! nothing escapes the handler boundary.

use crate::idempotency::IdempotencyCache;
use crate::mqtt::topic::{self, Route};
use crate::schema::HomeworkCommandValidator;
use async_trait::async_trait;
use chrono::Utc;
use desklink_domain::{
    BindDevice, BrokerPublisher, DeviceRef, DomainResult, HomeworkAction, HomeworkChangeEvent,
    HomeworkChangeHandler, HomeworkCommand, HomeworkRef, HomeworkStart, PresenceRecord,
    ProcedureClient, StudentRef,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Bridges the broker to the datastore: routes inbound messages, applies
/// commands exactly once per idempotency key, keeps binding side effects
/// ordered, and fans listings out to bound devices.
pub struct CommandGateway {
    procedures: Arc<dyn ProcedureClient>,
    publisher: Arc<dyn BrokerPublisher>,
    idempotency: IdempotencyCache,
    validator: HomeworkCommandValidator,
}

impl CommandGateway {
    pub fn new(
        procedures: Arc<dyn ProcedureClient>,
        publisher: Arc<dyn BrokerPublisher>,
        idempotency: IdempotencyCache,
    ) -> DomainResult<Self> {
        Ok(Self {
            procedures,
            publisher,
            idempotency,
            validator: HomeworkCommandValidator::new()?,
        })
    }

    /// Handle one broker delivery. This is the handler boundary: every
    /// failure is logged here and none is allowed to propagate.
    #[instrument(name = "gateway_message", skip_all, fields(topic = %topic))]
    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "dropping unparseable payload");
                return;
            }
        };

        match topic::route_topic(topic) {
            Route::HomeworkCommand {
                academy_id,
                student_id,
                item_id,
            } => {
                self.handle_homework_command(&academy_id, &student_id, &item_id, value)
                    .await
            }
            Route::DeviceCommand {
                academy_id,
                device_id,
            } => self.handle_device_command(&academy_id, &device_id, &value).await,
            Route::DevicePresence {
                academy_id,
                device_id,
            } => self.handle_presence(&academy_id, &device_id, &value).await,
            Route::Unrecognized => debug!("dropping unrecognized topic"),
        }
    }

    /// receive → validate → dedup-check → dispatch → ack → optimistic
    /// refresh. The ids driving dispatch come from the topic.
    async fn handle_homework_command(
        &self,
        academy_id: &str,
        student_id: &str,
        item_id: &str,
        payload: Value,
    ) {
        if let Err(e) = self.validator.validate(&payload) {
            warn!(error = %e, "invalid homework command payload");
            return;
        }
        let command: HomeworkCommand = match serde_json::from_value(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "homework command failed to deserialize");
                return;
            }
        };

        let action = command.action;
        info!(
            action = action.as_str(),
            academy_id, student_id, item_id, "received homework command"
        );

        if let Some(key) = &command.idempotency_key {
            if !self.idempotency.mark(key).await {
                info!(idempotency_key = %key, "skipping duplicate command");
                return;
            }
        }

        let result = self
            .dispatch_homework(action, academy_id, student_id, item_id)
            .await;
        if let Err(e) = &result {
            error!(action = action.as_str(), error = %e, "homework procedure failed");
        }

        // The ack topic is keyed by the idempotency key; callers that omit
        // one get no ack.
        match &command.idempotency_key {
            Some(key) => {
                let mut ack = json!({ "ok": result.is_ok(), "action": action.as_str() });
                if let Err(e) = &result {
                    ack["error"] = json!(e.to_string());
                }
                let ack_topic = topic::homework_ack_topic(academy_id, key);
                if let Err(e) = self.publisher.publish_json(&ack_topic, ack).await {
                    warn!(error = %e, "failed to publish command ack");
                }
            }
            None => debug!("command carries no idempotency key, skipping ack"),
        }

        // Optimistic refresh; redundant with the change listener, and
        // harmless when both fire for the same change.
        self.fan_out_listing(academy_id, student_id).await;
    }

    async fn dispatch_homework(
        &self,
        action: HomeworkAction,
        academy_id: &str,
        student_id: &str,
        item_id: &str,
    ) -> DomainResult<()> {
        let item = HomeworkRef {
            academy_id: academy_id.to_string(),
            item_id: item_id.to_string(),
        };

        match action {
            HomeworkAction::Start => {
                self.procedures
                    .start_homework(HomeworkStart {
                        academy_id: academy_id.to_string(),
                        student_id: student_id.to_string(),
                        item_id: item_id.to_string(),
                    })
                    .await
            }
            HomeworkAction::Pause => self.procedures.pause_homework(item).await,
            HomeworkAction::Submit => self.procedures.submit_homework(item).await,
            HomeworkAction::Confirm => self.procedures.confirm_homework(item).await,
            HomeworkAction::Wait => self.procedures.wait_homework(item).await,
            HomeworkAction::Complete => self.procedures.complete_homework(item).await,
            HomeworkAction::PauseAll => {
                self.procedures
                    .pause_all_for_student(StudentRef {
                        academy_id: academy_id.to_string(),
                        student_id: student_id.to_string(),
                    })
                    .await
            }
        }
    }

    /// Device commands are loosely-typed control messages; each action is a
    /// standalone transition.
    async fn handle_device_command(&self, academy_id: &str, device_id: &str, payload: &Value) {
        let Some(action) = payload.get("action").and_then(Value::as_str) else {
            warn!("device command missing action");
            return;
        };
        let student_id = payload
            .get("student_id")
            .and_then(Value::as_str)
            .map(String::from);

        info!(action, academy_id, device_id, "received device command");

        match action {
            "bind" => self.handle_bind(academy_id, device_id, student_id).await,
            "unbind" => self.handle_unbind(academy_id, device_id, student_id).await,
            "unbind_by_student" => {
                self.handle_unbind_by_student(academy_id, device_id, student_id)
                    .await
            }
            "list_today" => self.handle_list_today(academy_id, device_id).await,
            "list_homeworks" => {
                self.handle_list_homeworks(academy_id, device_id, student_id)
                    .await
            }
            "student_info" => {
                self.handle_student_info(academy_id, device_id, student_id)
                    .await
            }
            other => debug!(action = other, "dropping unknown device command"),
        }
    }

    async fn handle_bind(&self, academy_id: &str, device_id: &str, student_id: Option<String>) {
        let Some(student_id) = student_id else {
            self.publish_device_ack(
                academy_id,
                device_id,
                json!({ "ok": false, "action": "bind", "error": "missing student_id" }),
            )
            .await;
            return;
        };

        let bind_result = self
            .procedures
            .bind_device(BindDevice {
                academy_id: academy_id.to_string(),
                device_id: device_id.to_string(),
                student_id: student_id.clone(),
            })
            .await;
        if let Err(e) = &bind_result {
            error!(error = %e, "bind procedure failed");
        }

        let scope = StudentRef {
            academy_id: academy_id.to_string(),
            student_id: student_id.clone(),
        };

        // The device now belongs to the student: record attendance, then
        // hand it the listing it will render.
        if bind_result.is_ok() {
            if let Err(e) = self.procedures.record_arrival(scope.clone()).await {
                warn!(error = %e, "arrival recording failed");
            }
        }

        let listing = self.procedures.list_homeworks_for_student(scope).await;
        let listing_error = listing.as_ref().err().map(ToString::to_string);
        if let Some(e) = &listing_error {
            error!(error = %e, "homework listing failed after bind");
        }
        let items = listing.unwrap_or_default();

        if let Err(e) = self
            .publisher
            .publish_json(
                &topic::homeworks_topic(academy_id, device_id),
                json!({ "items": items }),
            )
            .await
        {
            warn!(error = %e, "failed to publish homework listing after bind");
        }

        let mut ack = json!({
            "ok": bind_result.is_ok() && listing_error.is_none(),
            "action": "bind",
            "student_id": student_id,
        });
        if let Some(message) = bind_result.err().map(|e| e.to_string()).or(listing_error) {
            ack["error"] = json!(message);
        }
        self.publish_device_ack(academy_id, device_id, ack).await;
    }

    async fn handle_unbind(&self, academy_id: &str, device_id: &str, student_id: Option<String>) {
        // Departure depends on the binding still being active, so it is
        // recorded before the unbind.
        if let Some(student_id) = &student_id {
            let result = self
                .procedures
                .record_departure(StudentRef {
                    academy_id: academy_id.to_string(),
                    student_id: student_id.clone(),
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "departure recording failed");
            }
        }

        let result = self
            .procedures
            .unbind_device(DeviceRef {
                academy_id: academy_id.to_string(),
                device_id: device_id.to_string(),
            })
            .await;
        if let Err(e) = &result {
            error!(error = %e, "unbind procedure failed");
        }

        let mut ack = json!({ "ok": result.is_ok(), "action": "unbind" });
        if let Err(e) = &result {
            ack["error"] = json!(e.to_string());
        }
        self.publish_device_ack(academy_id, device_id, ack).await;
    }

    async fn handle_unbind_by_student(
        &self,
        academy_id: &str,
        device_id: &str,
        student_id: Option<String>,
    ) {
        let Some(student_id) = student_id else {
            self.publish_device_ack(
                academy_id,
                device_id,
                json!({ "ok": false, "action": "unbind_by_student", "error": "missing student_id" }),
            )
            .await;
            return;
        };

        let scope = StudentRef {
            academy_id: academy_id.to_string(),
            student_id: student_id.clone(),
        };

        // Departure first, while the binding is still active.
        if let Err(e) = self.procedures.record_departure(scope.clone()).await {
            warn!(error = %e, "departure recording failed");
        }

        let result = self.procedures.unbind_by_student(scope).await;
        if let Err(e) = &result {
            error!(error = %e, "unbind_by_student procedure failed");
        }

        let mut ack = json!({
            "ok": result.is_ok(),
            "action": "unbind_by_student",
            "student_id": student_id,
        });
        if let Err(e) = &result {
            ack["error"] = json!(e.to_string());
        }
        self.publish_device_ack(academy_id, device_id, ack).await;
    }

    async fn handle_list_today(&self, academy_id: &str, device_id: &str) {
        let students = match self.procedures.list_students_today(academy_id).await {
            Ok(students) => students,
            Err(e) => {
                error!(error = %e, "list_today failed");
                return;
            }
        };

        let count = students.len();
        if let Err(e) = self
            .publisher
            .publish_json(
                &topic::students_today_topic(academy_id, device_id),
                json!({ "students": students }),
            )
            .await
        {
            warn!(error = %e, "failed to publish students_today");
        }
        self.publish_device_ack(
            academy_id,
            device_id,
            json!({ "ok": true, "action": "list_today", "count": count }),
        )
        .await;
    }

    async fn handle_list_homeworks(
        &self,
        academy_id: &str,
        device_id: &str,
        student_id: Option<String>,
    ) {
        let Some(student_id) = student_id else {
            warn!("list_homeworks without student_id");
            return;
        };

        let items = match self
            .procedures
            .list_homeworks_for_student(StudentRef {
                academy_id: academy_id.to_string(),
                student_id,
            })
            .await
        {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "list_homeworks failed");
                return;
            }
        };

        let count = items.len();
        if let Err(e) = self
            .publisher
            .publish_json(
                &topic::homeworks_topic(academy_id, device_id),
                json!({ "items": items }),
            )
            .await
        {
            warn!(error = %e, "failed to publish homework listing");
        }
        self.publish_device_ack(
            academy_id,
            device_id,
            json!({ "ok": true, "action": "list_homeworks", "count": count }),
        )
        .await;
    }

    async fn handle_student_info(
        &self,
        academy_id: &str,
        device_id: &str,
        student_id: Option<String>,
    ) {
        let Some(student_id) = student_id else {
            warn!("student_info without student_id");
            return;
        };

        let student = match self
            .procedures
            .get_student_info(StudentRef {
                academy_id: academy_id.to_string(),
                student_id,
            })
            .await
        {
            Ok(student) => student,
            Err(e) => {
                error!(error = %e, "student_info failed");
                return;
            }
        };

        if let Err(e) = self
            .publisher
            .publish_json(
                &topic::student_info_topic(academy_id, device_id),
                json!({ "student": student }),
            )
            .await
        {
            warn!(error = %e, "failed to publish student_info");
        }
        self.publish_device_ack(
            academy_id,
            device_id,
            json!({ "ok": true, "action": "student_info" }),
        )
        .await;
    }

    /// Fire-and-forget telemetry; no ack.
    async fn handle_presence(&self, academy_id: &str, device_id: &str, payload: &Value) {
        let online = payload
            .get("online")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let at = payload
            .get("at")
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        debug!(online, academy_id, device_id, "device presence");

        let result = self
            .procedures
            .record_presence(PresenceRecord {
                academy_id: academy_id.to_string(),
                device_id: device_id.to_string(),
                online,
                at,
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "presence recording failed");
        }
    }

    /// Publish the current listing to every device bound to the student.
    /// Fan-out is a convenience signal: every failure here is a warning,
    /// never a retry.
    async fn fan_out_listing(&self, academy_id: &str, student_id: &str) {
        let scope = StudentRef {
            academy_id: academy_id.to_string(),
            student_id: student_id.to_string(),
        };

        let devices = match self.procedures.active_bindings_for(scope.clone()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "binding lookup failed, skipping fan-out");
                return;
            }
        };
        if devices.is_empty() {
            return;
        }

        let items = match self.procedures.list_homeworks_for_student(scope).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "listing fetch failed, skipping fan-out");
                return;
            }
        };

        let payload = json!({ "items": items });
        for device_id in devices {
            let fan_topic = topic::homeworks_topic(academy_id, &device_id);
            if let Err(e) = self.publisher.publish_json(&fan_topic, payload.clone()).await {
                warn!(topic = %fan_topic, error = %e, "fan-out publish failed");
            }
        }
    }

    async fn publish_device_ack(&self, academy_id: &str, device_id: &str, ack: Value) {
        let ack_topic = topic::device_ack_topic(academy_id, device_id);
        if let Err(e) = self.publisher.publish_json(&ack_topic, ack).await {
            warn!(topic = %ack_topic, error = %e, "failed to publish device ack");
        }
    }
}

/// Change-triggered fan-out, independent of and redundant with the
/// optimistic refresh after a command.
#[async_trait]
impl HomeworkChangeHandler for CommandGateway {
    async fn on_homework_change(&self, event: HomeworkChangeEvent) {
        debug!(
            academy_id = %event.academy_id,
            student_id = %event.student_id,
            "homework state change"
        );
        self.fan_out_listing(&event.academy_id, &event.student_id)
            .await;
    }
}
