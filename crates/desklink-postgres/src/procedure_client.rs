use crate::client::PostgresClient;
use async_trait::async_trait;
use desklink_domain::{
    BindDevice, DeviceRef, DomainError, DomainResult, HomeworkRef, HomeworkStart, PresenceRecord,
    ProcedureClient, StudentRef,
};
use std::future::Future;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ProcedureClientConfig {
    /// Upper bound on any single remote call. The datastore imposes no
    /// statement timeout of its own; a hung call must not stall a handler
    /// forever.
    pub call_timeout: Duration,
    /// Binding-directory result bound, a safety valve against pathological
    /// fan-out.
    pub binding_fanout_limit: i64,
}

impl Default for ProcedureClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            binding_fanout_limit: 10,
        }
    }
}

/// Stored-procedure façade over the pooled client. One method per procedure,
/// every call a single atomic remote operation.
#[derive(Clone)]
pub struct PostgresProcedureClient {
    client: PostgresClient,
    config: ProcedureClientConfig,
}

impl PostgresProcedureClient {
    pub fn new(client: PostgresClient, config: ProcedureClientConfig) -> Self {
        Self { client, config }
    }

    async fn with_timeout<T>(
        &self,
        procedure: &str,
        fut: impl Future<Output = anyhow::Result<T>> + Send,
    ) -> DomainResult<T> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DomainError::DatastoreError(e)),
            Err(_) => Err(DomainError::ProcedureTimeout(procedure.to_string())),
        }
    }

    /// `SELECT procedure($1, ...)` for procedures called only for effect.
    async fn call(&self, procedure: &str, params: &[&(dyn ToSql + Sync)]) -> DomainResult<()> {
        debug!(procedure, "calling stored procedure");
        let sql = call_sql(procedure, params.len());
        self.with_timeout(procedure, async {
            let conn = self.client.get_connection().await?;
            conn.execute(sql.as_str(), params).await?;
            Ok(())
        })
        .await
    }

    /// `SELECT to_jsonb(t) FROM procedure(...) AS t` for set-returning
    /// procedures; rows come back as opaque JSON.
    async fn query_rows(
        &self,
        procedure: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> DomainResult<Vec<serde_json::Value>> {
        debug!(procedure, "querying stored procedure");
        let sql = rows_sql(procedure, params.len());
        self.with_timeout(procedure, async {
            let conn = self.client.get_connection().await?;
            let rows = conn.query(sql.as_str(), params).await?;
            Ok(rows.into_iter().map(|row| row.get(0)).collect())
        })
        .await
    }
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn call_sql(procedure: &str, param_count: usize) -> String {
    format!("SELECT {}({})", procedure, placeholders(param_count))
}

fn rows_sql(procedure: &str, param_count: usize) -> String {
    format!(
        "SELECT to_jsonb(t) FROM {}({}) AS t",
        procedure,
        placeholders(param_count)
    )
}

#[async_trait]
impl ProcedureClient for PostgresProcedureClient {
    async fn start_homework(&self, params: HomeworkStart) -> DomainResult<()> {
        self.call(
            "homework_start",
            &[&params.item_id, &params.academy_id, &params.student_id],
        )
        .await
    }

    async fn pause_homework(&self, params: HomeworkRef) -> DomainResult<()> {
        self.call("homework_pause", &[&params.item_id, &params.academy_id])
            .await
    }

    async fn submit_homework(&self, params: HomeworkRef) -> DomainResult<()> {
        self.call("homework_submit", &[&params.item_id, &params.academy_id])
            .await
    }

    async fn confirm_homework(&self, params: HomeworkRef) -> DomainResult<()> {
        self.call("homework_confirm", &[&params.item_id, &params.academy_id])
            .await
    }

    async fn wait_homework(&self, params: HomeworkRef) -> DomainResult<()> {
        self.call("homework_wait", &[&params.item_id, &params.academy_id])
            .await
    }

    async fn complete_homework(&self, params: HomeworkRef) -> DomainResult<()> {
        self.call("homework_complete", &[&params.item_id, &params.academy_id])
            .await
    }

    async fn pause_all_for_student(&self, params: StudentRef) -> DomainResult<()> {
        self.call(
            "homework_pause_all",
            &[&params.academy_id, &params.student_id],
        )
        .await
    }

    async fn bind_device(&self, params: BindDevice) -> DomainResult<()> {
        self.call(
            "m5_bind_device",
            &[&params.academy_id, &params.device_id, &params.student_id],
        )
        .await
    }

    async fn unbind_device(&self, params: DeviceRef) -> DomainResult<()> {
        self.call(
            "m5_unbind_device",
            &[&params.academy_id, &params.device_id],
        )
        .await
    }

    async fn unbind_by_student(&self, params: StudentRef) -> DomainResult<()> {
        self.call(
            "m5_unbind_by_student",
            &[&params.academy_id, &params.student_id],
        )
        .await
    }

    async fn list_students_today(&self, academy_id: &str) -> DomainResult<Vec<serde_json::Value>> {
        self.query_rows("m5_get_students_today_basic", &[&academy_id])
            .await
    }

    async fn list_homeworks_for_student(
        &self,
        params: StudentRef,
    ) -> DomainResult<Vec<serde_json::Value>> {
        self.query_rows(
            "m5_list_homeworks",
            &[&params.academy_id, &params.student_id],
        )
        .await
    }

    async fn get_student_info(
        &self,
        params: StudentRef,
    ) -> DomainResult<Option<serde_json::Value>> {
        let rows = self
            .query_rows(
                "m5_get_student_info",
                &[&params.academy_id, &params.student_id],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn record_arrival(&self, params: StudentRef) -> DomainResult<()> {
        self.call(
            "m5_record_arrival",
            &[&params.academy_id, &params.student_id],
        )
        .await
    }

    async fn record_departure(&self, params: StudentRef) -> DomainResult<()> {
        self.call(
            "m5_record_departure",
            &[&params.academy_id, &params.student_id],
        )
        .await
    }

    async fn record_presence(&self, params: PresenceRecord) -> DomainResult<()> {
        self.call(
            "m5_device_presence",
            &[
                &params.academy_id,
                &params.device_id,
                &params.online,
                &params.at,
            ],
        )
        .await
    }

    async fn active_bindings_for(&self, params: StudentRef) -> DomainResult<Vec<String>> {
        let procedure = "m5_active_bindings";
        debug!(procedure, "querying stored procedure");
        let sql = format!(
            "SELECT t.device_id FROM {}($1, $2) AS t LIMIT $3",
            procedure
        );
        let limit = self.config.binding_fanout_limit;
        self.with_timeout(procedure, async {
            let conn = self.client.get_connection().await?;
            let rows = conn
                .query(
                    sql.as_str(),
                    &[&params.academy_id, &params.student_id, &limit],
                )
                .await?;
            Ok(rows.into_iter().map(|row| row.get(0)).collect())
        })
        .await
    }
}
