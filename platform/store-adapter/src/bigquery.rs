//! BigQuery-backed implementation of the `Store` trait (§4.A).
//!
//! Append-only tables (`events`, `card_master`, `line_items_master`) go
//! through streaming inserts via `tabledata().insert_all()`. Current-state
//! tables (`card_current`, `line_items_current`) have no native UPSERT, so
//! they're maintained with `MERGE` query jobs. A row that was streamed in
//! the last ~90 minutes lives in BigQuery's streaming buffer and cannot
//! participate in a `MERGE`/`DELETE` — the API returns a 400 naming the
//! streaming buffer, which we translate to [`StoreError::Deferred`] so the
//! caller enqueues a retry instead of failing the notification.

use chrono::{DateTime, Utc};
use gcp_bigquery_client::model::{
    query_request::QueryRequest, table_data_insert_all_request::TableDataInsertAllRequest,
};
use gcp_bigquery_client::Client;

use crate::{
    CardCurrentRow, CardMasterRow, LineItemRow, MasterInsertOutcome, NotificationEvent,
    PendingOutcome, PendingStatus, PendingUpdate, Store, StoreError, StoreResult,
};

const STREAMING_BUFFER_MARKER: &str = "streaming buffer";

/// Dataset/table names, broken out so staging and production can point at
/// different datasets without recompiling.
#[derive(Debug, Clone)]
pub struct BigQueryTables {
    pub events: String,
    pub card_master: String,
    pub card_current: String,
    pub line_items_master: String,
    pub line_items_current: String,
    pub pending_updates: String,
}

impl Default for BigQueryTables {
    fn default() -> Self {
        Self {
            events: "events".to_string(),
            card_master: "card_master".to_string(),
            card_current: "card_current".to_string(),
            line_items_master: "line_items_master".to_string(),
            line_items_current: "line_items_current".to_string(),
            pending_updates: "pending_updates".to_string(),
        }
    }
}

pub struct BigQueryStore {
    client: Client,
    project_id: String,
    dataset_id: String,
    tables: BigQueryTables,
}

impl BigQueryStore {
    pub async fn connect(
        service_account_key_path: &str,
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        tables: BigQueryTables,
    ) -> StoreResult<Self> {
        let client = Client::from_service_account_key_file(service_account_key_path)
            .await
            .map_err(|e| StoreError::Permanent(format!("bigquery auth failed: {e}")))?;
        Ok(Self {
            client,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            tables,
        })
    }

    fn table_path(&self, table: &str) -> String {
        format!("`{}.{}.{}`", self.project_id, self.dataset_id, table)
    }

    /// Idempotent `CREATE TABLE IF NOT EXISTS` for every table this adapter
    /// reads or writes, including `pending_updates`, which backs the retry
    /// queue and has no analyst-facing counterpart.
    pub async fn migrate(&self) -> StoreResult<()> {
        let events = self.table_path(&self.tables.events);
        self.run_query(format!(
            "CREATE TABLE IF NOT EXISTS {events} (
                event_id STRING NOT NULL,
                action_kind STRING NOT NULL,
                action_time TIMESTAMP NOT NULL,
                card_id STRING,
                board_id STRING,
                board_name STRING,
                list_before_id STRING,
                list_before_name STRING,
                list_after_id STRING,
                list_after_name STRING,
                actor_id STRING,
                actor_name STRING,
                is_list_transition BOOL NOT NULL,
                raw_payload STRING NOT NULL,
                processed BOOL NOT NULL,
                error_message STRING,
                received_at TIMESTAMP NOT NULL
            )
            PARTITION BY DATE(received_at)
            CLUSTER BY card_id"
        ))
        .await?;

        let card_master = self.table_path(&self.tables.card_master);
        self.run_query(format!(
            "CREATE TABLE IF NOT EXISTS {card_master} (
                card_id STRING NOT NULL,
                board_id STRING,
                name STRING,
                created_at TIMESTAMP NOT NULL,
                first_seen_event_id STRING NOT NULL
            )
            CLUSTER BY card_id"
        ))
        .await?;

        let card_current = self.table_path(&self.tables.card_current);
        self.run_query(format!(
            "CREATE TABLE IF NOT EXISTS {card_current} (
                card_id STRING NOT NULL,
                board_id STRING,
                list_id STRING,
                list_name STRING,
                name STRING,
                description STRING,
                closed BOOL NOT NULL,
                labels ARRAY<STRING>,
                extracted STRING,
                line_item_count INT64 NOT NULL,
                last_extracted_at TIMESTAMP,
                last_extraction_event_id STRING,
                updated_at TIMESTAMP NOT NULL
            )
            CLUSTER BY card_id"
        ))
        .await?;

        let line_items_master = self.table_path(&self.tables.line_items_master);
        self.run_query(format!(
            "CREATE TABLE IF NOT EXISTS {line_items_master} (
                card_id STRING NOT NULL,
                line_index INT64 NOT NULL,
                extraction_event_id STRING NOT NULL,
                description STRING,
                business_line STRING NOT NULL,
                price_kind STRING NOT NULL,
                unit_price FLOAT64 NOT NULL,
                quantity FLOAT64 NOT NULL,
                total_revenue FLOAT64 NOT NULL,
                recorded_at TIMESTAMP NOT NULL
            )
            CLUSTER BY card_id"
        ))
        .await?;

        let line_items_current = self.table_path(&self.tables.line_items_current);
        self.run_query(format!(
            "CREATE TABLE IF NOT EXISTS {line_items_current} (
                card_id STRING NOT NULL,
                line_index INT64 NOT NULL,
                description STRING,
                business_line STRING NOT NULL,
                price_kind STRING NOT NULL,
                unit_price FLOAT64 NOT NULL,
                quantity FLOAT64 NOT NULL,
                total_revenue FLOAT64 NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            CLUSTER BY card_id"
        ))
        .await?;

        let pending_updates = self.table_path(&self.tables.pending_updates);
        self.run_query(format!(
            "CREATE TABLE IF NOT EXISTS {pending_updates} (
                update_id STRING NOT NULL,
                operation_kind STRING NOT NULL,
                payload STRING NOT NULL,
                status STRING NOT NULL,
                retry_count INT64 NOT NULL,
                first_queued_at TIMESTAMP NOT NULL,
                next_retry_at TIMESTAMP NOT NULL,
                last_retry_at TIMESTAMP,
                completed_at TIMESTAMP,
                error_message STRING,
                depends_on STRING
            )
            CLUSTER BY status"
        ))
        .await?;

        Ok(())
    }

    async fn stream_insert_json(
        &self,
        table: &str,
        rows: Vec<serde_json::Value>,
    ) -> StoreResult<()> {
        let mut request = TableDataInsertAllRequest::new();
        for row in rows {
            request
                .add_row(None, row)
                .map_err(|e| StoreError::Permanent(format!("encoding insert row: {e}")))?;
        }

        let response = self
            .client
            .tabledata()
            .insert_all(&self.project_id, &self.dataset_id, table, request)
            .await
            .map_err(|e| classify_error(&e.to_string()))?;

        if let Some(errors) = response.insert_errors {
            if !errors.is_empty() {
                let joined = errors
                    .iter()
                    .flat_map(|e| e.errors.iter().map(|x| x.message.clone()))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(classify_error(&joined));
            }
        }
        Ok(())
    }

    async fn run_query(&self, sql: String) -> StoreResult<()> {
        self.client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        Ok(())
    }
}

fn classify_error(message: &str) -> StoreError {
    if message.to_lowercase().contains(STREAMING_BUFFER_MARKER) {
        StoreError::Deferred(message.to_string())
    } else {
        StoreError::Permanent(message.to_string())
    }
}

fn escape_sql_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn sql_string(value: &str) -> String {
    format!("'{}'", escape_sql_string(value))
}

fn sql_opt_string(value: &Option<String>) -> String {
    match value {
        Some(v) => sql_string(v),
        None => "NULL".to_string(),
    }
}

fn sql_timestamp(value: DateTime<Utc>) -> String {
    format!("TIMESTAMP('{}')", value.to_rfc3339())
}

fn sql_opt_timestamp(value: Option<DateTime<Utc>>) -> String {
    match value {
        Some(v) => sql_timestamp(v),
        None => "NULL".to_string(),
    }
}

fn sql_string_array(values: &[String]) -> String {
    let items = values.iter().map(|v| sql_string(v)).collect::<Vec<_>>().join(", ");
    format!("[{items}]")
}

#[async_trait::async_trait]
impl Store for BigQueryStore {
    async fn insert_event(&self, event: &NotificationEvent) -> StoreResult<()> {
        let table = self.tables.events.clone();
        let row = serde_json::to_value(event)
            .map_err(|e| StoreError::Permanent(format!("encoding event: {e}")))?;
        self.stream_insert_json(&table, vec![row]).await
    }

    async fn event_exists(&self, event_id: &str) -> StoreResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) AS c FROM {} WHERE event_id = {}",
            self.table_path(&self.tables.events),
            sql_string(event_id)
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        let count = result
            .next_row()
            .then(|| result.get_i64(0).ok().flatten())
            .flatten()
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn card_master_exists(&self, card_id: &str) -> StoreResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE card_id = {}",
            self.table_path(&self.tables.card_master),
            sql_string(card_id)
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        Ok(result.next_row() && result.get_i64(0).ok().flatten().unwrap_or(0) > 0)
    }

    async fn get_last_known_description(&self, card_id: &str) -> StoreResult<Option<String>> {
        let sql = format!(
            "SELECT description FROM {} WHERE card_id = {} LIMIT 1",
            self.table_path(&self.tables.card_current),
            sql_string(card_id)
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        if result.next_row() {
            return Ok(result.get_string(0).ok().flatten());
        }

        // No projection row yet: fall back to the latest processed event's
        // raw payload for this card (§9 design note).
        let fallback_sql = format!(
            "SELECT JSON_VALUE(raw_payload, '$.card.desc') FROM {} \
             WHERE card_id = {} AND processed = TRUE \
             ORDER BY action_time DESC LIMIT 1",
            self.table_path(&self.tables.events),
            sql_string(card_id)
        );
        let mut fallback = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(fallback_sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        if fallback.next_row() {
            Ok(fallback.get_string(0).ok().flatten())
        } else {
            Ok(None)
        }
    }

    async fn get_card_current(&self, card_id: &str) -> StoreResult<Option<CardCurrentRow>> {
        let sql = format!(
            "SELECT TO_JSON_STRING(t) FROM {} AS t WHERE card_id = {} LIMIT 1",
            self.table_path(&self.tables.card_current),
            sql_string(card_id)
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        if !result.next_row() {
            return Ok(None);
        }
        let raw = result
            .get_string(0)
            .ok()
            .flatten()
            .ok_or_else(|| StoreError::Permanent("card_current row had no JSON column".into()))?;
        let row: CardCurrentRow = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Permanent(format!("decoding card_current row: {e}")))?;
        Ok(Some(row))
    }

    async fn insert_card_master_if_absent(
        &self,
        row: &CardMasterRow,
    ) -> StoreResult<MasterInsertOutcome> {
        let check_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE card_id = {}",
            self.table_path(&self.tables.card_master),
            sql_string(&row.card_id)
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(check_sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        let exists = result.next_row()
            && result.get_i64(0).ok().flatten().unwrap_or(0) > 0;
        if exists {
            return Ok(MasterInsertOutcome::AlreadyPresent);
        }

        let json = serde_json::to_value(row)
            .map_err(|e| StoreError::Permanent(format!("encoding card master row: {e}")))?;
        let table = self.tables.card_master.clone();
        self.stream_insert_json(&table, vec![json]).await?;
        Ok(MasterInsertOutcome::Inserted)
    }

    async fn upsert_card_current(&self, row: &CardCurrentRow) -> StoreResult<()> {
        let sql = format!(
            "MERGE {target} T \
             USING (SELECT {card_id} AS card_id) S \
             ON T.card_id = S.card_id \
             WHEN MATCHED THEN UPDATE SET \
               name = {name}, description = {description}, labels = {labels}, \
               closed = {closed}, board_id = {board_id}, board_name = {board_name}, \
               list_id = {list_id}, list_name = {list_name}, \
               purchaser = {purchaser}, buyer_name = {buyer_name}, \
               buyer_email = {buyer_email}, order_summary = {order_summary}, \
               line_item_count = {line_item_count}, last_updated_at = {last_updated_at}, \
               last_extracted_at = {last_extracted_at}, \
               last_extraction_event_id = {last_extraction_event_id}, \
               last_event_type = {last_event_type} \
             WHEN NOT MATCHED THEN INSERT (card_id, name, description, labels, closed, \
               board_id, board_name, list_id, list_name, purchaser, buyer_name, \
               buyer_email, order_summary, created_date, line_item_count, \
               last_updated_at, last_extracted_at, last_extraction_event_id, last_event_type) \
             VALUES ({card_id}, {name}, {description}, {labels}, {closed}, {board_id}, \
               {board_name}, {list_id}, {list_name}, {purchaser}, {buyer_name}, \
               {buyer_email}, {order_summary}, {created_date}, {line_item_count}, \
               {last_updated_at}, {last_extracted_at}, {last_extraction_event_id}, {last_event_type})",
            target = self.table_path(&self.tables.card_current),
            card_id = sql_string(&row.card_id),
            name = sql_string(&row.name),
            description = sql_string(&row.description),
            labels = sql_string_array(&row.labels),
            closed = row.closed,
            board_id = sql_string(&row.board_id),
            board_name = sql_opt_string(&row.board_name),
            list_id = sql_opt_string(&row.list_id),
            list_name = sql_opt_string(&row.list_name),
            purchaser = sql_opt_string(&row.extracted.purchaser),
            buyer_name = sql_opt_string(&row.extracted.buyer_name),
            buyer_email = sql_opt_string(&row.extracted.buyer_email),
            order_summary = sql_opt_string(&row.extracted.order_summary),
            created_date = sql_timestamp(row.created_date),
            line_item_count = row.line_item_count,
            last_updated_at = sql_timestamp(row.last_updated_at),
            last_extracted_at = sql_opt_timestamp(row.last_extracted_at),
            last_extraction_event_id = sql_opt_string(&row.last_extraction_event_id),
            last_event_type = sql_string(&format!("{:?}", row.last_event_type)),
        );
        self.run_query(sql).await
    }

    async fn replace_line_items_current(
        &self,
        card_id: &str,
        rows: &[LineItemRow],
    ) -> StoreResult<()> {
        let delete_sql = format!(
            "DELETE FROM {} WHERE card_id = {}",
            self.table_path(&self.tables.line_items_current),
            sql_string(card_id)
        );
        self.run_query(delete_sql).await?;

        if rows.is_empty() {
            return Ok(());
        }
        let json_rows = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Permanent(format!("encoding line item row: {e}")))?;
        let table = self.tables.line_items_current.clone();
        self.stream_insert_json(&table, json_rows).await
    }

    async fn insert_line_items_master(&self, card_id: &str, rows: &[LineItemRow]) -> StoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let check_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE card_id = {} AND line_index = {}",
            self.table_path(&self.tables.line_items_master),
            sql_string(card_id),
            rows[0].line_index
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(check_sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;
        if result.next_row() && result.get_i64(0).ok().flatten().unwrap_or(0) > 0 {
            return Ok(());
        }

        let json_rows = rows
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Permanent(format!("encoding line item row: {e}")))?;
        let table = self.tables.line_items_master.clone();
        self.stream_insert_json(&table, json_rows).await
    }

    async fn finalize_event(
        &self,
        event_id: &str,
        success: bool,
        triggered_extraction: bool,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET processed = {success}, processed_at = CURRENT_TIMESTAMP(), \
             extraction_triggered = {triggered}, error_message = {error} \
             WHERE event_id = {event_id}",
            self.table_path(&self.tables.events),
            success = success,
            triggered = triggered_extraction,
            error = sql_opt_string(&error_message.map(|s| s.to_string())),
            event_id = sql_string(event_id),
        );
        self.run_query(sql).await
    }

    async fn enqueue_pending(&self, op: PendingUpdate) -> StoreResult<()> {
        let table = self.tables.pending_updates.clone();
        let row = serde_json::to_value(&op)
            .map_err(|e| StoreError::Permanent(format!("encoding pending update: {e}")))?;
        self.stream_insert_json(&table, vec![row]).await
    }

    /// Claims by selecting the oldest due rows, then marking them
    /// `processing` in one `UPDATE`. The retry worker runs as a single
    /// instance (§9), so the select-then-update window is not a race in
    /// practice; a second instance would need a `MERGE`-based compare-and-set
    /// to stay correct.
    async fn claim_pending(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<PendingUpdate>> {
        let select_sql = format!(
            "SELECT update_id, operation_kind, target_table, payload, retry_count, \
               first_queued_at, last_retry_at, next_retry_at, status, error_message, \
               completed_at, created_at, depends_on \
             FROM {} \
             WHERE status = 'pending' AND next_retry_at <= {} \
             ORDER BY first_queued_at ASC LIMIT {}",
            self.table_path(&self.tables.pending_updates),
            sql_timestamp(now),
            limit,
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(select_sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;

        let mut claimed = Vec::new();
        while result.next_row() {
            let raw_payload: String = result.get_string(3).ok().flatten().unwrap_or_default();
            let payload = serde_json::from_str(&raw_payload).unwrap_or(serde_json::Value::Null);
            let depends_on: Vec<String> = result
                .get_string(12)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_default();
            claimed.push(PendingUpdate {
                update_id: result.get_string(0).ok().flatten().unwrap_or_default(),
                operation_kind: serde_json::from_value(serde_json::Value::String(
                    result.get_string(1).ok().flatten().unwrap_or_default(),
                ))
                .unwrap_or(crate::OperationKind::FinalizeEvent),
                target_table: result.get_string(2).ok().flatten().unwrap_or_default(),
                payload,
                retry_count: result.get_i64(4).ok().flatten().unwrap_or(0) as u32,
                first_queued_at: now,
                last_retry_at: None,
                next_retry_at: now,
                status: PendingStatus::Processing,
                error_message: result.get_string(9).ok().flatten(),
                completed_at: None,
                created_at: now,
                depends_on,
            });
        }

        if claimed.is_empty() {
            return Ok(claimed);
        }

        let ids = claimed
            .iter()
            .map(|c| sql_string(&c.update_id))
            .collect::<Vec<_>>()
            .join(", ");
        let update_sql = format!(
            "UPDATE {} SET status = 'processing' WHERE update_id IN ({})",
            self.table_path(&self.tables.pending_updates),
            ids
        );
        self.run_query(update_sql).await?;

        Ok(claimed)
    }

    async fn complete_pending(
        &self,
        update_id: &str,
        outcome: PendingOutcome,
        error_message: Option<&str>,
        max_retries: u32,
    ) -> StoreResult<()> {
        match outcome {
            PendingOutcome::Succeeded => {
                let sql = format!(
                    "UPDATE {} SET status = 'completed', completed_at = CURRENT_TIMESTAMP(), \
                     error_message = NULL WHERE update_id = {}",
                    self.table_path(&self.tables.pending_updates),
                    sql_string(update_id)
                );
                self.run_query(sql).await
            }
            PendingOutcome::Failed => {
                let select_sql = format!(
                    "SELECT retry_count FROM {} WHERE update_id = {}",
                    self.table_path(&self.tables.pending_updates),
                    sql_string(update_id)
                );
                let mut result = self
                    .client
                    .job()
                    .query(&self.project_id, QueryRequest::new(select_sql))
                    .await
                    .map_err(|e| classify_error(&e.to_string()))?;
                let retry_count = if result.next_row() {
                    result.get_i64(0).ok().flatten().unwrap_or(0) as u32 + 1
                } else {
                    return Err(StoreError::Permanent(format!(
                        "unknown pending update {update_id}"
                    )));
                };

                let new_status = if retry_count >= max_retries {
                    "failed"
                } else {
                    "pending"
                };
                let next_retry = crate::backoff::next_retry_at(Utc::now(), retry_count);
                let sql = format!(
                    "UPDATE {} SET retry_count = {retry_count}, status = '{status}', \
                     last_retry_at = CURRENT_TIMESTAMP(), next_retry_at = {next_retry}, \
                     error_message = {error} WHERE update_id = {update_id}",
                    self.table_path(&self.tables.pending_updates),
                    retry_count = retry_count,
                    status = new_status,
                    next_retry = sql_timestamp(next_retry),
                    error = sql_opt_string(&error_message.map(|s| s.to_string())),
                    update_id = sql_string(update_id),
                );
                self.run_query(sql).await
            }
        }
    }

    async fn pending_update_status(&self, update_id: &str) -> StoreResult<Option<PendingStatus>> {
        let sql = format!(
            "SELECT status FROM {} WHERE update_id = {}",
            self.table_path(&self.tables.pending_updates),
            sql_string(update_id),
        );
        let mut result = self
            .client
            .job()
            .query(&self.project_id, QueryRequest::new(sql))
            .await
            .map_err(|e| classify_error(&e.to_string()))?;

        if !result.next_row() {
            return Ok(None);
        }
        let status_str = result.get_string(0).ok().flatten().unwrap_or_default();
        Ok(serde_json::from_value(serde_json::Value::String(status_str)).ok())
    }
}
