//! Bulk API v2 ingest engine (spec §4.5): a CSV ingest job driven through
//! its explicit `Open -> UploadComplete -> InProgress -> JobComplete`
//! states. Update/delete result rows echo the submitted `Id`, so those
//! reconcile positionally by id; insert results don't echo any submitted
//! identifier, so those are reconciled by a content hash over the
//! submitted field values, with `_0, _1, ...` suffixing to disambiguate
//! records that hash identically (spec §4.5, §8).

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;

use crate::config::RunConfig;
use crate::engine::csv_codec::{chunk_by_base64_size, content_hash, fnv1a_32, normalize_for_hash, parse_csv_rows, records_to_csv};
use crate::engine::{ApiEngine, BatchPlan, EngineResults, RateLimiter, RecordResult};
use crate::error::MigrateError;
use crate::model::{Operation, Record};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::script::OrgConnection;
use crate::transport::{BulkV2JobState, BulkV2ResultKind, Transport};
use crate::value::RecordId;

/// Base64-encoded chunk ceiling Salesforce enforces per upload request.
pub const DEFAULT_MAX_BASE64_BYTES: usize = 10_000_000;

pub struct BulkV2Engine<'a, T: Transport> {
    transport: &'a T,
    org: &'a OrgConnection,
    object: String,
    operation: Operation,
    field_order: Vec<String>,
    max_base64_bytes: usize,
    polling_interval: std::time::Duration,
    poll_timeout: std::time::Duration,
    rate_limiter: RateLimiter,
}

impl<'a, T: Transport> BulkV2Engine<'a, T> {
    pub fn new(
        transport: &'a T,
        org: &'a OrgConnection,
        object: impl Into<String>,
        operation: Operation,
        field_order: Vec<String>,
        config: &RunConfig,
        rate_limiter: RateLimiter,
    ) -> Self {
        BulkV2Engine {
            transport,
            org,
            object: object.into(),
            operation,
            field_order,
            max_base64_bytes: DEFAULT_MAX_BASE64_BYTES,
            polling_interval: config.polling_interval,
            poll_timeout: config.timeouts.poll_timeout,
            rate_limiter,
        }
    }

    fn operation_name(&self) -> &'static str {
        match self.operation {
            Operation::Insert | Operation::Readonly | Operation::Upsert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Update and delete results echo the submitted `Id`; insert (and
    /// upsert, which may create new rows) does not, and needs content-hash
    /// reconciliation instead.
    fn reconciles_by_id(&self) -> bool {
        matches!(self.operation, Operation::Update | Operation::Delete)
    }
}

#[async_trait]
impl<'a, T: Transport> ApiEngine for BulkV2Engine<'a, T> {
    fn prepare_batches(&self, records: Vec<Record>) -> BatchPlan {
        let batches = chunk_by_base64_size(&records, &self.field_order, self.max_base64_bytes);
        BatchPlan { object: self.object.clone(), operation: self.operation, batches }
    }

    async fn execute(&self, plan: BatchPlan, progress: &dyn ProgressSink) -> Result<EngineResults, MigrateError> {
        progress.on_event(ProgressEvent::OperationStarted { object: plan.object.clone() });

        let mut results = Vec::with_capacity(plan.record_count());
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for batch in &plan.batches {
            self.rate_limiter.acquire().await;
            let job = self.transport.bulk_v2_create_job(self.org, &self.object, self.operation_name()).await?;
            progress.on_event(ProgressEvent::Open { object: plan.object.clone() });

            let csv_body = records_to_csv(batch, &self.field_order);
            progress.on_event(ProgressEvent::UploadStart { object: plan.object.clone() });
            self.transport.bulk_v2_upload(&job.content_url, &csv_body).await?;

            self.rate_limiter.acquire().await;
            self.transport.bulk_v2_complete_upload(self.org, &job.job_id).await?;
            progress.on_event(ProgressEvent::UploadComplete { object: plan.object.clone() });

            let started = Instant::now();
            loop {
                self.rate_limiter.acquire().await;
                let state = self.transport.bulk_v2_job_status(self.org, &job.job_id).await?;
                match state {
                    BulkV2JobState::Completed => break,
                    BulkV2JobState::FailedOrAborted => {
                        progress.on_event(ProgressEvent::FailedOrAborted {
                            object: plan.object.clone(),
                            detail: format!("job {} failed", job.job_id),
                        });
                        return Err(MigrateError::api_operation_failed(
                            plan.object.clone(),
                            format!("bulk v2 job {} failed", job.job_id),
                        ));
                    }
                    BulkV2JobState::InProgress => {
                        if started.elapsed() > self.poll_timeout {
                            return Err(MigrateError::api_operation_failed(plan.object.clone(), "bulk v2 poll timed out"));
                        }
                        progress.on_event(ProgressEvent::InProgress { object: plan.object.clone(), processed: 0, failed: 0 });
                        tokio::time::sleep(self.polling_interval).await;
                    }
                }
            }
            progress.on_event(ProgressEvent::JobComplete { object: plan.object.clone() });

            self.rate_limiter.acquire().await;
            let successful_csv = self.transport.bulk_v2_results(self.org, &job.job_id, BulkV2ResultKind::Successful).await?;
            self.rate_limiter.acquire().await;
            let failed_csv = self.transport.bulk_v2_results(self.org, &job.job_id, BulkV2ResultKind::Failed).await?;
            self.rate_limiter.acquire().await;
            let unprocessed_csv = self.transport.bulk_v2_results(self.org, &job.job_id, BulkV2ResultKind::Unprocessed).await?;

            let batch_results = reconcile(batch, &self.field_order, self.reconciles_by_id(), &successful_csv, &failed_csv, &unprocessed_csv);
            for r in &batch_results {
                if r.is_success() {
                    succeeded += 1;
                } else if !r.is_unprocessed && !r.is_missing_source_target_mapping {
                    failed += 1;
                }
            }
            results.extend(batch_results);
        }

        progress.on_event(ProgressEvent::OperationFinished { object: plan.object.clone(), succeeded, failed });
        Ok(EngineResults { results })
    }
}

/// Match each submitted record in `batch` to an outcome, joining all three
/// of the job's result sets (spec §4.5: "GET `successfulResults/`,
/// `failedResults/`, `unprocessedrecords/`. Join the three result sets...").
/// Any row left over after that join is `is_missing_source_target_mapping`,
/// so `succeeded + failed + unprocessed + missing == batch.len()` always
/// holds (spec §8's reconciliation-completeness invariant).
fn reconcile(
    batch: &[Record],
    field_order: &[String],
    by_id: bool,
    successful_csv: &str,
    failed_csv: &str,
    unprocessed_csv: &str,
) -> Vec<RecordResult> {
    if by_id {
        return reconcile_by_id(batch, successful_csv, failed_csv, unprocessed_csv);
    }
    reconcile_by_content_hash(batch, field_order, successful_csv, failed_csv, unprocessed_csv)
}

fn reconcile_by_id(batch: &[Record], successful_csv: &str, failed_csv: &str, unprocessed_csv: &str) -> Vec<RecordResult> {
    let mut ok_ids: HashMap<String, ()> = HashMap::new();
    for row in parse_csv_rows(successful_csv) {
        if let Some(id) = row.get("sf__Id").or_else(|| row.get("Id")) {
            ok_ids.insert(id.clone(), ());
        }
    }
    let mut error_by_id: HashMap<String, String> = HashMap::new();
    for row in parse_csv_rows(failed_csv) {
        if let Some(id) = row.get("sf__Id").or_else(|| row.get("Id")) {
            error_by_id.insert(id.clone(), row.get("sf__Error").cloned().unwrap_or_default());
        }
    }
    let mut unprocessed_ids: HashMap<String, ()> = HashMap::new();
    for row in parse_csv_rows(unprocessed_csv) {
        if let Some(id) = row.get("Id") {
            unprocessed_ids.insert(id.clone(), ());
        }
    }

    batch
        .iter()
        .map(|record| {
            let id = record.get("Id").map(|v| v.to_string()).unwrap_or_default();
            if ok_ids.contains_key(&id) {
                RecordResult { source_id: record.source_id.clone(), target_id: Some(RecordId::new(id)), error: None, is_missing_source_target_mapping: false, is_unprocessed: false }
            } else if let Some(err) = error_by_id.get(&id) {
                RecordResult { source_id: record.source_id.clone(), target_id: None, error: Some(err.clone()), is_missing_source_target_mapping: false, is_unprocessed: false }
            } else if unprocessed_ids.contains_key(&id) {
                RecordResult { source_id: record.source_id.clone(), target_id: None, error: None, is_missing_source_target_mapping: false, is_unprocessed: true }
            } else {
                RecordResult { source_id: record.source_id.clone(), target_id: None, error: None, is_missing_source_target_mapping: true, is_unprocessed: false }
            }
        })
        .collect()
}

fn reconcile_by_content_hash(
    batch: &[Record],
    field_order: &[String],
    successful_csv: &str,
    failed_csv: &str,
    unprocessed_csv: &str,
) -> Vec<RecordResult> {
    let mut hash_occurrence: HashMap<u32, usize> = HashMap::new();
    let mut keyed: HashMap<String, &Record> = HashMap::new();
    for record in batch {
        let h = content_hash(record, field_order);
        let n = hash_occurrence.entry(h).or_insert(0);
        keyed.insert(format!("{h}_{n}"), record);
        *n += 1;
    }

    let mut results = Vec::with_capacity(batch.len());
    let mut assigned: HashMap<String, ()> = HashMap::new();

    let mut success_occurrence: HashMap<u32, usize> = HashMap::new();
    for row in parse_csv_rows(successful_csv) {
        let h = hash_of_result_row(&row, field_order);
        let n = success_occurrence.entry(h).or_insert(0);
        let key = format!("{h}_{n}");
        *n += 1;
        if let Some(record) = keyed.get(&key) {
            let id = row.get("sf__Id").or_else(|| row.get("Id")).cloned().unwrap_or_default();
            results.push(RecordResult { source_id: record.source_id.clone(), target_id: Some(RecordId::new(id)), error: None, is_missing_source_target_mapping: false, is_unprocessed: false });
            assigned.insert(key, ());
        }
    }

    let mut failed_occurrence: HashMap<u32, usize> = HashMap::new();
    for row in parse_csv_rows(failed_csv) {
        let h = hash_of_result_row(&row, field_order);
        let n = failed_occurrence.entry(h).or_insert(0);
        let key = format!("{h}_{n}");
        *n += 1;
        if let Some(record) = keyed.get(&key) {
            let err = row.get("sf__Error").cloned().unwrap_or_default();
            results.push(RecordResult { source_id: record.source_id.clone(), target_id: None, error: Some(err), is_missing_source_target_mapping: false, is_unprocessed: false });
            assigned.insert(key, ());
        }
    }

    let mut unprocessed_occurrence: HashMap<u32, usize> = HashMap::new();
    for row in parse_csv_rows(unprocessed_csv) {
        let h = hash_of_result_row(&row, field_order);
        let n = unprocessed_occurrence.entry(h).or_insert(0);
        let key = format!("{h}_{n}");
        *n += 1;
        if let Some(record) = keyed.get(&key) {
            results.push(RecordResult { source_id: record.source_id.clone(), target_id: None, error: None, is_missing_source_target_mapping: false, is_unprocessed: true });
            assigned.insert(key, ());
        }
    }

    for (key, record) in &keyed {
        if !assigned.contains_key(key) {
            results.push(RecordResult { source_id: record.source_id.clone(), target_id: None, error: None, is_missing_source_target_mapping: true, is_unprocessed: false });
        }
    }

    results
}

fn hash_of_result_row(row: &HashMap<String, String>, field_order: &[String]) -> u32 {
    let mut buf = Vec::new();
    for field in field_order {
        let raw = row.get(field).cloned().unwrap_or_default();
        buf.extend(normalize_for_hash(&raw).as_bytes());
        buf.push(0x1f);
    }
    fnv1a_32(&buf)
}
