//! Bulk API v1 ingest engine (spec §4.5): create a job, submit one CSV
//! batch per chunk, poll each batch to completion, then close the job.
//! Batch result rows come back in submission order, so reconciliation here
//! is a straightforward positional zip (unlike Bulk v2's insert path).

use std::time::Instant;

use async_trait::async_trait;

use crate::config::RunConfig;
use crate::engine::csv_codec::{parse_csv_rows, records_to_csv};
use crate::engine::{ApiEngine, BatchPlan, EngineResults, RateLimiter, RecordResult};
use crate::error::MigrateError;
use crate::model::{Operation, Record};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::script::OrgConnection;
use crate::transport::Transport;
use crate::value::RecordId;

pub struct BulkV1Engine<'a, T: Transport> {
    transport: &'a T,
    org: &'a OrgConnection,
    object: String,
    operation: Operation,
    field_order: Vec<String>,
    batch_size: usize,
    polling_interval: std::time::Duration,
    poll_timeout: std::time::Duration,
    rate_limiter: RateLimiter,
}

impl<'a, T: Transport> BulkV1Engine<'a, T> {
    pub fn new(
        transport: &'a T,
        org: &'a OrgConnection,
        object: impl Into<String>,
        operation: Operation,
        field_order: Vec<String>,
        config: &RunConfig,
        rate_limiter: RateLimiter,
    ) -> Self {
        BulkV1Engine {
            transport,
            org,
            object: object.into(),
            operation,
            field_order,
            batch_size: config.bulk_api_v1_batch_size,
            polling_interval: config.polling_interval,
            poll_timeout: config.timeouts.poll_timeout,
            rate_limiter,
        }
    }

    fn operation_name(&self) -> &'static str {
        match self.operation {
            Operation::Insert | Operation::Readonly => "insert",
            Operation::Update => "update",
            Operation::Upsert => "upsert",
            Operation::Delete => "delete",
        }
    }
}

#[async_trait]
impl<'a, T: Transport> ApiEngine for BulkV1Engine<'a, T> {
    fn prepare_batches(&self, records: Vec<Record>) -> BatchPlan {
        let batches = records.chunks(self.batch_size.max(1)).map(|c| c.to_vec()).collect();
        BatchPlan { object: self.object.clone(), operation: self.operation, batches }
    }

    async fn execute(&self, plan: BatchPlan, progress: &dyn ProgressSink) -> Result<EngineResults, MigrateError> {
        progress.on_event(ProgressEvent::OperationStarted { object: plan.object.clone() });

        self.rate_limiter.acquire().await;
        let job_id = self.transport.bulk_v1_create_job(self.org, &self.object, self.operation_name()).await?;
        progress.on_event(ProgressEvent::Open { object: plan.object.clone() });

        let mut results = Vec::with_capacity(plan.record_count());
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for batch in &plan.batches {
            let csv_body = records_to_csv(batch, &self.field_order);
            self.rate_limiter.acquire().await;
            let batch_id = self.transport.bulk_v1_add_batch(self.org, &job_id, &csv_body).await?;
            progress.on_event(ProgressEvent::UploadComplete { object: plan.object.clone() });

            let started = Instant::now();
            loop {
                self.rate_limiter.acquire().await;
                let state = self.transport.bulk_v1_batch_status(self.org, &job_id, &batch_id).await?;
                match state.as_str() {
                    "Completed" => break,
                    "Failed" => {
                        progress.on_event(ProgressEvent::FailedOrAborted {
                            object: plan.object.clone(),
                            detail: format!("batch {batch_id} failed"),
                        });
                        return Err(MigrateError::api_operation_failed(
                            plan.object.clone(),
                            format!("bulk v1 batch {batch_id} failed"),
                        ));
                    }
                    _ => {
                        if started.elapsed() > self.poll_timeout {
                            return Err(MigrateError::api_operation_failed(plan.object.clone(), "bulk v1 poll timed out"));
                        }
                        progress.on_event(ProgressEvent::InProgress { object: plan.object.clone(), processed: 0, failed: 0 });
                        tokio::time::sleep(self.polling_interval).await;
                    }
                }
            }

            let result_csv = self.transport.bulk_v1_batch_result(self.org, &job_id, &batch_id).await?;
            let rows = parse_csv_rows(&result_csv);
            for (i, record) in batch.iter().enumerate() {
                let (target_id, error) = match rows.get(i) {
                    Some(row) => {
                        let success = row.get("Success").map(|s| s.eq_ignore_ascii_case("true")).unwrap_or(false);
                        if success {
                            (row.get("Id").cloned().map(RecordId::new), None)
                        } else {
                            (None, row.get("Error").cloned())
                        }
                    }
                    None => (None, Some("no result row returned for this record".to_string())),
                };
                if target_id.is_some() {
                    succeeded += 1;
                } else {
                    failed += 1;
                }
                results.push(RecordResult {
                    source_id: record.source_id.clone(),
                    target_id,
                    error,
                    is_missing_source_target_mapping: false,
                    is_unprocessed: false,
                });
            }
            progress.on_event(ProgressEvent::JobComplete { object: plan.object.clone() });
        }

        self.rate_limiter.acquire().await;
        self.transport.bulk_v1_close_job(self.org, &job_id).await?;
        progress.on_event(ProgressEvent::OperationFinished { object: plan.object.clone(), succeeded, failed });

        Ok(EngineResults { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockTransport {
        status_sequence: Mutex<Vec<&'static str>>,
        result_csv: String,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn query(&self, _: &OrgConnection, _: &str) -> Result<crate::transport::QueryResultPage, MigrateError> {
            unimplemented!()
        }
        async fn query_more(&self, _: &OrgConnection, _: &str) -> Result<crate::transport::QueryResultPage, MigrateError> {
            unimplemented!()
        }
        async fn bulk_query_csv(&self, _: &OrgConnection, _: &str) -> Result<String, MigrateError> {
            unimplemented!()
        }
        async fn get_blob(&self, _: &OrgConnection, _: &str) -> Result<Vec<u8>, MigrateError> {
            unimplemented!()
        }
        async fn rest_collection(
            &self,
            _: &OrgConnection,
            _: crate::transport::HttpMethod,
            _: &str,
            _: bool,
            _: serde_json::Value,
        ) -> Result<serde_json::Value, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v1_create_job(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            Ok("job1".to_string())
        }
        async fn bulk_v1_add_batch(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            Ok("batch1".to_string())
        }
        async fn bulk_v1_batch_status(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            let mut seq = self.status_sequence.lock().unwrap();
            if seq.len() > 1 {
                Ok(seq.remove(0).to_string())
            } else {
                Ok(seq[0].to_string())
            }
        }
        async fn bulk_v1_batch_result(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            Ok(self.result_csv.clone())
        }
        async fn bulk_v1_close_job(&self, _: &OrgConnection, _: &str) -> Result<(), MigrateError> {
            Ok(())
        }
        async fn bulk_v2_create_job(&self, _: &OrgConnection, _: &str, _: &str) -> Result<crate::transport::BulkV2Job, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_upload(&self, _: &str, _: &str) -> Result<(), MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_complete_upload(&self, _: &OrgConnection, _: &str) -> Result<(), MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_job_status(&self, _: &OrgConnection, _: &str) -> Result<crate::transport::BulkV2JobState, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_results(
            &self,
            _: &OrgConnection,
            _: &str,
            _: crate::transport::BulkV2ResultKind,
        ) -> Result<String, MigrateError> {
            unimplemented!()
        }
    }

    fn org() -> OrgConnection {
        OrgConnection { name: "target".into(), instance_url: "https://example.my.salesforce.com".into(), access_token: "tok".into() }
    }

    #[tokio::test]
    async fn polls_until_completed_then_zips_results_positionally() {
        let transport = MockTransport {
            status_sequence: Mutex::new(vec!["InProgress", "Completed"]),
            result_csv: "Id,Success,Error\n001TT0000000001AAA,true,\n,false,DUPLICATE_VALUE\n".to_string(),
        };
        let org = org();
        let config = RunConfig { polling_interval: std::time::Duration::from_millis(1), ..RunConfig::default() };
        let rate_limiter = RateLimiter::new(crate::config::RateLimitConfig { requests_per_minute: 1000, enabled: false });
        let engine = BulkV1Engine::new(
            &transport,
            &org,
            "Account",
            Operation::Insert,
            vec!["Name".to_string()],
            &config,
            rate_limiter,
        );

        let mut r1 = Record::new(RecordId::new("src1"));
        r1.set("Name", Value::String("Acme".into()));
        let mut r2 = Record::new(RecordId::new("src2"));
        r2.set("Name", Value::String("Beta".into()));

        let plan = engine.prepare_batches(vec![r1, r2]);
        let sink = crate::progress::ConsoleProgressSink;
        let results = engine.execute(plan, &sink).await.unwrap();

        assert_eq!(results.succeeded(), 1);
        assert_eq!(results.failed(), 1);
        assert_eq!(results.results[0].target_id, Some(RecordId::new("001TT0000000001AAA")));
    }
}
