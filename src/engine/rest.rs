//! REST Collections API engine (spec §4.5): the default backend below the
//! bulk threshold, and the only backend ever used for an object the run
//! config marks "not supported in bulk".

use async_trait::async_trait;
use serde_json::json;

use crate::engine::{ApiEngine, BatchPlan, EngineResults, RateLimiter, RecordResult};
use crate::error::MigrateError;
use crate::model::{Operation, Record};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::script::OrgConnection;
use crate::transport::{HttpMethod, Transport};
use crate::value::RecordId;

/// The `/composite/sobjects` collection endpoint accepts at most 200
/// records per call.
pub const REST_BATCH_SIZE: usize = 200;

pub struct RestEngine<'a, T: Transport> {
    transport: &'a T,
    org: &'a OrgConnection,
    object: String,
    operation: Operation,
    all_or_none: bool,
    rate_limiter: RateLimiter,
}

impl<'a, T: Transport> RestEngine<'a, T> {
    pub fn new(
        transport: &'a T,
        org: &'a OrgConnection,
        object: impl Into<String>,
        operation: Operation,
        all_or_none: bool,
        rate_limiter: RateLimiter,
    ) -> Self {
        RestEngine { transport, org, object: object.into(), operation, all_or_none, rate_limiter }
    }

    fn http_method(&self) -> HttpMethod {
        match self.operation {
            Operation::Insert | Operation::Upsert | Operation::Readonly => HttpMethod::Post,
            Operation::Update => HttpMethod::Patch,
            Operation::Delete => HttpMethod::Delete,
        }
    }

    fn record_to_json(&self, record: &Record) -> serde_json::Value {
        if self.operation == Operation::Delete {
            return json!(record.get("Id").map(|v| v.to_string()).unwrap_or_default());
        }
        let mut obj = serde_json::Map::new();
        obj.insert("attributes".to_string(), json!({ "type": self.object }));
        for (name, value) in &record.fields {
            if name == "Id" && self.operation == Operation::Insert {
                continue;
            }
            obj.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

#[async_trait]
impl<'a, T: Transport> ApiEngine for RestEngine<'a, T> {
    fn prepare_batches(&self, records: Vec<Record>) -> BatchPlan {
        let batches = records.chunks(REST_BATCH_SIZE).map(|c| c.to_vec()).collect();
        BatchPlan { object: self.object.clone(), operation: self.operation, batches }
    }

    async fn execute(&self, plan: BatchPlan, progress: &dyn ProgressSink) -> Result<EngineResults, MigrateError> {
        progress.on_event(ProgressEvent::OperationStarted { object: plan.object.clone() });

        let mut results = Vec::with_capacity(plan.record_count());
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for batch in &plan.batches {
            self.rate_limiter.acquire().await;
            let bodies: Vec<serde_json::Value> = batch.iter().map(|r| self.record_to_json(r)).collect();
            let response = self
                .transport
                .rest_collection(self.org, self.http_method(), &self.object, self.all_or_none, json!(bodies))
                .await?;
            let rows = response.as_array().cloned().unwrap_or_default();

            for (i, record) in batch.iter().enumerate() {
                let (target_id, error) = match rows.get(i) {
                    Some(row) => {
                        let success = row.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
                        if success {
                            let id = row.get("id").and_then(|v| v.as_str()).map(RecordId::new);
                            (id, None)
                        } else {
                            let msg = row
                                .get("errors")
                                .and_then(|v| v.as_array())
                                .and_then(|a| a.first())
                                .and_then(|e| e.get("message"))
                                .and_then(|m| m.as_str())
                                .unwrap_or("unknown error")
                                .to_string();
                            (None, Some(msg))
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
        }

        progress.on_event(ProgressEvent::OperationFinished { object: plan.object.clone(), succeeded, failed });
        Ok(EngineResults { results })
    }
}
