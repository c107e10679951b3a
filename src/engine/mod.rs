//! Pluggable API engine abstraction (C5, spec §4.5): one engine is created
//! for one object + one operation, prepares its batches, and executes them
//! to completion while reporting progress through the common vocabulary
//! (spec §7 / [`crate::progress`]).
//!
//! Three backends implement the contract: [`rest`] (REST collection API,
//! synchronous per-chunk), [`bulk_v1`] (job + batch + poll), and [`bulk_v2`]
//! (CSV ingest job with explicit upload/poll/result-retrieval states).
//! [`select_engine_kind`] picks between them per spec §4.5's threshold
//! rule; [`RateLimiter`] implements the shared request budget named in
//! spec §5.

pub mod bulk_v1;
pub mod bulk_v2;
mod csv_codec;
mod rate_limiter;
pub mod rest;

use async_trait::async_trait;

use crate::config::RunConfig;
use crate::error::MigrateError;
use crate::model::{Operation, Record};
use crate::progress::ProgressSink;
use crate::script::BulkApiVersion;
use crate::value::RecordId;

pub use rate_limiter::RateLimiter;

/// Which backend an [`crate::model::EnginePlan`] will run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Rest,
    BulkV1,
    BulkV2,
}

/// Engine selection per batch (spec §4.5): bulk only above the threshold,
/// never for an object the target marks "not supported in bulk".
pub fn select_engine_kind(
    record_count: usize,
    config: &RunConfig,
    object: &str,
    force_rest: bool,
) -> EngineKind {
    if force_rest || !config.is_bulk_supported(object) {
        return EngineKind::Rest;
    }
    if record_count > config.bulk_threshold {
        match config.bulk_api_version {
            BulkApiVersion::V2 => EngineKind::BulkV2,
            BulkApiVersion::V1 => EngineKind::BulkV1,
        }
    } else {
        EngineKind::Rest
    }
}

/// A batch of prepared records bound to an object + operation, split by
/// the owning engine's batch-size/byte limits (spec §4.5:
/// "`prepareBatches(records) -> BatchPlan`").
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub object: String,
    pub operation: Operation,
    pub batches: Vec<Vec<Record>>,
}

impl BatchPlan {
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Outcome for one submitted record after an engine run completes.
#[derive(Debug, Clone)]
pub struct RecordResult {
    pub source_id: RecordId,
    pub target_id: Option<RecordId>,
    pub error: Option<String>,
    /// Set when the Bulk v2 engine could not reconcile a result row back
    /// to a submitted record by content hash (spec §4.5).
    pub is_missing_source_target_mapping: bool,
    /// Set when the row came back in the job's `unprocessedrecords/` set —
    /// the job aborted before this row was attempted (spec §4.5, §8).
    pub is_unprocessed: bool,
}

impl RecordResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.is_missing_source_target_mapping && !self.is_unprocessed
    }
}

/// Every result row produced by one `execute` call.
#[derive(Debug, Clone, Default)]
pub struct EngineResults {
    pub results: Vec<RecordResult>,
}

impl EngineResults {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.is_success() && !r.is_missing_source_target_mapping && !r.is_unprocessed)
            .count()
    }

    pub fn missing_source_target_mapping(&self) -> usize {
        self.results.iter().filter(|r| r.is_missing_source_target_mapping).count()
    }

    pub fn unprocessed(&self) -> usize {
        self.results.iter().filter(|r| r.is_unprocessed).count()
    }
}

/// The common engine contract (spec §4.5): split a record set into batches,
/// then drive those batches to completion while surfacing progress.
#[async_trait]
pub trait ApiEngine {
    fn prepare_batches(&self, records: Vec<Record>) -> BatchPlan;

    async fn execute(
        &self,
        plan: BatchPlan,
        progress: &dyn ProgressSink,
    ) -> Result<EngineResults, MigrateError>;
}
