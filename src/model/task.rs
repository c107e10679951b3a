//! `Task`: the unit of work for one object within one run (spec §3), and
//! `EnginePlan`: the prepared-batch handoff to an API engine (spec §4.5).

use std::collections::{HashMap, HashSet};

use crate::model::object::{ObjectDescriptor, Operation};
use crate::value::{RecordId, Value};

/// A single record flowing through the pipeline.
///
/// `source_id` is the reserved internal slot required by spec §3's
/// end-to-end invariant: "every record surfaced by a task carries its
/// source-side id in a reserved internal slot, even after the public `id`
/// field is rewritten or cleared for insert." Unlike the public `Id`
/// field in `fields`, this slot is never mutated by the resolver or the
/// engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub source_id: RecordId,
    pub fields: HashMap<String, Value>,
}

impl Record {
    pub fn new(source_id: RecordId) -> Self {
        Record { source_id, fields: HashMap::new() }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }
}

/// Outcome assigned to a record during resolution/write preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Create,
    Update,
    Delete,
    /// Source and target values already match; nothing to write.
    NoChange,
    /// Present only in target, not in source (surfaced for visibility,
    /// never written).
    TargetOnly,
    Skip,
    Error,
}

/// Runtime state for one object within one run. Created during task-graph
/// build (§4.2), mutated by the retrieval driver (§4.3), consumed by the
/// relationship resolver and write path (§4.4–4.5), dropped at end of run.
#[derive(Debug, Clone)]
pub struct Task {
    pub descriptor: ObjectDescriptor,
    pub source_records: Vec<Record>,
    pub target_records: Vec<Record>,
    /// external id value -> source record id
    pub external_id_to_source_id: HashMap<String, RecordId>,
    /// source record id -> source record (owning copy, looked up by id)
    pub source_id_to_record: HashMap<RecordId, usize>,
    /// target external id value -> target record id, populated as soon as a
    /// source external id is matched during target-side retrieval (§4.3).
    pub external_id_to_target_id: HashMap<String, RecordId>,
    /// source record id -> target record id, the cross-task shared write
    /// surface named in spec §5 ("the only cross-task shared write
    /// surface; writes are serialized by the task order").
    pub source_to_target: HashMap<RecordId, RecordId>,
    /// per-field set of id values already used in an `IN (...)` clause,
    /// guaranteeing each `(task, field, value)` triple is queried at most
    /// once across all retrieval passes (spec §4.3, §8 "at-most-once").
    pub filtered_value_cache: HashMap<String, HashSet<String>>,
    /// per-record action assigned by the relationship resolver / transform
    /// comparison step, indexed the same as `source_records`.
    pub actions: Vec<RecordAction>,
}

impl Task {
    pub fn new(descriptor: ObjectDescriptor) -> Self {
        Task {
            descriptor,
            source_records: Vec::new(),
            target_records: Vec::new(),
            external_id_to_source_id: HashMap::new(),
            source_id_to_record: HashMap::new(),
            external_id_to_target_id: HashMap::new(),
            source_to_target: HashMap::new(),
            filtered_value_cache: HashMap::new(),
            actions: Vec::new(),
        }
    }

    pub fn object_name(&self) -> &str {
        &self.descriptor.source_name
    }

    /// Add a source-side record, indexing it by id and, if available, by
    /// external id value.
    pub fn add_source_record(&mut self, record: Record, external_id_value: Option<String>) {
        let idx = self.source_records.len();
        self.source_id_to_record.insert(record.source_id.clone(), idx);
        if let Some(ext) = external_id_value {
            self.external_id_to_source_id.insert(ext, record.source_id.clone());
        }
        self.source_records.push(record);
        self.actions.push(RecordAction::Create);
    }

    pub fn record_by_id(&self, id: &RecordId) -> Option<&Record> {
        self.source_id_to_record.get(id).map(|&i| &self.source_records[i])
    }

    /// Has this `(field, id)` pair already been used in a remote `IN (...)`
    /// query? If not, marks it used and returns false (caller should issue
    /// the query); if already used, returns true (caller must skip it).
    pub fn already_queried(&mut self, field: &str, id: &str) -> bool {
        let set = self.filtered_value_cache.entry(field.to_string()).or_default();
        if set.contains(id) {
            true
        } else {
            set.insert(id.to_string());
            false
        }
    }

    /// Subtract already-queried ids from a candidate set, per spec §4.3's
    /// at-most-once guarantee.
    pub fn unqueried_ids<'a>(&mut self, field: &str, candidates: &'a [String]) -> Vec<&'a str> {
        candidates
            .iter()
            .filter(|id| !self.already_queried(field, id))
            .map(|s| s.as_str())
            .collect()
    }
}

/// For one object: an operation and a batch of prepared records to submit,
/// bound to the API engine that will execute it (spec §4.5).
#[derive(Debug, Clone)]
pub struct EnginePlan {
    pub object: String,
    pub operation: Operation,
    pub engine_kind: crate::engine::EngineKind,
    pub records: Vec<Record>,
}
