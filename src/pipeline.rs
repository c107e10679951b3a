//! The top-level orchestrator (spec §2): wires C1 (query builder & field
//! describe) -> C2 (task graph builder) -> C3 (retrieval driver) -> C4
//! (relationship resolver) -> C5 (API engines) for one run, plus the
//! per-`objectSet` outer loop from spec §9.
//!
//! `run_object_sets` is the crate's single public entry point for a
//! complete run; everything else in this module is its supporting
//! machinery. Callers whose source medium is a CSV directory should run
//! [`crate::csv_repair::repair_source_csvs`] first and feed the repaired
//! rows through a [`crate::transport::Transport`] implementation backed by
//! that mirror (per spec §2: "C6 runs before C3 when the source medium is
//! file") — this crate specifies the repair step and the transport trait,
//! not the glue between a CSV file and the wire-shaped `Transport` calls,
//! since that glue is exactly the kind of transport-construction detail
//! spec §6 leaves to the caller.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::config::RunConfig;
use crate::engine::{
    bulk_v1::BulkV1Engine, bulk_v2::BulkV2Engine, rest::RestEngine, select_engine_kind, ApiEngine,
    EngineKind, RateLimiter,
};
use crate::error::MigrateError;
use crate::graph::{build_task_graph, GraphInput, OrderingMode};
use crate::model::{ObjectDescriptor, ObjectTable, Operation, Record, Task};
use crate::progress::{MissingParent, ProgressSink};
use crate::resolver::resolve_task;
use crate::retrieval::{QueryCache, RetrievalDriver, ScriptedQuery};
use crate::schema::{describe_query, DescribeResult, ParsedQuery};
use crate::script::{ObjectSet, Script, ScriptObject};
use crate::transport::Transport;
use crate::value::{RecordId, Value};

/// By-convention org names this crate looks for in `Script::orgs`: the
/// organization records are extracted *from* and the one they are
/// written *to*. Spec §6's `orgs[]` shape carries no explicit "which one
/// is source" tag, so a run resolves it by name (open question, recorded
/// in DESIGN.md).
pub const SOURCE_ORG_NAME: &str = "source";
pub const TARGET_ORG_NAME: &str = "target";

/// Per-object outcome counts, the terminal report a caller inspects
/// instead of parsing log lines (spec §7: "emitting a final summary").
#[derive(Debug, Clone, Default)]
pub struct TaskSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Resolved but not written: e.g. an update/delete whose target match
    /// never arrived, or a readonly object.
    pub skipped: usize,
}

/// Aggregate report for a complete run (spec §2 control flow, §7 "final
/// summary").
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub per_task: HashMap<String, TaskSummary>,
    pub missing_parents: Vec<MissingParent>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        for (object, summary) in other.per_task {
            let entry = self.per_task.entry(object).or_default();
            entry.inserted += summary.inserted;
            entry.updated += summary.updated;
            entry.deleted += summary.deleted;
            entry.failed += summary.failed;
            entry.skipped += summary.skipped;
        }
        self.missing_parents.extend(other.missing_parents);
        self.warnings.extend(other.warnings);
        self.elapsed += other.elapsed;
    }

    pub fn total_failed(&self) -> usize {
        self.per_task.values().map(|t| t.failed).sum()
    }
}

/// A minimal splitter over the handful of SOQL shapes this crate's script
/// document carries as plain text (`SELECT fields FROM Obj [WHERE ...]
/// [ORDER BY ...] [LIMIT n]`). This is deliberately not a SOQL parser —
/// it does not understand quoted literals containing the keywords it
/// splits on — because a real parser is the out-of-scope script-file
/// parser's job (spec §1); this only bridges that external collaborator's
/// plain-text query into the [`ParsedQuery`] shape [`describe_query`]
/// consumes.
fn split_soql_shape(query: &str, from_object: &str) -> ParsedQuery {
    let upper = query.to_ascii_uppercase();
    let limit = upper
        .rfind(" LIMIT ")
        .and_then(|i| query[i + 7..].trim().parse::<u32>().ok());
    let order_by_start = upper.find(" ORDER BY ");
    let where_start = upper.find(" WHERE ");
    let from_idx = upper.find(" FROM ").map(|i| i + 6);

    let select_end = from_idx.map(|i| i - 6).unwrap_or(query.len());
    let select_clause = query[..select_end]
        .trim_start()
        .trim_start_matches("SELECT")
        .trim_start_matches("select");
    let fields: Vec<String> = select_clause
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    let clause_end = |start: usize| -> usize {
        [where_start, order_by_start, upper.rfind(" LIMIT ")]
            .into_iter()
            .flatten()
            .filter(|&i| i > start)
            .min()
            .unwrap_or(query.len())
    };

    let where_clause = where_start.map(|i| {
        let end = clause_end(i);
        query[i + 7..end].trim().to_string()
    });
    let order_by = order_by_start.map(|i| {
        let end = [where_start, upper.rfind(" LIMIT ")]
            .into_iter()
            .flatten()
            .filter(|&e| e > i)
            .min()
            .unwrap_or(query.len());
        query[i + 10..end].trim().to_string()
    });

    ParsedQuery {
        fields: if fields.is_empty() { vec!["all".to_string()] } else { fields },
        from_object: from_object.to_string(),
        where_clause: where_clause.filter(|s| !s.is_empty()),
        order_by: order_by.filter(|s| !s.is_empty()),
        limit,
    }
}

/// Guess the `FROM` object out of a plain-text query, falling back to the
/// first token after `FROM`. Scripts in this crate's corpus carry the
/// object name as part of the query text per spec §6's `{query, ...}`
/// shape, with no separate `from_object` field.
fn extract_from_object(query: &str) -> Option<String> {
    let upper = query.to_ascii_uppercase();
    let from_idx = upper.find(" FROM ")?;
    let rest = query[from_idx + 6..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// C1 over every `ScriptObject` in one object set: describe each query
/// against the caller-supplied (already fetched) source/target field
/// metadata, apply field-mapping renames, and index readonly/process-all
/// hints the task graph builder needs.
struct DescribedSet {
    objects: ObjectTable,
    readonly: HashSet<String>,
    process_all: HashSet<String>,
    declared_order: Vec<String>,
    scripted_queries: HashMap<String, ScriptedQuery>,
    warnings: Vec<String>,
}

fn describe_object_set(
    set: &ObjectSet,
    source_schema: &ObjectTable,
    target_schema: &ObjectTable,
) -> Result<DescribedSet, MigrateError> {
    let mut objects = ObjectTable::new();
    let mut readonly = HashSet::new();
    let mut process_all = HashSet::new();
    let mut declared_order = Vec::new();
    let mut scripted_queries = HashMap::new();
    let mut warnings = Vec::new();

    for script_object in &set.objects {
        let from_object = extract_from_object(&script_object.query).ok_or_else(|| {
            MigrateError::query_malformed(format!(
                "could not find FROM clause in query '{}'",
                script_object.query
            ))
        })?;
        let parsed = split_soql_shape(&script_object.query, &from_object);

        let DescribeResult { mut descriptor, warnings: w } = describe_query(
            &parsed,
            &script_object.external_id,
            &script_object.multiselect_pattern,
            source_schema,
            target_schema,
            script_object.operation,
            &script_object.excluded_fields,
        )?;
        warnings.extend(w);

        for (from, to) in &script_object.field_mapping {
            if descriptor.source_name == *from {
                descriptor.target_name = to.clone();
            }
        }

        if script_object.operation == Operation::Readonly {
            readonly.insert(descriptor.source_name.clone());
        }
        if script_object.all_records {
            process_all.insert(descriptor.source_name.clone());
        }
        scripted_queries.insert(
            descriptor.source_name.clone(),
            ScriptedQuery {
                where_clause: parsed.where_clause.clone(),
                order_by: parsed.order_by.clone(),
                limit: parsed.limit,
            },
        );
        declared_order.push(descriptor.source_name.clone());
        objects.insert(descriptor);
    }

    Ok(DescribedSet { objects, readonly, process_all, declared_order, scripted_queries, warnings })
}

/// External id value for a record, mirroring the extraction in
/// [`crate::retrieval`] and [`crate::resolver`]: a single field for a
/// simple declaration, a `;`-joined concatenation of segment values for a
/// composite one (spec §4.1).
fn external_id_value(descriptor: &ObjectDescriptor, record: &Record) -> Option<String> {
    let segments = descriptor.external_id.segments();
    if segments.len() == 1 {
        let seg = &segments[0];
        let v = if seg == "Id" {
            Some(record.source_id.to_string())
        } else {
            record.get(seg).map(|v| v.to_string())
        };
        return v.filter(|s| !s.is_empty());
    }
    let mut parts = Vec::with_capacity(segments.len());
    for seg in segments {
        parts.push(record.get(seg).map(|v| v.to_string()).unwrap_or_default());
    }
    Some(parts.join(";"))
}

/// Strip the public `Id` field for an insert-shaped write, or resolve it
/// to the already-matched target id for an update/delete-shaped write.
/// Returns `None` when a write needs a target match that never arrived
/// (spec §4.4: resolution "depends on task order ... for updates/deletes
/// being present").
fn prepare_write_record(operation: Operation, task: &Task, resolved: Record) -> Option<Record> {
    let target_id = task.source_to_target.get(&resolved.source_id).cloned();
    match operation {
        Operation::Insert => {
            let mut record = resolved;
            record.fields.remove("Id");
            Some(record)
        }
        Operation::Upsert => {
            let mut record = resolved;
            if let Some(id) = target_id {
                record.set("Id", Value::Id(id));
            } else {
                record.fields.remove("Id");
            }
            Some(record)
        }
        Operation::Update | Operation::Delete => {
            let mut record = resolved;
            let id = target_id?;
            record.set("Id", Value::Id(id));
            Some(record)
        }
        Operation::Readonly => None,
    }
}

async fn run_engine_for_task<T: Transport>(
    transport: &T,
    target_org: &crate::script::OrgConnection,
    descriptor: &ObjectDescriptor,
    records: Vec<Record>,
    config: &RunConfig,
    rate_limiter: RateLimiter,
    progress: &dyn ProgressSink,
) -> Result<crate::engine::EngineResults, MigrateError> {
    let kind = select_engine_kind(records.len(), config, &descriptor.source_name, false);
    let field_order: Vec<String> = descriptor.fields.iter().map(|f| f.name.clone()).collect();
    let operation = descriptor.operation;

    match kind {
        EngineKind::Rest => {
            let engine = RestEngine::new(
                transport,
                target_org,
                descriptor.target_name.clone(),
                operation,
                config.all_or_none,
                rate_limiter,
            );
            let plan = engine.prepare_batches(records);
            engine.execute(plan, progress).await
        }
        EngineKind::BulkV1 => {
            let engine = BulkV1Engine::new(
                transport,
                target_org,
                descriptor.target_name.clone(),
                operation,
                field_order,
                config,
                rate_limiter,
            );
            let plan = engine.prepare_batches(records);
            engine.execute(plan, progress).await
        }
        EngineKind::BulkV2 => {
            let engine = BulkV2Engine::new(
                transport,
                target_org,
                descriptor.target_name.clone(),
                operation,
                field_order,
                config,
                rate_limiter,
            );
            let plan = engine.prepare_batches(records);
            engine.execute(plan, progress).await
        }
    }
}

/// Run one object set end to end: C1 (already described by the caller
/// into `source_schema`/`target_schema`) -> C2 -> C3 -> C4 -> C5.
pub async fn run_pipeline<T: Transport>(
    set: &ObjectSet,
    script: &Script,
    source_schema: &ObjectTable,
    target_schema: &ObjectTable,
    transport: &T,
    progress: &dyn ProgressSink,
    config: &RunConfig,
    query_cache: &QueryCache,
) -> Result<RunSummary, MigrateError> {
    let started = Instant::now();

    let source_org = script
        .org(SOURCE_ORG_NAME)
        .ok_or_else(|| MigrateError::schema(format!("no org named '{SOURCE_ORG_NAME}' in script")))?;
    let target_org = script
        .org(TARGET_ORG_NAME)
        .ok_or_else(|| MigrateError::schema(format!("no org named '{TARGET_ORG_NAME}' in script")))?;

    let described = describe_object_set(set, source_schema, target_schema)
        .context("describing object set's queries against source/target schema")
        .map_err(|e| MigrateError::query_malformed(e.to_string()))?;

    let graph_mode = if script.options.keep_object_order_while_execute {
        OrderingMode::Preserve
    } else {
        OrderingMode::Smart
    };
    let graph = build_task_graph(
        &GraphInput {
            objects: &described.objects,
            declared_order: described.declared_order.clone(),
            readonly: described.readonly.clone(),
            process_all: described.process_all.clone(),
        },
        graph_mode,
    );

    let mut tasks: HashMap<String, Task> = described
        .objects
        .iter()
        .map(|d| (d.source_name.clone(), Task::new(d.clone())))
        .collect();

    let driver = RetrievalDriver::with_cache(transport, progress, config, query_cache);
    driver
        .retrieve_source_primary(source_org, &mut tasks, &graph.query_order, &described.scripted_queries)
        .await?;
    driver
        .retrieve_source_backward_closure(source_org, &mut tasks, &described.objects)
        .await?;
    driver.retrieve_target(target_org, &mut tasks, &described.process_all).await?;

    let rate_limiter = RateLimiter::new(config.rate_limit.clone());
    let mut summary = RunSummary::default();
    summary.warnings = described.warnings.clone();

    for object in &graph.task_order {
        let Some(descriptor) = described.objects.get(object) else { continue };
        if !descriptor.operation.is_write() {
            let mut task_summary = TaskSummary::default();
            if let Some(task) = tasks.get(object) {
                task_summary.skipped = task.source_records.len();
            }
            summary.per_task.insert(object.clone(), task_summary);
            continue;
        }

        // Scoped so the immutable borrows of `tasks` (for this task and its
        // parents) end before the write path needs a mutable one to feed
        // freshly assigned target ids back into `source_to_target` for
        // children processed later in `task_order`.
        let (write_records, mut task_summary) = {
            let parent_tasks: HashMap<String, &Task> = descriptor
                .lookup_fields()
                .flat_map(|f| f.referenced_objects.iter())
                .filter_map(|parent| tasks.get(parent).map(|t| (parent.clone(), t)))
                .collect();

            let Some(task) = tasks.get(object) else { continue };
            let outcome = resolve_task(task, &parent_tasks, &described.objects);
            summary.missing_parents.extend(outcome.missing_parents);

            let mut write_records = Vec::with_capacity(outcome.resolved_records.len());
            let mut skipped = 0usize;
            for resolved in outcome.resolved_records {
                match prepare_write_record(descriptor.operation, task, resolved) {
                    Some(record) => write_records.push(record),
                    None => skipped += 1,
                }
            }
            (write_records, TaskSummary { skipped, ..Default::default() })
        };

        if !write_records.is_empty() {
            // Captured before the records move into the engine: the
            // freshly assigned target id for an insert/upsert is the only
            // way a child processed later in `task_order` can resolve a
            // lookup against a parent that did not already exist on the
            // target (spec §4.4 depends on task order placing parents
            // first specifically so this closes within one run).
            let external_ids: HashMap<RecordId, String> = write_records
                .iter()
                .filter_map(|r| external_id_value(descriptor, r).map(|ext| (r.source_id.clone(), ext)))
                .collect();

            let results = run_engine_for_task(
                transport,
                target_org,
                descriptor,
                write_records,
                config,
                rate_limiter.clone(),
                progress,
            )
            .await?;

            if let Some(task) = tasks.get_mut(object) {
                for result in &results.results {
                    if let Some(target_id) = &result.target_id {
                        task.source_to_target.insert(result.source_id.clone(), target_id.clone());
                        if let Some(ext) = external_ids.get(&result.source_id) {
                            task.external_id_to_target_id.insert(ext.clone(), target_id.clone());
                        }
                    }
                }
            }

            for result in &results.results {
                if result.is_success() {
                    match descriptor.operation {
                        Operation::Insert | Operation::Upsert => task_summary.inserted += 1,
                        Operation::Update => task_summary.updated += 1,
                        Operation::Delete => task_summary.deleted += 1,
                        Operation::Readonly => {}
                    }
                } else {
                    task_summary.failed += 1;
                }
            }
        }
        summary.per_task.insert(object.clone(), task_summary);
    }

    summary.elapsed = started.elapsed();
    Ok(summary)
}

/// Run every `objectSet` in the script as an isolated sub-job, aggregating
/// their summaries (spec §9: "the outer runner invokes the pipeline once
/// per set"). `repaired_dir_for` is consulted by CSV-medium callers to
/// locate the per-set `object-set-<n>` mirror directory (spec §6); a
/// transport-backed (org-to-org) run can ignore it.
pub async fn run_object_sets<T: Transport>(
    script: &Script,
    source_schema: &ObjectTable,
    target_schema: &ObjectTable,
    transport: &T,
    progress: &dyn ProgressSink,
    config: &RunConfig,
) -> Result<RunSummary, MigrateError> {
    // Built once for the whole run so `CleanFileCache` purges exactly once
    // (spec §4.3) and a later object set can reuse an earlier one's cached
    // query results instead of re-querying overlapping objects.
    let query_cache = QueryCache::new(config.source_records_cache, &config.cache_dir)?;

    let mut summary = RunSummary::default();
    for set in &script.object_sets {
        let set_summary = run_pipeline(
            set,
            script,
            source_schema,
            target_schema,
            transport,
            progress,
            config,
            &query_cache,
        )
        .await?;
        summary.merge(set_summary);
    }
    Ok(summary)
}

/// The on-disk subdirectory name for one object set's mirrored CSV output
/// (spec §9: "own source/target subdirectories (`object-set-<n>`)").
pub fn object_set_dir_name(index: usize) -> String {
    format!("object-set-{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_soql_shape_extracts_all_clauses() {
        let parsed = split_soql_shape(
            "SELECT Id, Amount FROM Opportunity WHERE Amount > 10000 ORDER BY CreatedDate LIMIT 50",
            "Opportunity",
        );
        assert_eq!(parsed.fields, vec!["Id".to_string(), "Amount".to_string()]);
        assert_eq!(parsed.where_clause.as_deref(), Some("Amount > 10000"));
        assert_eq!(parsed.order_by.as_deref(), Some("CreatedDate"));
        assert_eq!(parsed.limit, Some(50));
    }

    #[test]
    fn split_soql_shape_handles_bare_select_all() {
        let parsed = split_soql_shape("SELECT all FROM Account", "Account");
        assert_eq!(parsed.fields, vec!["all".to_string()]);
        assert!(parsed.where_clause.is_none());
        assert!(parsed.order_by.is_none());
        assert!(parsed.limit.is_none());
    }

    #[test]
    fn extract_from_object_finds_object_name() {
        assert_eq!(
            extract_from_object("SELECT Id FROM Account WHERE Name = 'Acme'"),
            Some("Account".to_string())
        );
        assert_eq!(extract_from_object("not a query"), None);
    }

    #[test]
    fn object_set_dir_name_matches_spec_convention() {
        assert_eq!(object_set_dir_name(0), "object-set-0");
        assert_eq!(object_set_dir_name(3), "object-set-3");
    }

    #[test]
    fn prepare_write_record_strips_id_for_insert() {
        use crate::model::{ComplexField, FieldDescriptor, FieldType};
        use crate::value::RecordId;

        let descriptor = ObjectDescriptor {
            source_name: "Account".into(),
            target_name: "Account".into(),
            external_id: ComplexField::parse("Name").unwrap(),
            operation: Operation::Insert,
            fields: vec![FieldDescriptor::simple("Name", FieldType::String)],
            priority: 0,
        };
        let task = Task::new(descriptor);
        let mut record = Record::new(RecordId::new("001xx000000001AAA"));
        record.set("Id", Value::Id(RecordId::new("001xx000000001AAA")));
        record.set("Name", Value::String("Acme".into()));

        let prepared = prepare_write_record(Operation::Insert, &task, record).unwrap();
        assert!(prepared.get("Id").is_none());
    }

    #[test]
    fn prepare_write_record_skips_update_without_target_match() {
        use crate::model::{ComplexField, FieldDescriptor, FieldType};
        use crate::value::RecordId;

        let descriptor = ObjectDescriptor {
            source_name: "Account".into(),
            target_name: "Account".into(),
            external_id: ComplexField::parse("Name").unwrap(),
            operation: Operation::Update,
            fields: vec![FieldDescriptor::simple("Name", FieldType::String)],
            priority: 0,
        };
        let task = Task::new(descriptor);
        let record = Record::new(RecordId::new("001xx000000001AAA"));

        assert!(prepare_write_record(Operation::Update, &task, record).is_none());
    }

    #[test]
    fn prepare_write_record_resolves_id_for_update_with_target_match() {
        use crate::model::{ComplexField, FieldDescriptor, FieldType};
        use crate::value::RecordId;

        let descriptor = ObjectDescriptor {
            source_name: "Account".into(),
            target_name: "Account".into(),
            external_id: ComplexField::parse("Name").unwrap(),
            operation: Operation::Update,
            fields: vec![FieldDescriptor::simple("Name", FieldType::String)],
            priority: 0,
        };
        let mut task = Task::new(descriptor);
        let source_id = RecordId::new("001xx000000001AAA");
        let target_id = RecordId::new("001TT000000001AAA");
        task.source_to_target.insert(source_id.clone(), target_id.clone());

        let record = Record::new(source_id);
        let prepared = prepare_write_record(Operation::Update, &task, record).unwrap();
        assert_eq!(prepared.get("Id"), Some(&Value::Id(target_id)));
    }
}
