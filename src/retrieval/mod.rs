//! Retrieval driver (C3, spec §4.3 — "the hardest part"): pulls source and
//! target records for a described object set, chasing lookup relationships
//! backward and forward until every record needed to resolve every declared
//! lookup has been seen, without ever re-querying the same id twice.
//!
//! The driver runs in passes:
//!
//! - **F1 (forward primary)**: each task's own declared query (bounded or
//!   `all_records`), against the source org.
//! - **B1/B2 (backward parents)**: any lookup id values discovered in F1
//!   whose referenced object was not itself queried with that id land in an
//!   `IN (...)` pull against the parent's own task, repeated to a fixed
//!   point so a self-referencing hierarchy (`Account.ParentId`) or a
//!   multi-hop chain closes completely.
//! - **Target pass**: one query per task against the target org, filtered to
//!   the external id values already known from the source side (or
//!   unfiltered for `all_records` objects), populating
//!   `external_id_to_target_id` and `source_to_target`.
//!
//! Every `IN (...)` pull is deduplicated through [`Task::unqueried_ids`], the
//! at-most-once guarantee named in spec §8.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::Semaphore;

use crate::config::RunConfig;
use crate::error::MigrateError;
use crate::model::{FieldType, ObjectDescriptor, ObjectTable, Record, Task};
use crate::progress::{ProgressEvent, ProgressSink, RetrievalSide};
use crate::script::OrgConnection;
use crate::transport::Transport;
use crate::value::{RecordId, Value};

pub use cache::QueryCache;

/// Salesforce SOQL `WHERE field IN (...)` clauses are capped well under the
/// platform's statement-length limit; this budget leaves headroom for the
/// surrounding `SELECT ... FROM ... WHERE` text.
const MAX_IN_CLAUSE_CHARS: usize = 3_900;
/// Bound on backward-closure rounds before giving up on further discovery
/// (mirrors the task graph builder's own bubble-pass cap).
const MAX_BACKWARD_PASSES: usize = 10;
/// Emit a `RowsReceived` progress event every this many records.
const PROGRESS_EVERY: usize = 200;

fn escape_soql_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Split a candidate id set into `field IN ('a','b',...)` clauses, each kept
/// under [`MAX_IN_CLAUSE_CHARS`].
fn chunk_in_clauses(field: &str, ids: &[&str]) -> Vec<String> {
    let mut clauses = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = field.len() + 5; // " IN ()"

    for id in ids {
        let literal = format!("'{}'", escape_soql_literal(id));
        let added = literal.len() + 1; // comma
        if !current.is_empty() && current_len + added > MAX_IN_CLAUSE_CHARS {
            clauses.push(format!("{field} IN ({})", current.join(",")));
            current.clear();
            current_len = field.len() + 5;
        }
        current_len += added;
        current.push(literal);
    }
    if !current.is_empty() {
        clauses.push(format!("{field} IN ({})", current.join(",")));
    }
    clauses
}

fn build_select(descriptor: &ObjectDescriptor) -> String {
    let mut names: Vec<&str> = vec!["Id"];
    for field in &descriptor.fields {
        if field.name != "Id" && !names.contains(&field.name.as_str()) {
            names.push(&field.name);
        }
    }
    format!("SELECT {} FROM {}", names.join(", "), descriptor.source_name)
}

fn value_from_json_typed(json: &Json, field_type: &FieldType) -> Value {
    if json.is_null() {
        return Value::Null;
    }
    match field_type {
        FieldType::Id | FieldType::Reference => json
            .as_str()
            .map(|s| Value::Id(RecordId::new(s)))
            .unwrap_or(Value::Null),
        FieldType::Picklist | FieldType::MultiPicklist => json
            .as_str()
            .map(|s| Value::Picklist(s.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::from_json(json),
    }
}

/// Build a [`Record`] from one row of a query result, using the descriptor's
/// field types to disambiguate ids and picklists from plain strings.
fn record_from_json(descriptor: &ObjectDescriptor, row: &Json) -> Record {
    let id = row.get("Id").and_then(|v| v.as_str()).unwrap_or_default();
    let mut record = Record::new(RecordId::new(id));
    for field in &descriptor.fields {
        if let Some(raw) = row.get(&field.name) {
            record.set(field.name.clone(), value_from_json_typed(raw, &field.field_type));
        }
    }
    record
}

/// External id value for a record, following [`ObjectDescriptor::external_id`]:
/// a single field for a simple declaration, or a `;`-joined concatenation of
/// each segment's value for a composite one (spec §4.1).
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
        let v = record.get(seg).map(|v| v.to_string()).unwrap_or_default();
        parts.push(v);
    }
    Some(parts.join(";"))
}

pub struct RetrievalDriver<'a, T: Transport> {
    pub transport: &'a T,
    pub progress: &'a dyn ProgressSink,
    pub config: &'a RunConfig,
    /// Source-side query cache (spec §4.3); `None` means every query goes
    /// straight to the network, which is also what an `InMemory` cache
    /// amounts to once the driver itself is dropped at the end of a run.
    cache: Option<&'a QueryCache>,
}

impl<'a, T: Transport> RetrievalDriver<'a, T> {
    pub fn new(transport: &'a T, progress: &'a dyn ProgressSink, config: &'a RunConfig) -> Self {
        RetrievalDriver { transport, progress, config, cache: None }
    }

    pub fn with_cache(transport: &'a T, progress: &'a dyn ProgressSink, config: &'a RunConfig, cache: &'a QueryCache) -> Self {
        RetrievalDriver { transport, progress, config, cache: Some(cache) }
    }

    /// Fetch every page of `soql`, consulting and then populating the
    /// source-side cache around the network call instead of inside the
    /// pagination loop, so a cache hit skips `nextRecordsUrl` pagination
    /// entirely.
    async fn fetch_all_rows(&self, org: &OrgConnection, object: &str, soql: &str) -> Result<Vec<Json>, MigrateError> {
        if let Some(cache) = self.cache {
            if let Some(rows) = cache.get(object, soql) {
                return Ok(rows);
            }
        }
        let mut rows = Vec::new();
        let mut page = self.transport.query(org, soql).await?;
        loop {
            rows.extend(page.records.iter().cloned());
            if page.done {
                break;
            }
            let Some(next) = page.next_records_url.clone() else { break };
            page = self.transport.query_more(org, &next).await?;
        }
        if let Some(cache) = self.cache {
            cache.put(object, soql, &rows)?;
        }
        Ok(rows)
    }

    /// Run one task's own query (F1) and store the results.
    async fn run_primary_query(
        &self,
        org: &OrgConnection,
        task: &mut Task,
        where_clause: Option<&str>,
        order_by: Option<&str>,
        limit: Option<u32>,
    ) -> Result<(), MigrateError> {
        let mut soql = build_select(&task.descriptor);
        if let Some(w) = where_clause {
            soql.push_str(" WHERE ");
            soql.push_str(w);
        }
        if let Some(o) = order_by {
            soql.push_str(" ORDER BY ");
            soql.push_str(o);
        }
        if let Some(l) = limit {
            soql.push_str(&format!(" LIMIT {l}"));
        }
        self.progress.on_event(ProgressEvent::OperationStarted { object: task.object_name().to_string() });
        self.run_query_into_task(org, task, &soql, RetrievalSide::Source).await
    }

    /// Stream one SOQL query (following `nextRecordsUrl` pagination) and fold
    /// every row into `task.source_records`.
    async fn run_query_into_task(
        &self,
        org: &OrgConnection,
        task: &mut Task,
        soql: &str,
        side: RetrievalSide,
    ) -> Result<(), MigrateError> {
        let rows = self.fetch_all_rows(org, task.object_name(), soql).await?;
        let mut total = 0usize;
        for row in &rows {
            let record = record_from_json(&task.descriptor, row);
            let ext = external_id_value(&task.descriptor, &record);
            task.add_source_record(record, ext);
            total += 1;
            if total % PROGRESS_EVERY == 0 {
                self.progress.on_event(ProgressEvent::RowsReceived {
                    object: task.object_name().to_string(),
                    side,
                    rows_so_far: total,
                });
            }
        }
        self.progress.on_event(ProgressEvent::RowsReceived {
            object: task.object_name().to_string(),
            side,
            rows_so_far: total,
        });
        Ok(())
    }

    /// F1: run every task's declared query against the source org.
    pub async fn retrieve_source_primary(
        &self,
        org: &OrgConnection,
        tasks: &mut HashMap<String, Task>,
        query_order: &[String],
        queries: &HashMap<String, ScriptedQuery>,
    ) -> Result<(), MigrateError> {
        for object in query_order {
            let Some(task) = tasks.get_mut(object) else { continue };
            let scripted = queries.get(object);
            let where_clause = scripted.and_then(|q| q.where_clause.as_deref());
            let order_by = scripted.and_then(|q| q.order_by.as_deref());
            let limit = scripted.and_then(|q| q.limit);
            self.run_primary_query(org, task, where_clause, order_by, limit).await?;
        }
        Ok(())
    }

    /// B1/B2: discover ids referenced by lookup fields that point at an
    /// object whose record has not been fetched, and pull them in `IN (...)`
    /// batches against that object's own task, until a pass adds nothing new
    /// or [`MAX_BACKWARD_PASSES`] is reached. Closes self-references
    /// (`Account.ParentId`) and multi-hop parent chains alike.
    pub async fn retrieve_source_backward_closure(
        &self,
        org: &OrgConnection,
        tasks: &mut HashMap<String, Task>,
        objects: &ObjectTable,
    ) -> Result<(), MigrateError> {
        for _pass in 0..MAX_BACKWARD_PASSES {
            let wanted = self.collect_missing_parent_ids(tasks, objects);
            if wanted.is_empty() {
                return Ok(());
            }

            let mut added_any = false;
            for (parent_object, ids) in wanted {
                let Some(task) = tasks.get_mut(&parent_object) else { continue };
                let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
                let fresh: Vec<String> = task.unqueried_ids("Id", &id_refs.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                    .into_iter()
                    .map(|s| s.to_string())
                    .collect();
                if fresh.is_empty() {
                    continue;
                }
                let fresh_refs: Vec<&str> = fresh.iter().map(|s| s.as_str()).collect();
                for clause in chunk_in_clauses("Id", &fresh_refs) {
                    self.run_query_into_task(org, task, &format!("{} WHERE {clause}", build_select(&task.descriptor)), RetrievalSide::Source).await?;
                    added_any = true;
                }
            }
            if !added_any {
                return Ok(());
            }
        }
        Ok(())
    }

    /// For every task, every lookup field, every record: if the referenced
    /// id is not covered by `source_id_to_record` on the parent task, queue
    /// it for a backward pull.
    fn collect_missing_parent_ids(
        &self,
        tasks: &HashMap<String, Task>,
        objects: &ObjectTable,
    ) -> HashMap<String, Vec<String>> {
        let mut wanted: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks.values() {
            let Some(descriptor) = objects.get(task.object_name()) else { continue };
            for field in descriptor.lookup_fields() {
                for referenced in &field.referenced_objects {
                    let Some(parent_task) = tasks.get(referenced) else { continue };
                    for record in &task.source_records {
                        let Some(Value::Id(id)) = record.get(&field.name) else { continue };
                        if !parent_task.source_id_to_record.contains_key(id) {
                            wanted.entry(referenced.clone()).or_default().push(id.to_string());
                        }
                    }
                }
            }
        }
        wanted
    }

    /// Target pass: one query per writable task, filtered to already-known
    /// external id values (or unfiltered for `all_records` objects),
    /// populating `external_id_to_target_id` and `source_to_target`.
    pub async fn retrieve_target(
        &self,
        org: &OrgConnection,
        tasks: &mut HashMap<String, Task>,
        process_all: &std::collections::HashSet<String>,
    ) -> Result<(), MigrateError> {
        for task in tasks.values_mut() {
            if !task.descriptor.operation.is_write() {
                continue;
            }
            let leaf = external_id_select_expr(task);
            let object = task.object_name().to_string();
            let all = process_all.contains(&object);

            let ext_values: Vec<String> = task.external_id_to_source_id.keys().cloned().collect();
            self.progress.on_event(ProgressEvent::OperationStarted { object: object.clone() });

            if all || ext_values.is_empty() {
                let soql = build_select(&task.descriptor);
                self.run_target_pass_one(org, task, &soql, &leaf).await?;
                continue;
            }

            let refs: Vec<&str> = ext_values.iter().map(|s| s.as_str()).collect();
            for clause in chunk_in_clauses(&leaf, &refs) {
                let soql = format!("{} WHERE {clause}", build_select(&task.descriptor));
                self.run_target_pass_one(org, task, &soql, &leaf).await?;
            }
        }
        Ok(())
    }

    async fn run_target_pass_one(
        &self,
        org: &OrgConnection,
        task: &mut Task,
        soql: &str,
        _leaf: &str,
    ) -> Result<(), MigrateError> {
        let mut page = self.transport.query(org, soql).await?;
        let mut total = 0usize;
        loop {
            for row in &page.records {
                let record = record_from_json(&task.descriptor, row);
                if let Some(ext) = external_id_value(&task.descriptor, &record) {
                    task.external_id_to_target_id.insert(ext.clone(), record.source_id.clone());
                    if let Some(source_id) = task.external_id_to_source_id.get(&ext) {
                        task.source_to_target.insert(source_id.clone(), record.source_id.clone());
                    }
                }
                task.target_records.push(record);
                total += 1;
                if total % PROGRESS_EVERY == 0 {
                    self.progress.on_event(ProgressEvent::RowsReceived {
                        object: task.object_name().to_string(),
                        side: RetrievalSide::Target,
                        rows_so_far: total,
                    });
                }
            }
            if page.done {
                break;
            }
            let Some(next) = page.next_records_url.clone() else { break };
            page = self.transport.query_more(org, &next).await?;
        }
        Ok(())
    }

    /// Fetch blob content for a binary-bearing object (e.g. `Attachment.Body`),
    /// bounded by `config.concurrency.parallel_binary_downloads`.
    pub async fn download_blobs(
        &self,
        org: &OrgConnection,
        urls: Vec<(RecordId, String)>,
    ) -> Result<HashMap<RecordId, Vec<u8>>, MigrateError> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.parallel_binary_downloads.max(1)));
        let mut futures = Vec::with_capacity(urls.len());
        for (id, url) in urls {
            let semaphore = semaphore.clone();
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore is never closed");
                let bytes = self.transport.get_blob(org, &url).await?;
                Ok::<_, MigrateError>((id, bytes))
            });
        }
        let results = futures::future::join_all(futures).await;
        results.into_iter().collect()
    }
}

/// The SOQL fragments a script's object entry contributes to a query beyond
/// the field list the describer already expanded.
#[derive(Debug, Clone, Default)]
pub struct ScriptedQuery {
    pub where_clause: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<u32>,
}

fn external_id_select_expr(task: &Task) -> String {
    let segments = task.descriptor.external_id.segments();
    if segments.len() == 1 {
        segments[0].clone()
    } else {
        // composite external ids are not a literal SOQL column; target-side
        // matching falls back to Id and relies on `source_to_target` being
        // populated via the component fields already selected.
        "Id".to_string()
    }
}
