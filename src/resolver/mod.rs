//! Relationship resolver (C4, spec §4.4): rewrites every lookup field on
//! every source record into the matching target id, or records a
//! [`MissingParent`] and writes null.
//!
//! Resolution never mutates a source record in place (it is read-only over
//! the retrieval driver's output); it produces a fresh [`Record`] per
//! source row plus a parallel list of [`MissingParent`] rows, so the
//! resolver can run again on retry without double-counting.
//!
//! The four-hop lookup is, per field, per record:
//! 1. read the source-side lookup id from the record,
//! 2. skip (leave null) if it is absent,
//! 3. look up the parent task's source record by that id to obtain its
//!    external id value,
//! 4. look up the parent task's `external_id_to_target_id` by that value to
//!    obtain the target id to write.

use std::collections::HashMap;

use crate::model::{ObjectDescriptor, ObjectTable, Record, Task};
use crate::progress::MissingParent;
use crate::value::Value;

/// External id value for a parent record, mirroring
/// [`crate::retrieval`]'s own external-id extraction: a single field for a
/// simple declaration, a `;`-joined concatenation of segment values for a
/// composite one (spec §4.1).
fn external_id_value(descriptor: Option<&ObjectDescriptor>, record: &Record) -> Option<String> {
    let descriptor = descriptor?;
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

/// Flag field distinguishing person-account/person-contact records, whose
/// excluded-field list differs from ordinary Account/Contact records (spec
/// §4.4's person-account partitioning note).
const PERSON_ACCOUNT_FLAG: &str = "IsPersonAccount";

/// Fields that must never be carried over for a person-account partition
/// (they belong to the synthetic contact half of the record and are
/// rejected by the API on the account half, or vice versa).
const PERSON_ACCOUNT_EXCLUDED_FIELDS: &[&str] = &["FirstName", "LastName", "Salutation"];
const PERSON_CONTACT_EXCLUDED_FIELDS: &[&str] = &["Name"];

pub struct ResolveOutcome {
    pub resolved_records: Vec<Record>,
    pub missing_parents: Vec<MissingParent>,
}

/// Resolve every lookup field on `task`'s source records against the already
/// retrieved parent tasks, returning target-ready records plus any missing
/// parent reports. Read-only: does not mutate `task` or `parent_tasks`.
pub fn resolve_task(task: &Task, parent_tasks: &HashMap<String, &Task>, objects: &ObjectTable) -> ResolveOutcome {
    let descriptor = match objects.get(task.object_name()) {
        Some(d) => d,
        None => return ResolveOutcome { resolved_records: Vec::new(), missing_parents: Vec::new() },
    };

    let lookup_fields: Vec<_> = descriptor.lookup_fields().collect();
    let is_person_partition = is_person_account_object(task.object_name());

    let mut resolved_records = Vec::with_capacity(task.source_records.len());
    let mut missing_parents = Vec::new();

    for source_record in &task.source_records {
        let mut out = Record::new(source_record.source_id.clone());
        for (name, value) in &source_record.fields {
            if is_person_partition && excluded_for_partition(task.object_name(), source_record, name) {
                continue;
            }
            out.set(name.clone(), value.clone());
        }

        for field in &lookup_fields {
            let Some(Value::Id(child_side_id)) = source_record.get(&field.name) else {
                continue;
            };

            // Try every candidate parent object in declaration order (the
            // resolver has no pinned-candidate syntax to prefer one, per
            // spec §9's polymorphic note — it just tries each); remember the
            // closest miss so we can still emit a report if none resolve.
            let mut resolved = None;
            let mut miss_object: Option<&str> = None;
            let mut miss_external_id: Option<String> = None;

            for referenced in &field.referenced_objects {
                let Some(parent_task) = parent_tasks.get(referenced) else {
                    if miss_object.is_none() {
                        miss_object = Some(referenced.as_str());
                    }
                    continue;
                };
                // Either the parent record was never retrieved at all, or it
                // was retrieved but has no matching target row yet — both are
                // a miss, just reported under a different `external_id` (the
                // raw lookup id when the record itself is unknown).
                let parent_external_id = parent_task
                    .record_by_id(child_side_id)
                    .and_then(|record| external_id_value(objects.get(referenced), record));

                if let Some(ext) = &parent_external_id {
                    if let Some(target_id) = parent_task.external_id_to_target_id.get(ext) {
                        resolved = Some(target_id.clone());
                        break;
                    }
                }

                // A candidate whose source record was actually found is a
                // closer miss than one that was never retrieved at all;
                // prefer reporting it if we end up not resolving anything.
                if parent_external_id.is_some() || miss_object.is_none() {
                    miss_object = Some(referenced.as_str());
                    miss_external_id = parent_external_id.or(miss_external_id);
                }
            }

            match resolved {
                Some(target_id) => out.set(field.name.clone(), Value::Id(target_id)),
                None => {
                    out.set(field.name.clone(), Value::Null);
                    let parent_object = miss_object
                        .or_else(|| field.referenced_objects.first().map(|s| s.as_str()))
                        .unwrap_or_default();
                    missing_parents.push(MissingParent {
                        child_object: task.object_name().to_string(),
                        child_field: field.name.clone(),
                        external_id: miss_external_id.unwrap_or_else(|| child_side_id.to_string()),
                        parent_object: parent_object.to_string(),
                        parent_external_id_field: objects
                            .get(parent_object)
                            .map(|d| d.external_id.to_string())
                            .unwrap_or_default(),
                    });
                }
            }
        }

        resolved_records.push(out);
    }

    ResolveOutcome { resolved_records, missing_parents }
}

fn is_person_account_object(object: &str) -> bool {
    object == "Account" || object == "Contact"
}

fn excluded_for_partition(object: &str, record: &Record, field_name: &str) -> bool {
    let is_person = record
        .get(PERSON_ACCOUNT_FLAG)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !is_person {
        return false;
    }
    match object {
        "Account" => PERSON_ACCOUNT_EXCLUDED_FIELDS.contains(&field_name),
        "Contact" => PERSON_CONTACT_EXCLUDED_FIELDS.contains(&field_name),
        _ => false,
    }
}
