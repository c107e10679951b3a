//! CSV source repair (C6, spec §4.6): when the source medium is a flat
//! CSV file per object, every file is inspected and rewritten before the
//! retrieval driver ever runs, so later stages always see id-shaped
//! values they can match on.
//!
//! Four passes, in order: header trim, value mapping, missing `Id`
//! synthesis, then lookup id/`__r` pair reconciliation (which depends on
//! every object already having a complete `Id` column). Repaired files are
//! written to a mirror directory; the originals are never touched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::MigrateError;
use crate::model::{ObjectDescriptor, ObjectTable};
use crate::progress::MissingParent;

/// One CSV row as a column-name -> raw-text map.
pub type CsvRow = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct RepairedObject {
    pub object: String,
    pub columns: Vec<String>,
    pub rows: Vec<CsvRow>,
}

pub struct RepairOutcome {
    pub objects: HashMap<String, RepairedObject>,
    pub missing_parents: Vec<MissingParent>,
}

/// `(object, field) -> (raw value -> replacement value)`, the value-mapping
/// configuration named in spec §4.6 step 2.
pub type ValueMappings = HashMap<(String, String), HashMap<String, String>>;

/// Repair every described object's CSV under `source_dir`, writing the
/// mirror to `repaired_dir`.
pub fn repair_source_csvs(
    source_dir: &Path,
    repaired_dir: &Path,
    objects: &ObjectTable,
    value_mappings: &ValueMappings,
) -> Result<RepairOutcome, MigrateError> {
    let mut loaded: HashMap<String, RepairedObject> = HashMap::new();
    for descriptor in objects.iter() {
        let path = object_csv_path(source_dir, &descriptor.source_name);
        if !path.exists() {
            continue;
        }
        let (columns, rows) = read_csv(&path)?;
        loaded.insert(descriptor.source_name.clone(), RepairedObject { object: descriptor.source_name.clone(), columns, rows });
    }

    for repaired in loaded.values_mut() {
        trim_headers(repaired);
        apply_value_mappings(repaired, value_mappings);
    }

    // Missing Id synthesis must run for every object before any lookup
    // reconciliation, since a parent's Id column has to be complete before
    // a child's lookup can be matched against it.
    let mut autonumber: u64 = 0;
    for repaired in loaded.values_mut() {
        if !has_column(repaired, "Id") {
            synthesize_ids(repaired, &mut autonumber);
        }
    }

    let mut missing_parents = Vec::new();
    for descriptor in objects.iter() {
        let child_name = descriptor.source_name.clone();
        let lookup_fields: Vec<_> = descriptor.lookup_fields().cloned().collect();
        for field in &lookup_fields {
            for parent_name in field.referenced_objects.clone() {
                reconcile_lookup_pair(&mut loaded, &child_name, &parent_name, &field.name, objects, &mut autonumber, &mut missing_parents);
            }
        }
    }

    for repaired in loaded.values() {
        write_csv(&object_csv_path(repaired_dir, &repaired.object), &repaired.columns, &repaired.rows)?;
    }

    Ok(RepairOutcome { objects: loaded, missing_parents })
}

fn relationship_column(field: &str) -> String {
    if let Some(stem) = field.strip_suffix("__c") {
        format!("{stem}__r")
    } else if let Some(stem) = field.strip_suffix("Id") {
        format!("{stem}__r")
    } else {
        format!("{field}__r")
    }
}

/// Reconcile one child object's `(lookup id column, lookup __r column)`
/// pair against `parent_name`'s table, per spec §4.6 step 4's four cases.
fn reconcile_lookup_pair(
    loaded: &mut HashMap<String, RepairedObject>,
    child_name: &str,
    parent_name: &str,
    lookup_field: &str,
    objects: &ObjectTable,
    autonumber: &mut u64,
    missing_parents: &mut Vec<MissingParent>,
) {
    let Some(parent_descriptor) = objects.get(parent_name) else { return };
    let Some(parent_snapshot) = loaded.get(parent_name).cloned() else { return };
    let rel_col = relationship_column(lookup_field);

    let has_id_col = loaded.get(child_name).map(|c| has_column(c, lookup_field)).unwrap_or(false);
    let has_rel_col = loaded.get(child_name).map(|c| has_column(c, &rel_col)).unwrap_or(false);

    if has_id_col && has_rel_col {
        return; // both present: nothing to reconcile.
    }

    let Some(child) = loaded.get_mut(child_name) else { return };

    if has_rel_col && !has_id_col {
        // external id present, id missing: look the parent up by external id.
        child.columns.push(lookup_field.to_string());
        for row in &mut child.rows {
            let ext_id = row.get(&rel_col).cloned().unwrap_or_default();
            if ext_id.is_empty() {
                row.insert(lookup_field.to_string(), String::new());
                continue;
            }
            match find_by_external_id(&parent_snapshot, parent_descriptor, &ext_id) {
                Some(parent_id) => {
                    row.insert(lookup_field.to_string(), parent_id);
                }
                None => {
                    row.insert(lookup_field.to_string(), String::new());
                    missing_parents.push(MissingParent {
                        child_object: child_name.to_string(),
                        child_field: lookup_field.to_string(),
                        external_id: ext_id,
                        parent_object: parent_name.to_string(),
                        parent_external_id_field: parent_descriptor.external_id.to_string(),
                    });
                }
            }
        }
        return;
    }

    if has_id_col && !has_rel_col {
        // id present, external id missing: look the parent up by Id.
        child.columns.push(rel_col.clone());
        for row in &mut child.rows {
            let id = row.get(lookup_field).cloned().unwrap_or_default();
            let ext_id = find_by_id(&parent_snapshot, parent_descriptor, &id).unwrap_or_default();
            row.insert(rel_col.clone(), ext_id);
        }
        return;
    }

    // neither column present: there is nothing to match against on either
    // side, so a placeholder id is synthesized on the child row alone and
    // the row is reported unresolved rather than silently dropped.
    child.columns.push(lookup_field.to_string());
    for row in &mut child.rows {
        *autonumber += 1;
        let placeholder = format!("ID{:016}", autonumber);
        row.insert(lookup_field.to_string(), placeholder.clone());
        missing_parents.push(MissingParent {
            child_object: child_name.to_string(),
            child_field: lookup_field.to_string(),
            external_id: placeholder,
            parent_object: parent_name.to_string(),
            parent_external_id_field: parent_descriptor.external_id.to_string(),
        });
    }
}

fn find_by_external_id(parent: &RepairedObject, descriptor: &ObjectDescriptor, external_id: &str) -> Option<String> {
    parent
        .rows
        .iter()
        .find(|row| external_id_from_row(row, descriptor).as_deref() == Some(external_id))
        .and_then(|row| row.get("Id").cloned())
}

fn find_by_id(parent: &RepairedObject, descriptor: &ObjectDescriptor, id: &str) -> Option<String> {
    parent.rows.iter().find(|row| row.get("Id").map(|v| v.as_str()) == Some(id)).and_then(|row| external_id_from_row(row, descriptor))
}

fn external_id_from_row(row: &CsvRow, descriptor: &ObjectDescriptor) -> Option<String> {
    let segments = descriptor.external_id.segments();
    if segments.len() == 1 {
        return row.get(&segments[0]).cloned().filter(|s| !s.is_empty());
    }
    let parts: Vec<String> = segments.iter().map(|s| row.get(s).cloned().unwrap_or_default()).collect();
    Some(parts.join(";"))
}

fn has_column(repaired: &RepairedObject, name: &str) -> bool {
    repaired.columns.iter().any(|c| c == name)
}

fn trim_headers(repaired: &mut RepairedObject) {
    let trimmed: Vec<String> = repaired.columns.iter().map(|c| c.trim().to_string()).collect();
    if trimmed == repaired.columns {
        return;
    }
    let renames: HashMap<String, String> = repaired.columns.iter().cloned().zip(trimmed.iter().cloned()).collect();
    for row in &mut repaired.rows {
        let old_row = std::mem::take(row);
        for (key, value) in old_row {
            let new_key = renames.get(&key).cloned().unwrap_or(key);
            row.insert(new_key, value);
        }
    }
    repaired.columns = trimmed;
}

fn apply_value_mappings(repaired: &mut RepairedObject, mappings: &ValueMappings) {
    let object = repaired.object.clone();
    let columns = repaired.columns.clone();
    for row in &mut repaired.rows {
        for column in &columns {
            let Some(table) = mappings.get(&(object.clone(), column.clone())) else { continue };
            let Some(cell) = row.get(column).cloned() else { continue };
            if let Some(mapped) = table.get(&cell) {
                row.insert(column.clone(), mapped.clone());
            }
        }
    }
}

fn synthesize_ids(repaired: &mut RepairedObject, autonumber: &mut u64) {
    repaired.columns.insert(0, "Id".to_string());
    for row in &mut repaired.rows {
        *autonumber += 1;
        row.insert("Id".to_string(), format!("ID{:016}", autonumber));
    }
}

/// `User` and `Group` share one on-disk file (spec §6's CSV layout note).
fn object_csv_path(dir: &Path, object: &str) -> PathBuf {
    if object.eq_ignore_ascii_case("User") || object.eq_ignore_ascii_case("Group") {
        dir.join("UserAndGroup.csv")
    } else {
        dir.join(format!("{object}.csv"))
    }
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<CsvRow>), MigrateError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
    let headers: Vec<String> =
        reader.headers().map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?.iter().map(|s| s.to_string()).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
        let mut row = CsvRow::new();
        for (i, header) in headers.iter().enumerate() {
            row.insert(header.clone(), record.get(i).unwrap_or("").to_string());
        }
        rows.push(row);
    }
    Ok((headers, rows))
}

fn write_csv(path: &Path, columns: &[String], rows: &[CsvRow]) -> Result<(), MigrateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| MigrateError::filesystem(parent.display().to_string(), e.to_string()))?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
    writer.write_record(columns).map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
    for row in rows {
        let record: Vec<String> = columns.iter().map(|c| row.get(c).cloned().unwrap_or_default()).collect();
        writer.write_record(&record).map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
    }
    writer.flush().map_err(|e| MigrateError::filesystem(path.display().to_string(), e.to_string()))?;
    Ok(())
}
