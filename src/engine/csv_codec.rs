//! CSV encode/decode helpers shared by the Bulk v1 and Bulk v2 engines:
//! building a batch's CSV body in a stable column order, parsing a result
//! CSV back into rows, and the base64-aware chunking Bulk v2 needs (spec
//! §4.5: "Chunks are sized so that the base64 encoding of the chunk... stays
//! below the configured limit").

use std::collections::HashMap;
use std::io::Write;

use crate::model::Record;

/// Render a batch of records as CSV text, columns in `field_order`, plus
/// the source id in a leading column so later stages (status polling does
/// not echo per-row correlation for Bulk v1/v2 inserts, but updates/deletes
/// match by `Id`) can find it again.
pub fn records_to_csv(records: &[Record], field_order: &[String]) -> String {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    let header: Vec<&str> = field_order.iter().map(|s| s.as_str()).collect();
    writer.write_record(&header).expect("in-memory CSV writer never fails");
    for record in records {
        let row: Vec<String> = field_order
            .iter()
            .map(|field| record.get(field).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        writer.write_record(&row).expect("in-memory CSV writer never fails");
    }
    let bytes = writer.into_inner().expect("in-memory CSV writer never fails");
    String::from_utf8(bytes).expect("CSV writer only emits valid UTF-8 for our inputs")
}

/// Parse a CSV result document (Bulk v1 batch result, or one of Bulk v2's
/// `successfulResults`/`failedResults`/`unprocessedrecords` endpoints) into
/// an ordered list of header->value maps, preserving row order so
/// positional correlation (where the API supports it) still works.
pub fn parse_csv_rows(csv_text: &str) -> Vec<HashMap<String, String>> {
    let mut reader = csv::ReaderBuilder::new().from_reader(csv_text.as_bytes());
    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.to_string()).collect(),
        Err(_) => return Vec::new(),
    };
    let mut rows = Vec::new();
    for record in reader.records().flatten() {
        let mut row = HashMap::new();
        for (i, header) in headers.iter().enumerate() {
            if let Some(value) = record.get(i) {
                row.insert(header.clone(), value.to_string());
            }
        }
        rows.push(row);
    }
    rows
}

/// Split `records` into CSV chunks whose *base64-encoded* byte size stays
/// under `max_base64_bytes`. A chunk always carries the header row; a
/// record is only added to the current chunk if doing so (recomputing the
/// chunk's base64 size) would not cross the limit, matching spec §4.5's
/// "accumulates whole block-sized groups until the next block would
/// exceed the limit".
pub fn chunk_by_base64_size(
    records: &[Record],
    field_order: &[String],
    max_base64_bytes: usize,
) -> Vec<Vec<Record>> {
    let mut chunks: Vec<Vec<Record>> = Vec::new();
    let mut current: Vec<Record> = Vec::new();

    for record in records {
        current.push(record.clone());
        let candidate_csv = records_to_csv(&current, field_order);
        if base64_len(candidate_csv.len()) > max_base64_bytes && current.len() > 1 {
            // this record pushed the chunk over the limit: back it out and
            // start a fresh chunk with it alone.
            current.pop();
            chunks.push(std::mem::take(&mut current));
            current.push(record.clone());
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Exact encoded length of `n` raw bytes under standard base64 (4 output
/// chars per 3 input bytes, rounded up), used to size Bulk v2 chunks
/// without actually encoding every candidate chunk.
fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// Normalize a raw record field value for the Bulk v2 reconciliation hash
/// (spec §4.5): case-normalized booleans, numeric-parseable text normalized
/// to its numeric form, parseable dates to epoch milliseconds, `#N/A` to
/// empty, whitespace collapsed.
pub fn normalize_for_hash(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("#n/a") {
        return String::new();
    }
    let collapsed: String = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.to_ascii_lowercase().as_str() {
        "true" => return "true".to_string(),
        "false" => return "false".to_string(),
        _ => {}
    }
    if let Ok(i) = collapsed.parse::<i64>() {
        return i.to_string();
    }
    if let Ok(f) = collapsed.parse::<f64>() {
        return f.to_string();
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&collapsed) {
        return dt.timestamp_millis().to_string();
    }
    collapsed
}

/// 32-bit FNV-1a, the same hash width spec §4.3 names for the query cache
/// key; reused here for the Bulk v2 content-reconciliation hash over a
/// record's non-meta fields.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    let mut hash = OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Stable content hash for one record over `field_order`, excluding any
/// `sf__*` control columns the caller has already filtered out of
/// `field_order`.
pub fn content_hash(record: &Record, field_order: &[String]) -> u32 {
    let mut buf = Vec::new();
    for field in field_order {
        let raw = record.get(field).map(|v| v.to_string()).unwrap_or_default();
        let _ = write!(buf, "{}\u{1f}", normalize_for_hash(&raw));
    }
    fnv1a_32(&buf)
}
