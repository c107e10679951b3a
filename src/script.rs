//! Plain-data types mirroring the structured script document of spec §6.
//!
//! The script-file parser is an out-of-scope external collaborator; this
//! module defines only the shape it is expected to hand to this crate.

use serde::{Deserialize, Serialize};

use crate::model::Operation;

/// One Salesforce org connection, with credentials already resolved —
/// spec §6: "No environment variables are consulted by the core itself;
/// credentials flow only through the script file."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgConnection {
    pub name: String,
    pub instance_url: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryCacheMode {
    InMemory,
    FileCache,
    CleanFileCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkApiVersion {
    V1,
    V2,
}

/// One object entry in the script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptObject {
    pub query: String,
    pub delete_query: Option<String>,
    pub operation: Operation,
    pub external_id: String,
    pub delete_old_data: bool,
    /// Query the full set (process-all), as opposed to a bounded/filtered
    /// query whose parents must be pulled by backward closure.
    pub all_records: bool,
    pub multiselect_pattern: String,
    pub excluded_fields: Vec<String>,
    pub field_mapping: Vec<(String, String)>,
    pub mock_fields: Vec<String>,
    pub target_records_filter: Option<String>,
    pub use_csv_values_mapping: bool,
}

/// Global knobs from spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalOptions {
    pub polling_interval_ms: u64,
    pub bulk_threshold: usize,
    pub bulk_api_version: BulkApiVersion,
    pub bulk_api_v1_batch_size: usize,
    pub all_or_none: bool,
    pub api_version: String,
    pub import_csv_files_as_is: bool,
    pub keep_object_order_while_execute: bool,
    pub create_target_csv_files: bool,
    pub binary_data_cache: BinaryCacheMode,
    pub source_records_cache: BinaryCacheMode,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        GlobalOptions {
            polling_interval_ms: 5_000,
            bulk_threshold: 200,
            bulk_api_version: BulkApiVersion::V2,
            bulk_api_v1_batch_size: 10_000,
            all_or_none: false,
            api_version: "59.0".to_string(),
            import_csv_files_as_is: false,
            keep_object_order_while_execute: false,
            create_target_csv_files: false,
            binary_data_cache: BinaryCacheMode::InMemory,
            source_records_cache: BinaryCacheMode::InMemory,
        }
    }
}

/// One object set: an isolated sub-job with its own source/target
/// subdirectories (spec §9, "Declarative object-set partitioning").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSet {
    pub name: String,
    pub objects: Vec<ScriptObject>,
}

/// The full script document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub orgs: Vec<OrgConnection>,
    pub object_sets: Vec<ObjectSet>,
    pub options: GlobalOptions,
}

impl Script {
    pub fn org(&self, name: &str) -> Option<&OrgConnection> {
        self.orgs.iter().find(|o| o.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_global_options_match_spec_defaults() {
        let opts = GlobalOptions::default();
        assert_eq!(opts.bulk_api_version, BulkApiVersion::V2);
        assert!(!opts.all_or_none);
    }
}
