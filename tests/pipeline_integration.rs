//! End-to-end exercises of `run_pipeline`/`run_object_sets` against a
//! hand-written transport, in the same integration-test style the engine
//! unit tests already use for mocking `Transport` (see
//! `engine::rest`/`engine::bulk_v1`'s own `MockTransport`s), scaled up to a
//! full two-object run.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use sobject_migrate::config::RunConfig;
use sobject_migrate::model::{ComplexField, FieldDescriptor, FieldType, ObjectDescriptor, ObjectTable, Operation};
use sobject_migrate::pipeline::run_pipeline;
use sobject_migrate::progress::ConsoleProgressSink;
use sobject_migrate::retrieval::QueryCache;
use sobject_migrate::script::{GlobalOptions, ObjectSet, OrgConnection, Script, ScriptObject};
use sobject_migrate::transport::{
    BulkV2Job, BulkV2JobState, BulkV2ResultKind, HttpMethod, QueryResultPage, Transport,
};
use sobject_migrate::MigrateError;

fn org(name: &str) -> OrgConnection {
    OrgConnection {
        name: name.to_string(),
        instance_url: format!("https://{name}.my.salesforce.com"),
        access_token: "tok".to_string(),
    }
}

fn account_descriptor() -> ObjectDescriptor {
    ObjectDescriptor {
        source_name: "Account".into(),
        target_name: "Account".into(),
        external_id: ComplexField::parse("Name").unwrap(),
        operation: Operation::Insert,
        fields: vec![FieldDescriptor::simple("Name", FieldType::String)],
        priority: 0,
    }
}

fn contact_descriptor() -> ObjectDescriptor {
    ObjectDescriptor {
        source_name: "Contact".into(),
        target_name: "Contact".into(),
        external_id: ComplexField::parse("LastName").unwrap(),
        operation: Operation::Insert,
        fields: vec![
            FieldDescriptor::simple("LastName", FieldType::String),
            FieldDescriptor::lookup("AccountId", "Account"),
        ],
        priority: 1,
    }
}

fn schema() -> ObjectTable {
    let mut table = ObjectTable::new();
    table.insert(account_descriptor());
    table.insert(contact_descriptor());
    table
}

fn script_object(query: &str, external_id: &str, operation: Operation) -> ScriptObject {
    ScriptObject {
        query: query.to_string(),
        delete_query: None,
        operation,
        external_id: external_id.to_string(),
        delete_old_data: false,
        all_records: false,
        multiselect_pattern: String::new(),
        excluded_fields: Vec::new(),
        field_mapping: Vec::new(),
        mock_fields: Vec::new(),
        target_records_filter: None,
        use_csv_values_mapping: false,
    }
}

fn two_object_script() -> Script {
    two_object_script_with_account_operation(Operation::Insert)
}

fn two_object_script_with_account_operation(account_operation: Operation) -> Script {
    Script {
        orgs: vec![org("source"), org("target")],
        object_sets: vec![ObjectSet {
            name: "default".into(),
            objects: vec![
                script_object("SELECT Id, Name FROM Account", "Name", account_operation),
                script_object("SELECT Id, LastName, AccountId FROM Contact", "LastName", Operation::Insert),
            ],
        }],
        options: GlobalOptions::default(),
    }
}

/// Records every `rest_collection` call by object name so a test can assert
/// on what the engine actually sent (e.g. that `Contact.AccountId` carried
/// the freshly assigned `Account` target id, not the source id).
struct MockTransport {
    account_source_rows: Vec<Json>,
    contact_source_rows: Vec<Json>,
    account_target_id: &'static str,
    contact_target_id: &'static str,
    rest_calls: Mutex<Vec<(String, Json)>>,
    query_calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn query(&self, org: &OrgConnection, soql: &str) -> Result<QueryResultPage, MigrateError> {
        self.query_calls.lock().unwrap().push(format!("{}:{soql}", org.name));
        let records = if org.name == "source" {
            if soql.contains("FROM Account") {
                self.account_source_rows.clone()
            } else if soql.contains("FROM Contact") {
                self.contact_source_rows.clone()
            } else {
                Vec::new()
            }
        } else {
            // nothing pre-exists on the target in this scenario
            Vec::new()
        };
        Ok(QueryResultPage { records, next_records_url: None, done: true })
    }

    async fn query_more(&self, _: &OrgConnection, _: &str) -> Result<QueryResultPage, MigrateError> {
        Ok(QueryResultPage { records: Vec::new(), next_records_url: None, done: true })
    }

    async fn bulk_query_csv(&self, _: &OrgConnection, _: &str) -> Result<String, MigrateError> {
        unimplemented!("this scenario stays below the bulk threshold")
    }

    async fn get_blob(&self, _: &OrgConnection, _: &str) -> Result<Vec<u8>, MigrateError> {
        unimplemented!("no binary fields in this scenario")
    }

    async fn rest_collection(
        &self,
        _: &OrgConnection,
        _: HttpMethod,
        object: &str,
        _: bool,
        records: Json,
    ) -> Result<Json, MigrateError> {
        self.rest_calls.lock().unwrap().push((object.to_string(), records.clone()));

        let rows = records.as_array().cloned().unwrap_or_default();
        match object {
            "Account" => Ok(json!(rows
                .iter()
                .map(|_| json!({ "success": true, "id": self.account_target_id }))
                .collect::<Vec<_>>())),
            "Contact" => {
                let results: Vec<Json> = rows
                    .iter()
                    .map(|row| {
                        let account_id = row.get("AccountId").and_then(|v| v.as_str());
                        if account_id == Some(self.account_target_id) {
                            json!({ "success": true, "id": self.contact_target_id })
                        } else {
                            json!({
                                "success": false,
                                "errors": [{ "message": format!(
                                    "AccountId did not resolve to the target id (got {account_id:?})"
                                ) }],
                            })
                        }
                    })
                    .collect();
                Ok(json!(results))
            }
            other => unimplemented!("unexpected object in rest_collection: {other}"),
        }
    }

    async fn bulk_v1_create_job(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
        unimplemented!()
    }
    async fn bulk_v1_add_batch(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
        unimplemented!()
    }
    async fn bulk_v1_batch_status(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
        unimplemented!()
    }
    async fn bulk_v1_batch_result(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
        unimplemented!()
    }
    async fn bulk_v1_close_job(&self, _: &OrgConnection, _: &str) -> Result<(), MigrateError> {
        unimplemented!()
    }
    async fn bulk_v2_create_job(&self, _: &OrgConnection, _: &str, _: &str) -> Result<BulkV2Job, MigrateError> {
        unimplemented!()
    }
    async fn bulk_v2_upload(&self, _: &str, _: &str) -> Result<(), MigrateError> {
        unimplemented!()
    }
    async fn bulk_v2_complete_upload(&self, _: &OrgConnection, _: &str) -> Result<(), MigrateError> {
        unimplemented!()
    }
    async fn bulk_v2_job_status(&self, _: &OrgConnection, _: &str) -> Result<BulkV2JobState, MigrateError> {
        unimplemented!()
    }
    async fn bulk_v2_results(&self, _: &OrgConnection, _: &str, _: BulkV2ResultKind) -> Result<String, MigrateError> {
        unimplemented!()
    }
}

/// Account does not exist on the target yet. Inserting it must assign its
/// target id in time for the same-run Contact insert to carry that id on
/// `AccountId`, not the source-side lookup id (the parent-visibility fix in
/// `pipeline::run_pipeline`).
#[tokio::test]
async fn newly_inserted_parent_is_visible_to_same_run_child_lookup() {
    let transport = MockTransport {
        account_source_rows: vec![json!({ "Id": "001xx0000000001AAA", "Name": "Acme" })],
        contact_source_rows: vec![json!({
            "Id": "003xx0000000002AAA",
            "LastName": "Doe",
            "AccountId": "001xx0000000001AAA",
        })],
        account_target_id: "001TT0000000001AAA",
        contact_target_id: "003TT0000000002AAA",
        rest_calls: Mutex::new(Vec::new()),
        query_calls: Mutex::new(Vec::new()),
    };

    let schema = schema();
    let script = two_object_script();
    let config = RunConfig::default();
    let sink = ConsoleProgressSink;
    let set = &script.object_sets[0];

    let query_cache = QueryCache::new(config.source_records_cache, &config.cache_dir).unwrap();
    let summary = run_pipeline(set, &script, &schema, &schema, &transport, &sink, &config, &query_cache)
        .await
        .unwrap();

    assert!(summary.missing_parents.is_empty(), "{:?}", summary.missing_parents);
    assert_eq!(summary.per_task.get("Account").unwrap().inserted, 1);
    assert_eq!(summary.per_task.get("Contact").unwrap().inserted, 1);
    assert_eq!(summary.total_failed(), 0);

    let calls = transport.rest_calls.lock().unwrap();
    let contact_call = calls.iter().find(|(object, _)| object == "Contact").unwrap();
    let sent_account_id = contact_call.1[0].get("AccountId").and_then(|v| v.as_str());
    assert_eq!(sent_account_id, Some("001TT0000000001AAA"));
}

/// A parent declared `Upsert` and already present on the target is matched
/// by external id during the target retrieval pass, so the write carries
/// the pre-existing target `Id` (an update-shaped upsert) instead of
/// creating a duplicate; the child still resolves `AccountId` against that
/// same target id.
#[tokio::test]
async fn preexisting_upsert_target_parent_carries_matched_id() {
    struct PreexistingTransport {
        rest_calls: Mutex<Vec<(String, Json)>>,
    }

    #[async_trait]
    impl Transport for PreexistingTransport {
        async fn query(&self, org: &OrgConnection, soql: &str) -> Result<QueryResultPage, MigrateError> {
            let records = if org.name == "source" {
                if soql.contains("FROM Account") {
                    vec![json!({ "Id": "001xx0000000001AAA", "Name": "Acme" })]
                } else if soql.contains("FROM Contact") {
                    vec![json!({
                        "Id": "003xx0000000002AAA",
                        "LastName": "Doe",
                        "AccountId": "001xx0000000001AAA",
                    })]
                } else {
                    Vec::new()
                }
            } else if soql.contains("FROM Account") {
                vec![json!({ "Id": "001TT0000000001AAA", "Name": "Acme" })]
            } else {
                Vec::new()
            };
            Ok(QueryResultPage { records, next_records_url: None, done: true })
        }

        async fn query_more(&self, _: &OrgConnection, _: &str) -> Result<QueryResultPage, MigrateError> {
            Ok(QueryResultPage { records: Vec::new(), next_records_url: None, done: true })
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
            _: HttpMethod,
            object: &str,
            _: bool,
            records: Json,
        ) -> Result<Json, MigrateError> {
            self.rest_calls.lock().unwrap().push((object.to_string(), records.clone()));
            let rows = records.as_array().cloned().unwrap_or_default();
            let target_id = match object {
                "Account" => "001TT0000000001AAA",
                "Contact" => "003TT0000000002AAA",
                other => unimplemented!("unexpected object in rest_collection: {other}"),
            };
            Ok(json!(rows.iter().map(|_| json!({ "success": true, "id": target_id })).collect::<Vec<_>>()))
        }
        async fn bulk_v1_create_job(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v1_add_batch(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v1_batch_status(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v1_batch_result(&self, _: &OrgConnection, _: &str, _: &str) -> Result<String, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v1_close_job(&self, _: &OrgConnection, _: &str) -> Result<(), MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_create_job(&self, _: &OrgConnection, _: &str, _: &str) -> Result<BulkV2Job, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_upload(&self, _: &str, _: &str) -> Result<(), MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_complete_upload(&self, _: &OrgConnection, _: &str) -> Result<(), MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_job_status(&self, _: &OrgConnection, _: &str) -> Result<BulkV2JobState, MigrateError> {
            unimplemented!()
        }
        async fn bulk_v2_results(&self, _: &OrgConnection, _: &str, _: BulkV2ResultKind) -> Result<String, MigrateError> {
            unimplemented!()
        }
    }

    let transport = PreexistingTransport { rest_calls: Mutex::new(Vec::new()) };
    let schema = schema();
    let script = two_object_script_with_account_operation(Operation::Upsert);
    let config = RunConfig::default();
    let sink = ConsoleProgressSink;
    let set = &script.object_sets[0];

    let query_cache = QueryCache::new(config.source_records_cache, &config.cache_dir).unwrap();
    let summary = run_pipeline(set, &script, &schema, &schema, &transport, &sink, &config, &query_cache)
        .await
        .unwrap();

    assert!(summary.missing_parents.is_empty(), "{:?}", summary.missing_parents);
    assert_eq!(summary.per_task.get("Account").unwrap().inserted, 1);
    assert_eq!(summary.per_task.get("Contact").unwrap().inserted, 1);

    let calls = transport.rest_calls.lock().unwrap();
    let account_call = calls.iter().find(|(object, _)| object == "Account").unwrap();
    assert_eq!(account_call.1[0].get("Id").and_then(|v| v.as_str()), Some("001TT0000000001AAA"));

    let contact_call = calls.iter().find(|(object, _)| object == "Contact").unwrap();
    assert_eq!(contact_call.1[0].get("AccountId").and_then(|v| v.as_str()), Some("001TT0000000001AAA"));
}

/// When a child's lookup parent never arrives on either side, the write
/// still proceeds with the field nulled and a `MissingParent` row recorded
/// (spec: non-fatal, not an error).
#[tokio::test]
async fn missing_parent_is_reported_not_fatal() {
    let transport = MockTransport {
        account_source_rows: Vec::new(),
        contact_source_rows: vec![json!({
            "Id": "003xx0000000002AAA",
            "LastName": "Doe",
            "AccountId": "001xx0000000099ZZZ",
        })],
        account_target_id: "001TT0000000001AAA",
        contact_target_id: "003TT0000000002AAA",
        rest_calls: Mutex::new(Vec::new()),
        query_calls: Mutex::new(Vec::new()),
    };

    let schema = schema();
    let script = two_object_script();
    let config = RunConfig::default();
    let sink = ConsoleProgressSink;
    let set = &script.object_sets[0];

    let query_cache = QueryCache::new(config.source_records_cache, &config.cache_dir).unwrap();
    let summary = run_pipeline(set, &script, &schema, &schema, &transport, &sink, &config, &query_cache)
        .await
        .unwrap();

    assert_eq!(summary.missing_parents.len(), 1);
    assert_eq!(summary.missing_parents[0].child_field, "AccountId");
    assert_eq!(summary.per_task.get("Contact").unwrap().inserted, 1);

    let calls = transport.rest_calls.lock().unwrap();
    let contact_call = calls.iter().find(|(object, _)| object == "Contact").unwrap();
    assert!(contact_call.1[0].get("AccountId").map(|v| v.is_null()).unwrap_or(false));
}

/// `run_object_sets` aggregates per-task counters across multiple object
/// sets rather than overwriting them (spec §9's "own source/target
/// subdirectories" implies independent, summed sub-jobs).
#[tokio::test]
async fn run_object_sets_merges_summaries_across_sets() {
    use sobject_migrate::pipeline::run_object_sets;

    let transport = MockTransport {
        account_source_rows: vec![json!({ "Id": "001xx0000000001AAA", "Name": "Acme" })],
        contact_source_rows: vec![json!({
            "Id": "003xx0000000002AAA",
            "LastName": "Doe",
            "AccountId": "001xx0000000001AAA",
        })],
        account_target_id: "001TT0000000001AAA",
        contact_target_id: "003TT0000000002AAA",
        rest_calls: Mutex::new(Vec::new()),
        query_calls: Mutex::new(Vec::new()),
    };

    let mut script = two_object_script();
    let second_set = script.object_sets[0].clone();
    script.object_sets.push(ObjectSet { name: "second".into(), objects: second_set.objects.clone() });

    let schema = schema();
    let config = RunConfig::default();
    let sink = ConsoleProgressSink;

    // Running the same two-object set twice against the same source rows
    // would attempt to re-insert Account (the target mock only ever
    // searches on the first externally matched id), so isolate the
    // assertion to what independent aggregation should guarantee: both
    // sets ran and contributed their own Contact insert.
    let summary = run_object_sets(&script, &schema, &schema, &transport, &sink, &config)
        .await
        .unwrap();

    assert_eq!(summary.per_task.get("Account").unwrap().inserted, 2);
    assert_eq!(summary.per_task.get("Contact").unwrap().inserted, 2);
}

/// A `FileCache`-backed source query cache, shared across two independent
/// `run_pipeline` calls against the same directory, serves the second
/// call's source queries from disk: no second `query` call for either
/// object reaches the transport (spec §4.3).
#[tokio::test]
async fn file_cache_avoids_requerying_source_on_a_second_run() {
    let transport = MockTransport {
        account_source_rows: vec![json!({ "Id": "001xx0000000001AAA", "Name": "Acme" })],
        contact_source_rows: vec![json!({
            "Id": "003xx0000000002AAA",
            "LastName": "Doe",
            "AccountId": "001xx0000000001AAA",
        })],
        account_target_id: "001TT0000000001AAA",
        contact_target_id: "003TT0000000002AAA",
        rest_calls: Mutex::new(Vec::new()),
        query_calls: Mutex::new(Vec::new()),
    };

    let schema = schema();
    let script = two_object_script();
    let sink = ConsoleProgressSink;
    let set = &script.object_sets[0];

    let cache_dir = std::env::temp_dir().join("sobject-migrate-pipeline-file-cache-test");
    let _ = std::fs::remove_dir_all(&cache_dir);
    let config = RunConfig::builder()
        .cache_dir(&cache_dir)
        .source_records_cache(sobject_migrate::script::BinaryCacheMode::FileCache)
        .build();

    let source_calls = || {
        transport.query_calls.lock().unwrap().iter().filter(|c| c.starts_with("source:")).count()
    };

    let query_cache = QueryCache::new(config.source_records_cache, &config.cache_dir).unwrap();
    run_pipeline(set, &script, &schema, &schema, &transport, &sink, &config, &query_cache)
        .await
        .unwrap();
    let source_calls_after_first_run = source_calls();

    // A fresh cache instance over the same directory, as a later process
    // invocation would construct: the second run must not repeat either
    // source query (the target pass, which is not cached, is free to query
    // again).
    let query_cache_second = QueryCache::new(config.source_records_cache, &config.cache_dir).unwrap();
    run_pipeline(set, &script, &schema, &schema, &transport, &sink, &config, &query_cache_second)
        .await
        .unwrap();
    let source_calls_after_second_run = source_calls();

    assert_eq!(
        source_calls_after_second_run, source_calls_after_first_run,
        "second run should have served every source query from the file cache"
    );

    std::fs::remove_dir_all(&cache_dir).ok();
}
