//! The trait boundary the out-of-scope HTTP/auth layer plugs into (spec
//! §6: "the engines consume [the wire protocol]; the core does not care
//! how the transport is built"). [`ReqwestTransport`] is the ambient
//! default implementation so the crate is directly usable without a
//! caller-supplied transport; it performs no credential acquisition —
//! credentials arrive pre-resolved in [`crate::script::OrgConnection`].

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::error::MigrateError;
use crate::script::OrgConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Patch,
    Delete,
}

/// One page of a streaming SOQL query result.
#[derive(Debug, Clone)]
pub struct QueryResultPage {
    pub records: Vec<Json>,
    pub next_records_url: Option<String>,
    pub done: bool,
}

/// A created Bulk v2 ingest job.
#[derive(Debug, Clone)]
pub struct BulkV2Job {
    pub job_id: String,
    pub content_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkV2JobState {
    InProgress,
    Completed,
    FailedOrAborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkV2ResultKind {
    Successful,
    Failed,
    Unprocessed,
}

/// The wire protocol surface named in spec §6, at minimum: REST collection
/// operations, the Bulk v2 ingest lifecycle, and a streaming query
/// endpoint plus its bulk-query/CSV variant.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn query(&self, org: &OrgConnection, soql: &str) -> Result<QueryResultPage, MigrateError>;

    async fn query_more(&self, org: &OrgConnection, next_records_url: &str) -> Result<QueryResultPage, MigrateError>;

    /// Bulk query whose output is CSV text, used by the CSV source-medium
    /// path and by large unfiltered `process-all` queries.
    async fn bulk_query_csv(&self, org: &OrgConnection, soql: &str) -> Result<String, MigrateError>;

    async fn get_blob(&self, org: &OrgConnection, url: &str) -> Result<Vec<u8>, MigrateError>;

    /// `POST /sobjects/<obj>` and friends for REST collection operations.
    async fn rest_collection(
        &self,
        org: &OrgConnection,
        method: HttpMethod,
        object: &str,
        all_or_none: bool,
        records: Json,
    ) -> Result<Json, MigrateError>;

    async fn bulk_v1_create_job(&self, org: &OrgConnection, object: &str, operation: &str) -> Result<String, MigrateError>;
    async fn bulk_v1_add_batch(&self, org: &OrgConnection, job_id: &str, csv_body: &str) -> Result<String, MigrateError>;
    async fn bulk_v1_batch_status(&self, org: &OrgConnection, job_id: &str, batch_id: &str) -> Result<String, MigrateError>;
    async fn bulk_v1_batch_result(&self, org: &OrgConnection, job_id: &str, batch_id: &str) -> Result<String, MigrateError>;
    async fn bulk_v1_close_job(&self, org: &OrgConnection, job_id: &str) -> Result<(), MigrateError>;

    /// `POST /jobs/ingest`.
    async fn bulk_v2_create_job(&self, org: &OrgConnection, object: &str, operation: &str) -> Result<BulkV2Job, MigrateError>;
    /// `PUT <contentUrl>`.
    async fn bulk_v2_upload(&self, content_url: &str, csv_body: &str) -> Result<(), MigrateError>;
    /// `PATCH <... without /batches>` with `{state: UploadComplete}`.
    async fn bulk_v2_complete_upload(&self, org: &OrgConnection, job_id: &str) -> Result<(), MigrateError>;
    async fn bulk_v2_job_status(&self, org: &OrgConnection, job_id: &str) -> Result<BulkV2JobState, MigrateError>;
    async fn bulk_v2_results(&self, org: &OrgConnection, job_id: &str, kind: BulkV2ResultKind) -> Result<String, MigrateError>;
}

/// The ambient, reqwest-backed default transport.
pub struct ReqwestTransport {
    client: reqwest::Client,
    api_version: String,
}

impl ReqwestTransport {
    pub fn new(api_version: impl Into<String>) -> Self {
        ReqwestTransport { client: reqwest::Client::new(), api_version: api_version.into() }
    }

    fn base_url(&self, org: &OrgConnection) -> String {
        format!("{}/services/data/v{}", org.instance_url.trim_end_matches('/'), self.api_version)
    }

    fn auth_header(&self, org: &OrgConnection) -> String {
        format!("Bearer {}", org.access_token)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn query(&self, org: &OrgConnection, soql: &str) -> Result<QueryResultPage, MigrateError> {
        let url = format!("{}/query?q={}", self.base_url(org), urlencoding::encode(soql));
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        parse_query_page(&body)
    }

    async fn query_more(&self, org: &OrgConnection, next_records_url: &str) -> Result<QueryResultPage, MigrateError> {
        let url = format!("{}{}", org.instance_url.trim_end_matches('/'), next_records_url);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        parse_query_page(&body)
    }

    async fn bulk_query_csv(&self, org: &OrgConnection, soql: &str) -> Result<String, MigrateError> {
        let url = format!("{}/jobs/query", self.base_url(org));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header(org))
            .json(&serde_json::json!({ "operation": "query", "query": soql }))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        resp.text().await.map_err(|e| MigrateError::api_transport(e.to_string()))
    }

    async fn get_blob(&self, org: &OrgConnection, url: &str) -> Result<Vec<u8>, MigrateError> {
        let full = if url.starts_with("http") { url.to_string() } else { format!("{}{}", org.instance_url.trim_end_matches('/'), url) };
        let resp = self
            .client
            .get(&full)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        Ok(resp.bytes().await.map_err(|e| MigrateError::api_transport(e.to_string()))?.to_vec())
    }

    async fn rest_collection(
        &self,
        org: &OrgConnection,
        method: HttpMethod,
        object: &str,
        all_or_none: bool,
        records: Json,
    ) -> Result<Json, MigrateError> {
        let url = format!("{}/composite/sobjects", self.base_url(org));
        let body = serde_json::json!({ "allOrNone": all_or_none, "records": records, "object": object });
        let request = match method {
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        let resp = request
            .header("Authorization", self.auth_header(org))
            .json(&body)
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))
    }

    async fn bulk_v1_create_job(&self, org: &OrgConnection, object: &str, operation: &str) -> Result<String, MigrateError> {
        let url = format!("{}/jobs/ingest", self.base_url(org));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header(org))
            .json(&serde_json::json!({ "object": object, "operation": operation, "concurrencyMode": "Parallel" }))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        body.get("id").and_then(|v| v.as_str()).map(|s| s.to_string())
            .ok_or_else(|| MigrateError::api_transport("bulk v1 job creation returned no id"))
    }

    async fn bulk_v1_add_batch(&self, org: &OrgConnection, job_id: &str, csv_body: &str) -> Result<String, MigrateError> {
        let url = format!("{}/jobs/ingest/{job_id}/batches", self.base_url(org));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header(org))
            .header("Content-Type", "text/csv")
            .body(csv_body.to_string())
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        body.get("id").and_then(|v| v.as_str()).map(|s| s.to_string())
            .ok_or_else(|| MigrateError::api_transport("bulk v1 batch creation returned no id"))
    }

    async fn bulk_v1_batch_status(&self, org: &OrgConnection, job_id: &str, batch_id: &str) -> Result<String, MigrateError> {
        let url = format!("{}/jobs/ingest/{job_id}/batches/{batch_id}", self.base_url(org));
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        Ok(body.get("state").and_then(|v| v.as_str()).unwrap_or("InProgress").to_string())
    }

    async fn bulk_v1_batch_result(&self, org: &OrgConnection, job_id: &str, batch_id: &str) -> Result<String, MigrateError> {
        let url = format!("{}/jobs/ingest/{job_id}/batches/{batch_id}/result", self.base_url(org));
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        resp.text().await.map_err(|e| MigrateError::api_transport(e.to_string()))
    }

    async fn bulk_v1_close_job(&self, org: &OrgConnection, job_id: &str) -> Result<(), MigrateError> {
        let url = format!("{}/jobs/ingest/{job_id}", self.base_url(org));
        self.client
            .patch(&url)
            .header("Authorization", self.auth_header(org))
            .json(&serde_json::json!({ "state": "Closed" }))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        Ok(())
    }

    async fn bulk_v2_create_job(&self, org: &OrgConnection, object: &str, operation: &str) -> Result<BulkV2Job, MigrateError> {
        let url = format!("{}/jobs/ingest", self.base_url(org));
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header(org))
            .json(&serde_json::json!({
                "object": object,
                "operation": operation,
                "contentType": "CSV",
                "lineEnding": "LF",
            }))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let job_id = body.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let content_url = body.get("contentUrl").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        if job_id.is_empty() {
            return Err(MigrateError::api_transport("bulk v2 job creation returned no id"));
        }
        Ok(BulkV2Job { job_id, content_url })
    }

    async fn bulk_v2_upload(&self, content_url: &str, csv_body: &str) -> Result<(), MigrateError> {
        self.client
            .put(content_url)
            .header("Content-Type", "text/csv")
            .body(csv_body.to_string())
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        Ok(())
    }

    async fn bulk_v2_complete_upload(&self, org: &OrgConnection, job_id: &str) -> Result<(), MigrateError> {
        let url = format!("{}/jobs/ingest/{job_id}", self.base_url(org));
        self.client
            .patch(&url)
            .header("Authorization", self.auth_header(org))
            .json(&serde_json::json!({ "state": "UploadComplete" }))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        Ok(())
    }

    async fn bulk_v2_job_status(&self, org: &OrgConnection, job_id: &str) -> Result<BulkV2JobState, MigrateError> {
        let url = format!("{}/jobs/ingest/{job_id}", self.base_url(org));
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let body: Json = resp.json().await.map_err(|e| MigrateError::api_transport(e.to_string()))?;
        let state = body.get("state").and_then(|v| v.as_str()).unwrap_or("InProgress");
        Ok(match state {
            "JobComplete" | "Completed" => BulkV2JobState::Completed,
            "Failed" | "Aborted" | "FailedOrAborted" => BulkV2JobState::FailedOrAborted,
            _ => BulkV2JobState::InProgress,
        })
    }

    async fn bulk_v2_results(&self, org: &OrgConnection, job_id: &str, kind: BulkV2ResultKind) -> Result<String, MigrateError> {
        let suffix = match kind {
            BulkV2ResultKind::Successful => "successfulResults",
            BulkV2ResultKind::Failed => "failedResults",
            BulkV2ResultKind::Unprocessed => "unprocessedrecords",
        };
        let url = format!("{}/jobs/ingest/{job_id}/{suffix}", self.base_url(org));
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header(org))
            .send()
            .await
            .map_err(|e| MigrateError::api_transport(e.to_string()))?;
        resp.text().await.map_err(|e| MigrateError::api_transport(e.to_string()))
    }
}

fn parse_query_page(body: &Json) -> Result<QueryResultPage, MigrateError> {
    let records = body
        .get("records")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let next_records_url = body
        .get("nextRecordsUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let done = body.get("done").and_then(|v| v.as_bool()).unwrap_or(true);
    Ok(QueryResultPage { records, next_records_url, done })
}
