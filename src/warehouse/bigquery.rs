//! BigQuery client over the v2 REST API.
//!
//! Uses `jobs.insert` for dry runs and submissions, `jobs.getQueryResults`
//! for paging, `jobs.cancel`, and `tables.get` for partition metadata.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{
    gcloud, ColumnInfo, DryRunStats, JobHandle, JobMetadata, JobOptions, Partitioning, Row,
    RowStream, TableMetadata, TableRef, Value, WarehouseClient, WarehouseResult,
};
use crate::error::WarehouseError;

/// BigQuery v2 API root.
const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2/";

/// Default timeout for a single HTTP request.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// How long `getQueryResults` may block server-side waiting for completion.
const RESULTS_WAIT_MS: u64 = 10_000;

/// gcloud tokens live for an hour; refresh well before that.
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

struct TokenCache {
    fixed: Option<String>,
    cached: tokio::sync::Mutex<Option<(String, Instant)>>,
}

impl TokenCache {
    async fn get(&self) -> WarehouseResult<String> {
        if let Some(token) = &self.fixed {
            return Ok(token.clone());
        }
        let mut cached = self.cached.lock().await;
        if let Some((token, fetched)) = cached.as_ref() {
            if fetched.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }
        debug!("Refreshing BigQuery access token");
        let token = gcloud::access_token().await?;
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

/// BigQuery REST client.
#[derive(Clone)]
pub struct BigQueryClient {
    http: Client,
    base_url: Url,
    project: String,
    tokens: Arc<TokenCache>,
}

impl std::fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("base_url", &self.base_url.as_str())
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl BigQueryClient {
    /// Creates a client billing to `project`.
    ///
    /// The access token comes from `BQ_GUARD_ACCESS_TOKEN` or
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, else from `gcloud auth print-access-token`.
    pub fn new(project: impl Into<String>) -> WarehouseResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| WarehouseError::network(format!("failed to create HTTP client: {e}")))?;
        let base_url = Url::parse(DEFAULT_BASE_URL)
            .map_err(|e| WarehouseError::network(format!("invalid base URL: {e}")))?;

        Ok(Self {
            http,
            base_url,
            project: project.into(),
            tokens: Arc::new(TokenCache {
                fixed: gcloud::token_from_env(),
                cached: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Points the client at another API root (emulators, proxies).
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.tokens = Arc::new(TokenCache {
            fixed: Some(token.into()),
            cached: tokio::sync::Mutex::new(None),
        });
        self
    }

    fn endpoint(&self, path: &str) -> WarehouseResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| WarehouseError::network(format!("invalid endpoint {path}: {e}")))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> WarehouseResult<T> {
        let token = self.tokens.get().await?;
        let response = request.bearer_auth(token).send().await.map_err(|e| {
            if e.is_timeout() {
                WarehouseError::network("request timed out")
            } else if e.is_connect() {
                WarehouseError::network("failed to connect to BigQuery; check your network")
            } else {
                WarehouseError::network(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| WarehouseError::network(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(parse_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| WarehouseError::invalid_response(format!("failed to parse response: {e}")))
    }

    async fn insert_job(
        &self,
        sql: &str,
        options: &JobOptions,
        dry_run: bool,
    ) -> WarehouseResult<(String, Job)> {
        let project = options.project.as_deref().unwrap_or(&self.project).to_string();
        let request = InsertJobRequest {
            job_reference: JobReferenceRequest {
                project_id: &project,
                location: &options.location,
            },
            configuration: JobConfiguration {
                dry_run,
                labels: &options.labels,
                query: QueryConfiguration {
                    query: sql,
                    use_legacy_sql: false,
                    use_query_cache: options.use_query_cache,
                },
            },
        };
        let url = self.endpoint(&format!("projects/{project}/jobs"))?;
        let job: Job = self.send(self.http.post(url).json(&request)).await?;
        if let Some(err) = job.status.as_ref().and_then(|s| s.error_result.as_ref()) {
            return Err(WarehouseError::api(400, err.describe()));
        }
        Ok((project, job))
    }

    async fn fetch_page(
        &self,
        job: &JobMetadata,
        page_size: usize,
        page_token: Option<&str>,
    ) -> WarehouseResult<QueryResultsResponse> {
        let url = self.endpoint(&format!("projects/{}/queries/{}", job.project, job.job_id))?;
        let mut query: Vec<(&str, String)> = vec![
            ("maxResults", page_size.to_string()),
            ("timeoutMs", RESULTS_WAIT_MS.to_string()),
        ];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let page: QueryResultsResponse = self.send(self.http.get(url).query(&query)).await?;
        if let Some(err) = page.errors.first() {
            return Err(WarehouseError::api(400, err.describe()));
        }
        Ok(page)
    }
}

#[async_trait]
impl WarehouseClient for BigQueryClient {
    async fn dry_run(&self, sql: &str, options: &JobOptions) -> WarehouseResult<DryRunStats> {
        let (_, job) = self.insert_job(sql, options, true).await?;
        Ok(job.dry_run_stats())
    }

    async fn submit(
        &self,
        sql: &str,
        options: &JobOptions,
    ) -> WarehouseResult<Arc<dyn JobHandle>> {
        let (project, job) = self.insert_job(sql, options, false).await?;
        let metadata = job.job_metadata(&project)?;
        info!(job_id = %metadata.job_id, "BigQuery job submitted");
        Ok(Arc::new(BigQueryJob {
            client: self.clone(),
            metadata,
        }))
    }

    async fn table_metadata(&self, table: &TableRef) -> WarehouseResult<TableMetadata> {
        let url = self.endpoint(&format!(
            "projects/{}/datasets/{}/tables/{}",
            table.project, table.dataset, table.table
        ))?;
        let resource: TableResource = self.send(self.http.get(url)).await?;
        Ok(resource.into_metadata(table.clone()))
    }

    fn default_project(&self) -> Option<&str> {
        Some(&self.project)
    }
}

/// A job submitted through [`BigQueryClient`].
#[derive(Debug)]
struct BigQueryJob {
    client: BigQueryClient,
    metadata: JobMetadata,
}

#[async_trait]
impl JobHandle for BigQueryJob {
    fn metadata(&self) -> &JobMetadata {
        &self.metadata
    }

    async fn open_rows(&self, page_size: usize) -> WarehouseResult<RowStream> {
        let page_size = page_size.max(1);
        let mut first = self.client.fetch_page(&self.metadata, page_size, None).await?;
        while !first.job_complete {
            debug!(job_id = %self.metadata.job_id, "Waiting for job to complete");
            first = self.client.fetch_page(&self.metadata, page_size, None).await?;
        }

        let fields = Arc::new(first.schema.take().map(|s| s.fields).unwrap_or_default());
        let columns = fields
            .iter()
            .map(|f| ColumnInfo::new(&f.name, &f.field_type))
            .collect();
        let first_rows = convert_rows(&fields, std::mem::take(&mut first.rows));

        let cursor = PageCursor {
            client: self.client.clone(),
            job: self.metadata.clone(),
            fields,
            page_size,
            page_token: first.page_token,
        };
        let rest = stream::try_unfold(cursor, PageCursor::next_page);
        let pages = stream::once(async move { Ok::<_, WarehouseError>(first_rows) }).chain(rest);
        Ok(RowStream::new(columns, pages.boxed()))
    }

    async fn cancel(&self) -> WarehouseResult<()> {
        let url = self.client.endpoint(&format!(
            "projects/{}/jobs/{}/cancel",
            self.metadata.project, self.metadata.job_id
        ))?;
        let mut request = self.client.http.post(url);
        if let Some(location) = &self.metadata.location {
            request = request.query(&[("location", location)]);
        }
        let _: serde_json::Value = self.client.send(request).await?;
        info!(job_id = %self.metadata.job_id, "BigQuery job cancel requested");
        Ok(())
    }
}

struct PageCursor {
    client: BigQueryClient,
    job: JobMetadata,
    fields: Arc<Vec<TableFieldSchema>>,
    page_size: usize,
    page_token: Option<String>,
}

impl PageCursor {
    async fn next_page(mut self) -> WarehouseResult<Option<(Vec<Row>, Self)>> {
        let Some(token) = self.page_token.take() else {
            return Ok(None);
        };
        let page = self
            .client
            .fetch_page(&self.job, self.page_size, Some(&token))
            .await?;
        let rows = convert_rows(&self.fields, page.rows);
        self.page_token = page.page_token;
        Ok(Some((rows, self)))
    }
}

fn parse_error(status: StatusCode, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|r| r.error.message)
        .unwrap_or_else(|_| body.trim().to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WarehouseError::auth(message),
        _ => WarehouseError::api(status.as_u16(), message),
    }
}

fn parse_count(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

fn convert_rows(fields: &[TableFieldSchema], rows: Vec<TableRow>) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| cell_value(field, cell.v))
                .collect()
        })
        .collect()
}

fn cell_value(field: &TableFieldSchema, raw: serde_json::Value) -> Value {
    let nested = field.mode.as_deref() == Some("REPEATED")
        || matches!(field.field_type.as_str(), "RECORD" | "STRUCT");

    match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::String(s) if !nested => match field.field_type.as_str() {
            "INTEGER" | "INT64" => s.parse().map(Value::Int).unwrap_or(Value::String(s)),
            "FLOAT" | "FLOAT64" => s.parse().map(Value::Float).unwrap_or(Value::String(s)),
            "BOOLEAN" | "BOOL" => Value::Bool(s.eq_ignore_ascii_case("true")),
            _ => Value::String(s),
        },
        other => Value::String(other.to_string()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertJobRequest<'a> {
    job_reference: JobReferenceRequest<'a>,
    configuration: JobConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceRequest<'a> {
    project_id: &'a str,
    location: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobConfiguration<'a> {
    dry_run: bool,
    labels: &'a BTreeMap<String, String>,
    query: QueryConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryConfiguration<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    use_query_cache: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: Option<JobReference>,
    statistics: Option<JobStatistics>,
    status: Option<JobStatus>,
}

impl Job {
    fn query_stats(&self) -> Option<&QueryStatistics> {
        self.statistics.as_ref().and_then(|s| s.query.as_ref())
    }

    fn total_bytes(&self) -> Option<u64> {
        let from_query = self
            .query_stats()
            .and_then(|q| parse_count(q.total_bytes_processed.as_deref()));
        from_query.or_else(|| {
            self.statistics
                .as_ref()
                .and_then(|s| parse_count(s.total_bytes_processed.as_deref()))
        })
    }

    fn dry_run_stats(&self) -> DryRunStats {
        let query = self.query_stats();
        DryRunStats {
            bytes_processed: self.total_bytes(),
            row_estimate: None,
            referenced_tables: query
                .map(|q| {
                    q.referenced_tables
                        .iter()
                        .map(|t| TableRef::new(&t.project_id, &t.dataset_id, &t.table_id))
                        .collect()
                })
                .unwrap_or_default(),
            statement_type: query.and_then(|q| q.statement_type.clone()),
        }
    }

    fn job_metadata(&self, project: &str) -> WarehouseResult<JobMetadata> {
        let reference = self
            .job_reference
            .as_ref()
            .ok_or_else(|| WarehouseError::invalid_response("job has no jobReference"))?;
        let job_id = reference
            .job_id
            .clone()
            .ok_or_else(|| WarehouseError::invalid_response("job has no jobId"))?;

        let mut metadata = JobMetadata::new(
            job_id,
            reference.project_id.clone().unwrap_or_else(|| project.to_string()),
        );
        metadata.location = reference.location.clone();
        metadata.total_bytes_processed = self.total_bytes();
        metadata.cache_hit = self.query_stats().and_then(|q| q.cache_hit);
        Ok(metadata)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: Option<String>,
    job_id: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    total_bytes_processed: Option<String>,
    query: Option<QueryStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatistics {
    total_bytes_processed: Option<String>,
    #[serde(default)]
    referenced_tables: Vec<TableReference>,
    statement_type: Option<String>,
    cache_hit: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        match (&self.reason, &self.message) {
            (Some(reason), Some(message)) => format!("{reason}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(reason), None) => reason.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultsResponse {
    #[serde(default)]
    job_complete: bool,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableFieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    time_partitioning: Option<TimePartitioning>,
    range_partitioning: Option<RangePartitioning>,
    num_rows: Option<String>,
    num_bytes: Option<String>,
    schema: Option<TableSchema>,
}

#[derive(Debug, Deserialize)]
struct TimePartitioning {
    field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangePartitioning {
    field: Option<String>,
}

impl TableResource {
    fn into_metadata(self, table: TableRef) -> TableMetadata {
        let partitioning = match (self.time_partitioning, self.range_partitioning) {
            (Some(time), _) => Partitioning::Time { column: time.field },
            (None, Some(RangePartitioning { field: Some(column) })) => {
                Partitioning::Range { column }
            }
            _ => Partitioning::None,
        };
        TableMetadata {
            table,
            partitioning,
            row_count: parse_count(self.num_rows.as_deref()),
            size_bytes: parse_count(self.num_bytes.as_deref()),
            columns: self
                .schema
                .map(|s| {
                    s.fields
                        .into_iter()
                        .map(|f| ColumnInfo::new(f.name, f.field_type))
                        .collect()
                })
                .unwrap_or_default(),
            fetched_at: Utc::now(),
        }
    }
}
