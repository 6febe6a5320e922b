use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{CacheKey, DEFAULT_TTL, ResultCache};
use crate::domain::{QueryId, RawResult, Row, Scalar};
use crate::error::ReportError;

pub const DEFAULT_BASE_URL: &str = "https://redash.uuid-p.antennaanalytics.com/api";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub trait QueryClient: Send + Sync {
    fn fetch(
        &self,
        query_id: &QueryId,
        parameters: &BTreeMap<String, String>,
    ) -> Result<RawResult, ReportError>;
}

#[derive(Clone)]
pub struct RedashHttpClient {
    client: Client,
    base_url: String,
}

impl RedashHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ReportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("report-pipeline/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ReportError::QueryHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| ReportError::QueryHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn results_url(&self, query_id: &QueryId) -> String {
        format!("{}/queries/{}/results.json", self.base_url, query_id.as_str())
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, ReportError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "query request failed".to_string());
        Err(ReportError::QueryStatus { status, message })
    }
}

impl QueryClient for RedashHttpClient {
    fn fetch(
        &self,
        query_id: &QueryId,
        parameters: &BTreeMap<String, String>,
    ) -> Result<RawResult, ReportError> {
        let url = self.results_url(query_id);
        let response = self
            .client
            .get(&url)
            .query(parameters)
            .send()
            .map_err(|err| ReportError::QueryHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let body: Value = response
            .json()
            .map_err(|err| ReportError::QueryDecode(err.to_string()))?;
        parse_query_result(&body)
    }
}

/// Extracts `query_result.data.{columns,rows}` from a Redash results payload.
///
/// Missing sections yield an empty result. Row keys that are not declared
/// columns are dropped; when no columns are declared they are taken from the
/// first row.
pub fn parse_query_result(body: &Value) -> Result<RawResult, ReportError> {
    if !body.is_object() {
        return Err(ReportError::QueryDecode(
            "response body is not a JSON object".to_string(),
        ));
    }
    let data = body
        .get("query_result")
        .and_then(|value| value.get("data"));

    let mut columns = data
        .and_then(|value| value.get("columns"))
        .and_then(|value| value.as_array())
        .map(|array| {
            array
                .iter()
                .filter_map(|column| column.get("name").and_then(|name| name.as_str()))
                .map(|name| name.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let raw_rows = data
        .and_then(|value| value.get("rows"))
        .and_then(|value| value.as_array())
        .cloned()
        .unwrap_or_default();

    if columns.is_empty()
        && let Some(first) = raw_rows.first().and_then(|row| row.as_object())
    {
        columns = first.keys().cloned().collect();
    }

    let rows = raw_rows
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let object = row.as_object().ok_or_else(|| {
                ReportError::QueryDecode(format!("row {index} is not a JSON object"))
            })?;
            Ok(columns
                .iter()
                .filter_map(|column| {
                    object
                        .get(column)
                        .map(|value| (column.clone(), Scalar::from_json(value)))
                })
                .collect::<Row>())
        })
        .collect::<Result<Vec<_>, ReportError>>()?;

    Ok(RawResult::new(columns, rows))
}

/// Fetcher that consults the shared result cache before going to the network.
pub struct CachedFetcher<C: QueryClient> {
    client: C,
    cache: Arc<dyn ResultCache>,
    ttl: Duration,
}

impl<C: QueryClient> CachedFetcher<C> {
    pub fn new(client: C, cache: Arc<dyn ResultCache>) -> Self {
        Self::with_ttl(client, cache, DEFAULT_TTL)
    }

    pub fn with_ttl(client: C, cache: Arc<dyn ResultCache>, ttl: Duration) -> Self {
        Self { client, cache, ttl }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn fetch(
        &self,
        query_id: &QueryId,
        parameters: &BTreeMap<String, String>,
    ) -> Result<RawResult, ReportError> {
        let key = CacheKey::new(query_id, parameters);
        if let Some(hit) = self.cache.get(&key, self.ttl) {
            debug!(query_id = %query_id, rows = hit.rows.len(), "query result served from cache");
            return Ok(hit);
        }

        debug!(query_id = %query_id, "query result not cached, fetching");
        let start = Instant::now();
        let result = self.client.fetch(query_id, parameters)?;
        info!(
            query_id = %query_id,
            rows = result.rows.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "fetched query result"
        );
        self.cache.set(key, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_keeps_declared_column_order() {
        let body = json!({
            "query_result": {
                "data": {
                    "columns": [
                        {"name": "month", "type": "string"},
                        {"name": "service", "type": "string"},
                        {"name": "value", "type": "integer"}
                    ],
                    "rows": [
                        {"value": 10, "service": "B", "month": "2023-01", "extra": 1}
                    ]
                }
            }
        });
        let raw = parse_query_result(&body).unwrap();
        assert_eq!(raw.columns, vec!["month", "service", "value"]);
        assert_eq!(raw.rows[0].len(), 3);
        assert_eq!(raw.value(0, "value"), &Scalar::from(10.0));
    }

    #[test]
    fn parse_missing_sections_yields_empty_result() {
        let raw = parse_query_result(&json!({"job": {}})).unwrap();
        assert!(raw.columns.is_empty());
        assert!(raw.rows.is_empty());
    }

    #[test]
    fn parse_rejects_non_object_rows() {
        let body = json!({"query_result": {"data": {"columns": [{"name": "a"}], "rows": [1]}}});
        assert!(matches!(
            parse_query_result(&body),
            Err(ReportError::QueryDecode(_))
        ));
    }

    #[test]
    fn results_url_joins_base() {
        let client = RedashHttpClient::new("https://redash.example.com/api/", DEFAULT_TIMEOUT).unwrap();
        assert_eq!(
            client.results_url(&QueryId::from(20491)),
            "https://redash.example.com/api/queries/20491/results.json"
        );
    }
}
