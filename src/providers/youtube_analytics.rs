use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{ACCEPT, AUTHORIZATION};
use hyper::{Method, Request};
use serde_json::Value;
use tracing::debug;

use crate::chunks::DateChunk;
use crate::error::{BackfillError, Result};
use crate::metrics::MetricSpec;

const MAX_ERROR_BODY_CHARS: usize = 800;

/// Tabular report body: `columnHeaders[].name` and the `rows` they describe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
  pub columns: Vec<String>,
  pub rows: Vec<Vec<Value>>,
}

impl ReportTable {
  pub fn column_index(&self, name: &str) -> Option<usize> {
    self.columns.iter().position(|c| c == name)
  }
}

#[async_trait]
pub trait ReportSource: Send + Sync {
  /// One query for one chunk. Never retries.
  async fn fetch(&self, access_token: &str, scope_id: &str, chunk: DateChunk, spec: &MetricSpec) -> Result<ReportTable>;
}

fn ids_value(scope_id: &str) -> String {
  let scope_id = scope_id.trim();
  if scope_id.is_empty() {
    "channel==MINE".to_string()
  } else {
    format!("channel=={scope_id}")
  }
}

pub fn build_report_url(base_url: &str, scope_id: &str, chunk: DateChunk, spec: &MetricSpec) -> String {
  let base = base_url.trim_end_matches('/');
  let mut url = format!(
    "{base}/v2/reports?ids={}&startDate={}&endDate={}&metrics={}&dimensions={}",
    ids_value(scope_id),
    chunk.start,
    chunk.end,
    spec.metrics.join(","),
    spec.dimensions.join(","),
  );
  if let Some(sort) = spec.sort {
    url.push_str(&format!("&sort={sort}"));
  }
  if let Some(max_results) = spec.max_results {
    url.push_str(&format!("&maxResults={max_results}"));
  }
  url
}

pub fn parse_report_table(json: &Value) -> ReportTable {
  let columns = json
    .get("columnHeaders")
    .and_then(|v| v.as_array())
    .map(|headers| {
      headers
        .iter()
        .map(|h| h.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string())
        .collect()
    })
    .unwrap_or_default();

  // An empty window comes back without a `rows` key at all.
  let rows = json
    .get("rows")
    .and_then(|v| v.as_array())
    .map(|rows| rows.iter().filter_map(|r| r.as_array().cloned()).collect())
    .unwrap_or_default();

  ReportTable { columns, rows }
}

fn transport_error(e: impl std::fmt::Display) -> BackfillError {
  BackfillError::Api {
    status: None,
    body: e.to_string(),
  }
}

async fn fetch_report_json_by_url(access_token: &str, url: &str) -> Result<Value> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(transport_error)?
    .https_or_http()
    .enable_http1()
    .build();

  let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let req = Request::builder()
    .method(Method::GET)
    .uri(url)
    .header(AUTHORIZATION, format!("Bearer {}", access_token))
    .header(ACCEPT, "application/json")
    .body(Empty::<Bytes>::new())
    .map_err(transport_error)?;

  let resp = client.request(req).await.map_err(transport_error)?;

  let status = resp.status();
  let body_bytes = resp
    .into_body()
    .collect()
    .await
    .map_err(|e| BackfillError::Api {
      status: Some(status.as_u16()),
      body: e.to_string(),
    })?
    .to_bytes();

  if !status.is_success() {
    let snippet = String::from_utf8_lossy(&body_bytes);
    return Err(BackfillError::Api {
      status: Some(status.as_u16()),
      body: snippet.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    });
  }

  serde_json::from_slice::<Value>(&body_bytes).map_err(|e| BackfillError::Api {
    status: Some(status.as_u16()),
    body: format!("invalid json response: {e}"),
  })
}

pub struct YoutubeAnalyticsClient {
  base_url: String,
  timeout: Duration,
}

impl YoutubeAnalyticsClient {
  pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
    Self {
      base_url: base_url.into(),
      timeout,
    }
  }
}

#[async_trait]
impl ReportSource for YoutubeAnalyticsClient {
  async fn fetch(&self, access_token: &str, scope_id: &str, chunk: DateChunk, spec: &MetricSpec) -> Result<ReportTable> {
    let url = build_report_url(&self.base_url, scope_id, chunk, spec);
    debug!(%chunk, metrics = %spec.metrics.join(","), "querying youtube analytics");

    let json = tokio::time::timeout(self.timeout, fetch_report_json_by_url(access_token, &url))
      .await
      .map_err(|_| BackfillError::Api {
        status: None,
        body: format!("request timed out after {}s", self.timeout.as_secs_f64()),
      })??;

    Ok(parse_report_table(&json))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::NaiveDate;
  use http_body_util::Full;
  use hyper::body::Incoming;
  use hyper::server::conn::http1;
  use hyper::service::service_fn;
  use hyper::{Response, StatusCode};
  use hyper_util::rt::TokioIo;
  use tokio::net::TcpListener;

  use crate::metrics::MetricFamily;

  fn chunk() -> DateChunk {
    DateChunk {
      start: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
      end: NaiveDate::from_ymd_opt(2015, 3, 31).unwrap(),
    }
  }

  #[test]
  fn build_report_url_includes_expected_params() {
    let url = build_report_url(
      "https://youtubeanalytics.googleapis.com/",
      "UC123",
      chunk(),
      &MetricFamily::Demographics.spec(),
    );

    assert!(url.starts_with("https://youtubeanalytics.googleapis.com/v2/reports?"));
    assert!(url.contains("ids=channel==UC123"));
    assert!(url.contains("startDate=2015-01-01"));
    assert!(url.contains("endDate=2015-03-31"));
    assert!(url.contains("metrics=viewerPercentage"));
    assert!(url.contains("dimensions=ageGroup,gender"));
    assert!(url.contains("sort=gender,ageGroup"));
    assert!(!url.contains("maxResults"));
  }

  #[test]
  fn blank_scope_queries_own_channel() {
    let url = build_report_url("http://x/", " ", chunk(), &MetricFamily::Geography.spec());
    assert!(url.contains("ids=channel==MINE"));
    assert!(url.contains("maxResults=250"));
  }

  #[test]
  fn parses_tables_and_tolerates_missing_rows() {
    let json = serde_json::json!({
      "columnHeaders": [
        {"name":"day","columnType":"DIMENSION","dataType":"STRING"},
        {"name":"views","columnType":"METRIC","dataType":"INTEGER"}
      ],
      "rows": [["2015-01-01", 10], "garbage", ["2015-01-02", 11]]
    });
    let table = parse_report_table(&json);
    assert_eq!(table.columns, vec!["day", "views"]);
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.column_index("views"), Some(1));

    let empty = parse_report_table(&serde_json::json!({"columnHeaders": []}));
    assert!(empty.rows.is_empty());
  }

  async fn serve_reports(listener: TcpListener, max_connections: usize) {
    for _ in 0..max_connections {
      let (stream, _) = listener.accept().await.unwrap();
      let io = TokioIo::new(stream);
      http1::Builder::new()
        .serve_connection(
          io,
          service_fn(|req: Request<Incoming>| async move {
            let auth = req
              .headers()
              .get(AUTHORIZATION)
              .and_then(|v| v.to_str().ok())
              .unwrap_or("");
            if auth != "Bearer token123" {
              let body = r#"{"error":{"code":401,"message":"Request had invalid authentication credentials."}}"#;
              return Ok::<_, hyper::Error>(
                Response::builder()
                  .status(StatusCode::UNAUTHORIZED)
                  .header("content-type", "application/json")
                  .body(Full::new(Bytes::from(body)))
                  .unwrap(),
              );
            }

            let query = req.uri().query().unwrap_or("");
            if query.contains("startDate=2015-01-01") && query.contains("dimensions=day") {
              let body = r#"
                {
                  "columnHeaders": [
                    {"name":"day","columnType":"DIMENSION","dataType":"STRING"},
                    {"name":"views","columnType":"METRIC","dataType":"INTEGER"},
                    {"name":"estimatedMinutesWatched","columnType":"METRIC","dataType":"INTEGER"}
                  ],
                  "rows": [
                    ["2015-01-01", 120, 300],
                    ["2015-01-02", 80, 150]
                  ]
                }
              "#;
              return Ok::<_, hyper::Error>(
                Response::builder()
                  .status(StatusCode::OK)
                  .header("content-type", "application/json")
                  .body(Full::new(Bytes::from(body)))
                  .unwrap(),
              );
            }

            Ok::<_, hyper::Error>(
              Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from_static(b"The query is not supported.")))
                .unwrap(),
            )
          }),
        )
        .await
        .unwrap();
    }
  }

  #[tokio::test]
  async fn fetches_one_chunk_from_mock_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/", listener.local_addr().unwrap());
    let task = tokio::spawn(serve_reports(listener, 1));

    let client = YoutubeAnalyticsClient::new(base_url, Duration::from_secs(5));
    let table = client
      .fetch("token123", "UC123", chunk(), &MetricFamily::ChannelDaily.spec())
      .await
      .unwrap();

    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.column_index("estimatedMinutesWatched"), Some(2));

    task.await.unwrap();
  }

  #[tokio::test]
  async fn non_success_status_becomes_api_error_with_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/", listener.local_addr().unwrap());
    let task = tokio::spawn(serve_reports(listener, 2));

    let client = YoutubeAnalyticsClient::new(base_url, Duration::from_secs(5));

    let err = client
      .fetch("expired", "UC123", chunk(), &MetricFamily::ChannelDaily.spec())
      .await
      .unwrap_err();
    assert!(err.is_unauthorized());

    let err = client
      .fetch("token123", "UC123", chunk(), &MetricFamily::Geography.spec())
      .await
      .unwrap_err();
    match err {
      BackfillError::Api { status, body } => {
        assert_eq!(status, Some(400));
        assert!(body.contains("not supported"));
      }
      other => panic!("unexpected error: {other}"),
    }

    task.await.unwrap();
  }

  #[tokio::test]
  async fn slow_upstream_hits_the_call_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}/", listener.local_addr().unwrap());
    let task = tokio::spawn(async move {
      let (_stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = YoutubeAnalyticsClient::new(base_url, Duration::from_millis(200));
    let err = client
      .fetch("token123", "UC123", chunk(), &MetricFamily::ChannelDaily.spec())
      .await
      .unwrap_err();
    match err {
      BackfillError::Api { status, body } => {
        assert_eq!(status, None);
        assert!(body.contains("timed out"));
      }
      other => panic!("unexpected error: {other}"),
    }

    task.abort();
  }
}
