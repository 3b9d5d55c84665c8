use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tracing::{error, info};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use yt_backfill_rust::backfill::{BackfillOrchestrator, ComprehensiveReport, RunAborted};
use yt_backfill_rust::config::{default_to_date, has_database_url, historical_floor, BackfillConfig, OAuthAppConfig};
use yt_backfill_rust::credentials::TokenRefresher;
use yt_backfill_rust::db::{get_pool, MySqlMetricSink, MySqlTokenStore};
use yt_backfill_rust::error::{BackfillError, Result as BackfillResult};
use yt_backfill_rust::metrics::MetricFamily;
use yt_backfill_rust::providers::youtube::OAuthTokenEndpoint;
use yt_backfill_rust::providers::youtube_analytics::YoutubeAnalyticsClient;
use yt_backfill_rust::telemetry::init_tracing;

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn bad_request(message: impl Into<String>) -> Result<Response<ResponseBody>, Error> {
  json_response(
    StatusCode::BAD_REQUEST,
    serde_json::json!({"ok": false, "error": "bad_request", "message": message.into()}),
  )
}

fn query_value<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
  query?
    .split('&')
    .filter_map(|pair| pair.split_once('='))
    .find(|(k, _)| *k == key)
    .map(|(_, v)| v)
}

fn parse_date(raw: Option<&str>, field: &str) -> std::result::Result<Option<NaiveDate>, String> {
  match raw.map(str::trim).filter(|v| !v.is_empty()) {
    None => Ok(None),
    Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
      .map(Some)
      .map_err(|_| format!("{field} must be YYYY-MM-DD, got {v:?}")),
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
  Comprehensive,
  Family(MetricFamily),
}

fn parse_selection(query: Option<&str>) -> std::result::Result<Selection, String> {
  match query_value(query, "family").map(str::trim) {
    None | Some("") | Some("comprehensive") => Ok(Selection::Comprehensive),
    Some(name) => MetricFamily::parse(name)
      .map(Selection::Family)
      .ok_or_else(|| format!("unknown family: {name}")),
  }
}

#[derive(Deserialize)]
struct BackfillRequest {
  account_id: String,
  #[serde(default)]
  from_date: Option<String>,
  #[serde(default)]
  to_date: Option<String>,
}

fn error_status(err: &BackfillError) -> StatusCode {
  match err {
    BackfillError::Auth(_) => StatusCode::UNAUTHORIZED,
    BackfillError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
    BackfillError::Config(_) => StatusCode::NOT_IMPLEMENTED,
    BackfillError::Api { .. } => StatusCode::BAD_GATEWAY,
    BackfillError::Storage(_) | BackfillError::CredentialStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

fn error_response(err: &BackfillError) -> Result<Response<ResponseBody>, Error> {
  json_response(
    error_status(err),
    serde_json::json!({"ok": false, "error": err.kind(), "message": err.to_string()}),
  )
}

/// Error body for a run that stopped partway; keeps the summary of families that finished.
fn aborted_response(aborted: &RunAborted) -> Result<Response<ResponseBody>, Error> {
  let mut body = aborted.partial.summary();
  body["ok"] = serde_json::Value::Bool(false);
  body["success"] = serde_json::Value::Bool(false);
  body["error"] = serde_json::json!(aborted.error.kind());
  body["message"] = serde_json::json!(aborted.error.to_string());
  json_response(error_status(&aborted.error), body)
}

async fn run_backfill(
  account_id: &str,
  selection: Selection,
  from_dt: NaiveDate,
  to_dt: NaiveDate,
) -> std::result::Result<ComprehensiveReport, RunAborted> {
  let setup = async {
    let cfg = BackfillConfig::from_env()?;
    let oauth = OAuthAppConfig::from_env()?;
    let pool = get_pool().await?;
    let endpoint = OAuthTokenEndpoint::new(&oauth, cfg.http_timeout)?;
    BackfillResult::Ok((cfg, pool, endpoint))
  };
  let (cfg, pool, endpoint) = setup.await.map_err(RunAborted::from)?;

  let store = MySqlTokenStore::new(pool.clone());
  let source = YoutubeAnalyticsClient::new(cfg.analytics_base_url.clone(), cfg.http_timeout);
  let sink = MySqlMetricSink::new(pool.clone());

  let orchestrator = BackfillOrchestrator::new(
    TokenRefresher::new(&store, &endpoint, cfg.token_margin),
    &source,
    &sink,
    &cfg,
  );

  let families = match selection {
    Selection::Comprehensive => MetricFamily::ALL.to_vec(),
    Selection::Family(family) => vec![family],
  };
  orchestrator.run_families(account_id, &families, from_dt, to_dt).await
}

async fn handle_backfill(
  method: &Method,
  headers: &HeaderMap,
  query: Option<&str>,
  body: Bytes,
) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  let selection = match parse_selection(query) {
    Ok(selection) => selection,
    Err(message) => return bad_request(message),
  };

  let parsed: BackfillRequest = match serde_json::from_slice(&body) {
    Ok(parsed) => parsed,
    Err(e) => return bad_request(format!("invalid json body: {e}")),
  };
  let account_id = parsed.account_id.trim();
  if account_id.is_empty() {
    return bad_request("account_id is required");
  }

  let (from_dt, to_dt) = match (
    parse_date(parsed.from_date.as_deref(), "from_date"),
    parse_date(parsed.to_date.as_deref(), "to_date"),
  ) {
    (Ok(from), Ok(to)) => (from.unwrap_or_else(historical_floor), to.unwrap_or_else(default_to_date)),
    (Err(message), _) | (_, Err(message)) => return bad_request(message),
  };
  if from_dt > to_dt {
    return error_response(&BackfillError::InvalidRange { from: from_dt, to: to_dt });
  }

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  info!(account_id, ?selection, %from_dt, %to_dt, "backfill requested");
  match run_backfill(account_id, selection, from_dt, to_dt).await {
    Ok(report) => {
      let mut summary = report.summary();
      summary["ok"] = serde_json::Value::Bool(true);
      json_response(StatusCode::OK, summary)
    }
    Err(aborted) => {
      error!(
        account_id,
        error = %aborted.error,
        finished_families = aborted.partial.families.len(),
        "backfill aborted"
      );
      aborted_response(&aborted)
    }
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let query = req.uri().query().map(str::to_string);
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_backfill(&method, &headers, query.as_deref(), bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}
