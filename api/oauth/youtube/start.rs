use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use yt_backfill_rust::config::OAuthAppConfig;
use yt_backfill_rust::error::backfill_error_to_vercel_error;
use yt_backfill_rust::providers::youtube::{build_authorize_url, youtube_oauth_client_from_config};
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

#[derive(Deserialize, Default)]
struct StartRequest {
  #[serde(default)]
  state: Option<String>,
}

async fn handle_start(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  let parsed: StartRequest = if body.is_empty() {
    StartRequest::default()
  } else {
    match serde_json::from_slice(&body) {
      Ok(parsed) => parsed,
      Err(e) => {
        return json_response(
          StatusCode::BAD_REQUEST,
          serde_json::json!({"ok": false, "error": "bad_request", "message": format!("invalid json body: {e}")}),
        )
      }
    }
  };

  let cfg = match OAuthAppConfig::from_env() {
    Ok(cfg) if cfg.redirect_uri.is_some() => cfg,
    Ok(_) => {
      return json_response(
        StatusCode::NOT_IMPLEMENTED,
        serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing YOUTUBE_REDIRECT_URI"}),
      )
    }
    Err(e) => {
      return json_response(
        StatusCode::NOT_IMPLEMENTED,
        serde_json::json!({"ok": false, "error": "not_configured", "message": e.to_string()}),
      )
    }
  };

  let client = youtube_oauth_client_from_config(&cfg).map_err(backfill_error_to_vercel_error)?;
  let state = parsed.state.filter(|s| !s.trim().is_empty());
  let (authorize_url, state) = build_authorize_url(&client, state);

  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "authorize_url": authorize_url, "state": state}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_start(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  fn set_oauth_env() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");
    std::env::set_var("YOUTUBE_CLIENT_ID", "id");
    std::env::set_var("YOUTUBE_CLIENT_SECRET", "secret2");
    std::env::set_var("YOUTUBE_REDIRECT_URI", "https://example.com/cb");
  }

  fn authorized_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    headers.insert("content-type", "application/json".parse().unwrap());
    headers
  }

  async fn json_body(response: Response<ResponseBody>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
  }

  #[tokio::test]
  async fn returns_authorize_url_with_provided_state() {
    set_oauth_env();

    let body = Bytes::from(r#"{"state":"state123"}"#);
    let response = handle_start(&Method::POST, &authorized_headers(), body).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed = json_body(response).await;
    assert_eq!(parsed.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(parsed.get("state").and_then(|v| v.as_str()), Some("state123"));
    let url = parsed.get("authorize_url").and_then(|v| v.as_str()).unwrap();
    assert!(url.contains("accounts.google.com/o/oauth2/v2/auth"));
    assert!(url.contains("state=state123"));
    assert!(url.contains("yt-analytics-monetary.readonly"));
    assert!(url.contains("access_type=offline"));
  }

  #[tokio::test]
  async fn generates_state_when_none_given() {
    set_oauth_env();

    let response = handle_start(&Method::POST, &authorized_headers(), Bytes::new())
      .await
      .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let parsed = json_body(response).await;
    let state = parsed.get("state").and_then(|v| v.as_str()).unwrap();
    assert!(!state.is_empty());
  }

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let response = handle_start(&Method::POST, &headers, Bytes::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }
}
