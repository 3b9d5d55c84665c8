use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use tracing::{error, info};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use yt_backfill_rust::config::{has_database_url, BackfillConfig, OAuthAppConfig};
use yt_backfill_rust::credentials::{expiry_after, Credential, TokenStore};
use yt_backfill_rust::db::{get_pool, MySqlTokenStore};
use yt_backfill_rust::error::{BackfillError, Result as BackfillResult};
use yt_backfill_rust::providers::youtube::{
  exchange_code_for_tokens, youtube_oauth_client_from_config, YoutubeOAuthClient,
};
use yt_backfill_rust::providers::youtube_api::{fetch_my_channel_id_with_base_url, YOUTUBE_DATA_BASE_URL};
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

#[derive(Deserialize)]
struct ExchangeRequest {
  account_id: String,
  code: String,
}

/// Trades an authorization code for tokens, resolves the channel they grant
/// access to, and stores the resulting credential.
async fn connect_account(
  store: &dyn TokenStore,
  client: &YoutubeOAuthClient,
  account_id: &str,
  code: &str,
  timeout: StdDuration,
  data_base_url: &str,
) -> BackfillResult<Credential> {
  let tokens = exchange_code_for_tokens(client, code, timeout).await?;
  if tokens.refresh_token.is_none() {
    info!(account_id, "code exchange returned no refresh token; keeping the stored one");
  }

  let expires_at = tokens
    .expires_in_seconds
    .map(|secs| expiry_after(Utc::now(), secs))
    .transpose()?;
  let scope_id = fetch_my_channel_id_with_base_url(&tokens.access_token, data_base_url, timeout).await?;

  let credential = Credential {
    account_id: account_id.to_string(),
    scope_id,
    access_token: tokens.access_token,
    refresh_token: tokens.refresh_token,
    expires_at,
    version: 1,
  };
  store.save(&credential).await?;

  Ok(credential)
}

async fn handle_exchange(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  let parsed: ExchangeRequest = match serde_json::from_slice(&body) {
    Ok(parsed) => parsed,
    Err(e) => {
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"ok": false, "error": "bad_request", "message": format!("invalid json body: {e}")}),
      )
    }
  };

  if parsed.account_id.trim().is_empty() || parsed.code.trim().is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "account_id and code are required"}),
    );
  }

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let result: BackfillResult<Credential> = async {
    let cfg = BackfillConfig::from_env()?;
    let oauth = OAuthAppConfig::from_env()?;
    let client = youtube_oauth_client_from_config(&oauth)?;
    let store = MySqlTokenStore::new(get_pool().await?.clone());
    connect_account(
      &store,
      &client,
      parsed.account_id.trim(),
      &parsed.code,
      cfg.http_timeout,
      YOUTUBE_DATA_BASE_URL,
    )
    .await
  }
  .await;

  match result {
    Ok(credential) => {
      info!(account_id = %credential.account_id, channel_id = %credential.scope_id, "youtube channel connected");
      json_response(
        StatusCode::OK,
        serde_json::json!({
          "ok": true,
          "account_id": credential.account_id,
          "channel_id": credential.scope_id,
          "expires_at": credential.expires_at.map(|t| t.to_rfc3339()),
        }),
      )
    }
    Err(err) => {
      error!(account_id = %parsed.account_id, error = %err, "youtube code exchange failed");
      let status = match err {
        BackfillError::Auth(_) => StatusCode::UNAUTHORIZED,
        BackfillError::Config(_) => StatusCode::NOT_IMPLEMENTED,
        BackfillError::Api { .. } => StatusCode::BAD_GATEWAY,
        BackfillError::InvalidRange { .. } => StatusCode::BAD_REQUEST,
        BackfillError::Storage(_) | BackfillError::CredentialStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
      };
      json_response(
        status,
        serde_json::json!({"ok": false, "error": err.kind(), "message": err.to_string()}),
      )
    }
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_exchange(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  run(service_fn(handler)).await
}
