use std::time::Duration;

use tracing::debug;

use crate::error::{BackfillError, Result};

pub const YOUTUBE_DATA_BASE_URL: &str = "https://youtube.googleapis.com/";

fn lookup_error(e: impl std::fmt::Display) -> BackfillError {
  BackfillError::Api {
    status: None,
    body: format!("channel lookup failed: {e}"),
  }
}

/// Resolves the channel id (the reporting scope) owned by an access token.
/// The whole lookup, connect included, is bounded by `timeout`.
pub async fn fetch_my_channel_id_with_base_url(access_token: &str, base_url: &str, timeout: Duration) -> Result<String> {
  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(lookup_error)?
    .https_or_http()
    .enable_http1()
    .build();
  let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let mut hub = google_youtube3::YouTube::new(client, access_token.to_string());
  hub.base_url(base_url.to_string());
  hub.root_url(base_url.to_string());

  let call = hub.channels().list(&vec!["id".into()]).mine(true).max_results(1).doit();
  let (_, response) = tokio::time::timeout(timeout, call)
    .await
    .map_err(|_| lookup_error(format!("request timed out after {}s", timeout.as_secs_f64())))?
    .map_err(lookup_error)?;

  let channel_id = response
    .items
    .unwrap_or_default()
    .into_iter()
    .filter_map(|channel| channel.id)
    .find(|id| !id.trim().is_empty())
    .ok_or_else(|| BackfillError::Auth("token grants access to no YouTube channel".to_string()))?;

  debug!(%channel_id, "resolved channel for token");
  Ok(channel_id)
}
