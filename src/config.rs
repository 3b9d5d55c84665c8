use std::time::Duration;

use chrono::{NaiveDate, Utc};
use chrono_tz::America::Los_Angeles;

use crate::error::{BackfillError, Result};

pub const DEFAULT_ANALYTICS_BASE_URL: &str = "https://youtubeanalytics.googleapis.com/";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub fn historical_floor() -> NaiveDate {
  NaiveDate::from_ymd_opt(2015, 1, 1).expect("valid floor date")
}

/// "Yesterday" in the timezone YouTube Analytics reports in.
pub fn default_to_date() -> NaiveDate {
  let today = Utc::now().with_timezone(&Los_Angeles).date_naive();
  today.pred_opt().unwrap_or(today)
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
  pub analytics_base_url: String,
  pub call_delay: Duration,
  pub family_delay: Duration,
  pub http_timeout: Duration,
  pub token_margin: chrono::Duration,
}

impl Default for BackfillConfig {
  fn default() -> Self {
    Self {
      analytics_base_url: DEFAULT_ANALYTICS_BASE_URL.to_string(),
      call_delay: Duration::from_millis(500),
      family_delay: Duration::from_millis(1000),
      http_timeout: Duration::from_secs(45),
      token_margin: chrono::Duration::seconds(60),
    }
  }
}

impl BackfillConfig {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let mut cfg = Self::default();

    if let Some(url) = non_empty(lookup("YOUTUBE_ANALYTICS_BASE_URL")) {
      if !url.contains("://") {
        return Err(BackfillError::Config(format!(
          "Invalid YOUTUBE_ANALYTICS_BASE_URL (expected URL scheme): {url}"
        )));
      }
      cfg.analytics_base_url = url;
    }
    if let Some(ms) = parse_u64(&lookup, "BACKFILL_CALL_DELAY_MS")? {
      cfg.call_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_u64(&lookup, "BACKFILL_FAMILY_DELAY_MS")? {
      cfg.family_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = parse_u64(&lookup, "BACKFILL_HTTP_TIMEOUT_SECS")? {
      if secs == 0 {
        return Err(BackfillError::Config("BACKFILL_HTTP_TIMEOUT_SECS must be > 0".to_string()));
      }
      cfg.http_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = parse_u64(&lookup, "BACKFILL_TOKEN_MARGIN_SECS")? {
      cfg.token_margin = chrono::Duration::seconds(secs.min(3600) as i64);
    }

    Ok(cfg)
  }

  /// Zero delays; for tests and dry runs.
  pub fn without_delays(mut self) -> Self {
    self.call_delay = Duration::ZERO;
    self.family_delay = Duration::ZERO;
    self
  }
}

#[derive(Debug, Clone)]
pub struct OAuthAppConfig {
  pub client_id: String,
  pub client_secret: String,
  pub redirect_uri: Option<String>,
  pub token_url: String,
}

impl OAuthAppConfig {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let client_id = non_empty(lookup("YOUTUBE_CLIENT_ID"))
      .ok_or_else(|| BackfillError::Config("Missing YOUTUBE_CLIENT_ID".to_string()))?;
    let client_secret = non_empty(lookup("YOUTUBE_CLIENT_SECRET"))
      .ok_or_else(|| BackfillError::Config("Missing YOUTUBE_CLIENT_SECRET".to_string()))?;
    let redirect_uri = non_empty(lookup("YOUTUBE_REDIRECT_URI"));
    let token_url = non_empty(lookup("YOUTUBE_TOKEN_URL")).unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string());

    Ok(Self {
      client_id,
      client_secret,
      redirect_uri,
      token_url,
    })
  }
}

pub fn database_url() -> Result<String> {
  let url = std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .unwrap_or_default();
  let trimmed = url.trim();
  if trimmed.is_empty() {
    return Err(BackfillError::Config(
      "Missing TIDB_DATABASE_URL (or DATABASE_URL)".to_string(),
    ));
  }
  if !trimmed.contains("://") {
    return Err(BackfillError::Config(
      "Invalid TIDB_DATABASE_URL/DATABASE_URL (expected URL scheme like mysql://...)".to_string(),
    ));
  }
  Ok(trimmed.to_string())
}

pub fn has_database_url() -> bool {
  std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map(|v| !v.trim().is_empty())
    .unwrap_or(false)
}

fn non_empty(value: Option<String>) -> Option<String> {
  value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
  match non_empty(lookup(key)) {
    None => Ok(None),
    Some(raw) => raw
      .parse::<u64>()
      .map(Some)
      .map_err(|_| BackfillError::Config(format!("{key} must be a non-negative integer, got {raw:?}"))),
  }
}
