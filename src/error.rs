use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackfillError>;

#[derive(Debug, Error)]
pub enum BackfillError {
  /// Missing/invalid credential or a failed refresh. Fatal for the whole run.
  #[error("auth error: {0}")]
  Auth(String),

  #[error("{}", format_api_error(*status, body))]
  Api { status: Option<u16>, body: String },

  #[error("storage error: {0}")]
  Storage(String),

  /// The credential record could not be read or written. Fatal, but not the
  /// account's fault: callers should retry rather than reconnect.
  #[error("credential store error: {0}")]
  CredentialStore(String),

  #[error("invalid range: from_date ({from}) > to_date ({to})")]
  InvalidRange { from: NaiveDate, to: NaiveDate },

  #[error("config error: {0}")]
  Config(String),
}

fn format_api_error(status: Option<u16>, body: &str) -> String {
  match status {
    Some(status) => format!("YouTube Analytics error (status {status}): {body}"),
    None => format!("YouTube Analytics error: {body}"),
  }
}

impl BackfillError {
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      BackfillError::Auth(_) | BackfillError::Config(_) | BackfillError::CredentialStore(_)
    )
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, BackfillError::Api { status: Some(401), .. })
  }

  /// Short machine-readable tag used in JSON summaries.
  pub fn kind(&self) -> &'static str {
    match self {
      BackfillError::Auth(_) => "auth_error",
      BackfillError::Api { .. } => "api_error",
      BackfillError::Storage(_) => "storage_error",
      BackfillError::CredentialStore(_) => "credential_store_error",
      BackfillError::InvalidRange { .. } => "invalid_range",
      BackfillError::Config(_) => "config_error",
    }
  }
}

impl From<sqlx::Error> for BackfillError {
  fn from(err: sqlx::Error) -> Self {
    BackfillError::Storage(err.to_string())
  }
}

pub fn backfill_error_to_vercel_error(err: BackfillError) -> vercel_runtime::Error {
  Box::new(err) as vercel_runtime::Error
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn api_error_display_includes_status_when_known() {
    let err = BackfillError::Api {
      status: Some(403),
      body: "forbidden".to_string(),
    };
    assert_eq!(err.to_string(), "YouTube Analytics error (status 403): forbidden");

    let err = BackfillError::Api {
      status: None,
      body: "timed out".to_string(),
    };
    assert_eq!(err.to_string(), "YouTube Analytics error: timed out");
  }

  #[test]
  fn run_level_errors_are_fatal() {
    assert!(BackfillError::Auth("revoked".into()).is_fatal());
    assert!(BackfillError::Config("missing".into()).is_fatal());
    assert!(BackfillError::CredentialStore("pool timed out".into()).is_fatal());
    assert_eq!(BackfillError::CredentialStore("x".into()).kind(), "credential_store_error");
    assert!(!BackfillError::Storage("dup".into()).is_fatal());
    assert!(!BackfillError::Api { status: Some(500), body: String::new() }.is_fatal());
  }

  #[test]
  fn detects_unauthorized_api_errors() {
    assert!(BackfillError::Api { status: Some(401), body: String::new() }.is_unauthorized());
    assert!(!BackfillError::Api { status: Some(403), body: String::new() }.is_unauthorized());
    assert!(!BackfillError::Auth("x".into()).is_unauthorized());
  }
}
