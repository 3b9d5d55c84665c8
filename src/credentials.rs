use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{BackfillError, Result};
use crate::providers::youtube::YoutubeOAuthTokens;

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
  pub account_id: String,
  /// Channel id the reporting queries run against.
  pub scope_id: String,
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
  pub version: i64,
}

impl Credential {
  /// A missing expiry is trusted until the API answers 401.
  pub fn needs_refresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
    self.expires_at.map(|t| now + margin >= t).unwrap_or(false)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidToken {
  pub access_token: String,
  pub scope_id: String,
  pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Credential> for ValidToken {
  fn from(cred: &Credential) -> Self {
    Self {
      access_token: cred.access_token.clone(),
      scope_id: cred.scope_id.clone(),
      expires_at: cred.expires_at,
    }
  }
}

/// `now + expires_in`, rejecting lifetimes chrono cannot represent.
pub fn expiry_after(now: DateTime<Utc>, expires_in_seconds: u64) -> Result<DateTime<Utc>> {
  i64::try_from(expires_in_seconds)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .and_then(|lifetime| now.checked_add_signed(lifetime))
    .ok_or_else(|| BackfillError::Auth(format!("invalid expires_in from token endpoint: {expires_in_seconds}")))
}

#[async_trait]
pub trait TokenStore: Send + Sync {
  async fn load(&self, account_id: &str) -> Result<Option<Credential>>;

  /// Writes `updated` only if the stored version still equals `expected_version`.
  /// Returns `false` when another writer got there first.
  async fn store_refreshed(&self, updated: &Credential, expected_version: i64) -> Result<bool>;

  /// Creates or replaces the credential after an OAuth code exchange.
  async fn save(&self, credential: &Credential) -> Result<()>;
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
  async fn refresh(&self, refresh_token: &str) -> Result<YoutubeOAuthTokens>;
}

pub struct TokenRefresher<'a> {
  store: &'a dyn TokenStore,
  endpoint: &'a dyn TokenEndpoint,
  margin: chrono::Duration,
}

impl<'a> TokenRefresher<'a> {
  pub fn new(store: &'a dyn TokenStore, endpoint: &'a dyn TokenEndpoint, margin: chrono::Duration) -> Self {
    Self { store, endpoint, margin }
  }

  pub async fn get_valid_token(&self, account_id: &str) -> Result<ValidToken> {
    let cred = self.load_required(account_id).await?;
    if !cred.needs_refresh(Utc::now(), self.margin) {
      return Ok(ValidToken::from(&cred));
    }
    debug!(account_id, expires_at = ?cred.expires_at, "access token expired; refreshing");
    let refreshed = self.refresh(cred).await?;
    Ok(ValidToken::from(&refreshed))
  }

  /// Refreshes regardless of the stored expiry (the API rejected a token that looked valid).
  pub async fn force_refresh(&self, account_id: &str) -> Result<ValidToken> {
    let cred = self.load_required(account_id).await?;
    let refreshed = self.refresh(cred).await?;
    Ok(ValidToken::from(&refreshed))
  }

  async fn load_required(&self, account_id: &str) -> Result<Credential> {
    self
      .store
      .load(account_id)
      .await
      .map_err(|e| BackfillError::CredentialStore(format!("failed to load credential: {e}")))?
      .ok_or_else(|| BackfillError::Auth(format!("missing youtube channel connection: account_id={account_id}")))
  }

  async fn refresh(&self, cred: Credential) -> Result<Credential> {
    let refresh_token = cred
      .refresh_token
      .clone()
      .filter(|t| !t.trim().is_empty())
      .ok_or_else(|| BackfillError::Auth(format!("no refresh token stored for account_id={}", cred.account_id)))?;

    let tokens = self.endpoint.refresh(&refresh_token).await.map_err(|e| match e {
      BackfillError::Auth(msg) => BackfillError::Auth(msg),
      other => BackfillError::Auth(other.to_string()),
    })?;

    let expires_at = tokens
      .expires_in_seconds
      .map(|secs| expiry_after(Utc::now(), secs))
      .transpose()?;

    let updated = Credential {
      access_token: tokens.access_token,
      refresh_token: tokens.refresh_token.or(Some(refresh_token)),
      expires_at,
      version: cred.version + 1,
      ..cred.clone()
    };

    let stored = self
      .store
      .store_refreshed(&updated, cred.version)
      .await
      .map_err(|e| BackfillError::CredentialStore(format!("failed to persist refreshed token: {e}")))?;
    if stored {
      info!(account_id = %updated.account_id, expires_at = ?updated.expires_at, "refreshed access token");
      return Ok(updated);
    }

    // Lost the optimistic race: someone else refreshed; adopt theirs if usable.
    let current = self.load_required(&cred.account_id).await?;
    if current.version > cred.version && !current.needs_refresh(Utc::now(), self.margin) {
      warn!(
        account_id = %cred.account_id,
        version = current.version,
        "token refreshed concurrently; using stored token"
      );
      return Ok(current);
    }

    Err(BackfillError::Auth(format!(
      "concurrent token refresh conflict for account_id={}",
      cred.account_id
    )))
  }
}

#[derive(Default)]
pub struct MemoryTokenStore {
  credentials: Mutex<HashMap<String, Credential>>,
}

impl MemoryTokenStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_credential(credential: Credential) -> Self {
    let store = Self::new();
    store.insert(credential);
    store
  }

  pub fn insert(&self, credential: Credential) {
    let mut guard = self.credentials.lock().unwrap_or_else(|p| p.into_inner());
    guard.insert(credential.account_id.clone(), credential);
  }

  pub fn get(&self, account_id: &str) -> Option<Credential> {
    let guard = self.credentials.lock().unwrap_or_else(|p| p.into_inner());
    guard.get(account_id).cloned()
  }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
  async fn load(&self, account_id: &str) -> Result<Option<Credential>> {
    Ok(self.get(account_id))
  }

  async fn store_refreshed(&self, updated: &Credential, expected_version: i64) -> Result<bool> {
    let mut guard = self.credentials.lock().unwrap_or_else(|p| p.into_inner());
    match guard.get_mut(&updated.account_id) {
      Some(current) if current.version == expected_version => {
        *current = updated.clone();
        Ok(true)
      }
      Some(_) => Ok(false),
      None => Err(BackfillError::Storage(format!(
        "credential disappeared for account_id={}",
        updated.account_id
      ))),
    }
  }

  async fn save(&self, credential: &Credential) -> Result<()> {
    self.insert(credential.clone());
    Ok(())
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  pub(crate) struct CountingEndpoint {
    pub calls: AtomicUsize,
    pub expires_in_seconds: Option<u64>,
    pub fail: bool,
  }

  impl CountingEndpoint {
    pub(crate) fn new(expires_in_seconds: Option<u64>) -> Self {
      Self {
        calls: AtomicUsize::new(0),
        expires_in_seconds,
        fail: false,
      }
    }

    pub(crate) fn failing() -> Self {
      Self {
        fail: true,
        ..Self::new(None)
      }
    }

    pub(crate) fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl TokenEndpoint for CountingEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<YoutubeOAuthTokens> {
      let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      if self.fail {
        return Err(BackfillError::Auth("invalid_grant: Token has been expired or revoked.".to_string()));
      }
      assert_eq!(refresh_token, "refresh-1");
      Ok(YoutubeOAuthTokens {
        access_token: format!("access-{}", n + 1),
        refresh_token: None,
        token_type: "Bearer".to_string(),
        scope: None,
        expires_in_seconds: self.expires_in_seconds,
      })
    }
  }

  pub(crate) fn credential(expires_at: Option<DateTime<Utc>>) -> Credential {
    Credential {
      account_id: "acct-1".to_string(),
      scope_id: "UC123".to_string(),
      access_token: "access-1".to_string(),
      refresh_token: Some("refresh-1".to_string()),
      expires_at,
      version: 1,
    }
  }

  fn margin() -> chrono::Duration {
    chrono::Duration::seconds(60)
  }

  #[tokio::test]
  async fn returns_stored_token_when_not_expired() {
    let store = MemoryTokenStore::with_credential(credential(Some(Utc::now() + chrono::Duration::hours(1))));
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let token = refresher.get_valid_token("acct-1").await.unwrap();
    assert_eq!(token.access_token, "access-1");
    assert_eq!(token.scope_id, "UC123");
    assert_eq!(endpoint.calls(), 0);
  }

  #[tokio::test]
  async fn refreshes_once_and_persists_expiry_when_expired() {
    let store = MemoryTokenStore::with_credential(credential(Some(Utc::now() - chrono::Duration::minutes(5))));
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let before = Utc::now();
    let token = refresher.get_valid_token("acct-1").await.unwrap();
    let after = Utc::now();

    assert_eq!(endpoint.calls(), 1);
    assert_eq!(token.access_token, "access-2");

    let stored = store.get("acct-1").unwrap();
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.version, 2);
    // Refresh responses without a new refresh token keep the old one.
    assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    let expires_at = stored.expires_at.unwrap();
    assert!(expires_at >= before + chrono::Duration::seconds(3600));
    assert!(expires_at <= after + chrono::Duration::seconds(3600));
  }

  #[tokio::test]
  async fn refreshes_inside_the_safety_margin() {
    let store = MemoryTokenStore::with_credential(credential(Some(Utc::now() + chrono::Duration::seconds(10))));
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    refresher.get_valid_token("acct-1").await.unwrap();
    assert_eq!(endpoint.calls(), 1);
  }

  #[tokio::test]
  async fn missing_credential_is_an_auth_error() {
    let store = MemoryTokenStore::new();
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let err = refresher.get_valid_token("nobody").await.unwrap_err();
    assert!(matches!(err, BackfillError::Auth(_)));
  }

  #[tokio::test]
  async fn revoked_refresh_token_is_an_auth_error() {
    let store = MemoryTokenStore::with_credential(credential(Some(Utc::now() - chrono::Duration::minutes(1))));
    let endpoint = CountingEndpoint::failing();
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let err = refresher.get_valid_token("acct-1").await.unwrap_err();
    assert!(matches!(err, BackfillError::Auth(_)));
    assert_eq!(endpoint.calls(), 1);
    assert_eq!(store.get("acct-1").unwrap().access_token, "access-1");
  }

  #[tokio::test]
  async fn expired_credential_without_refresh_token_is_an_auth_error() {
    let mut cred = credential(Some(Utc::now() - chrono::Duration::minutes(1)));
    cred.refresh_token = None;
    let store = MemoryTokenStore::with_credential(cred);
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let err = refresher.get_valid_token("acct-1").await.unwrap_err();
    assert!(matches!(err, BackfillError::Auth(_)));
    assert_eq!(endpoint.calls(), 0);
  }

  #[tokio::test]
  async fn force_refresh_ignores_stored_expiry() {
    let store = MemoryTokenStore::with_credential(credential(None));
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let token = refresher.force_refresh("acct-1").await.unwrap();
    assert_eq!(token.access_token, "access-2");
    assert_eq!(endpoint.calls(), 1);
  }

  #[tokio::test]
  async fn oversized_expires_in_is_an_auth_error() {
    let store = MemoryTokenStore::with_credential(credential(Some(Utc::now() - chrono::Duration::minutes(5))));
    let endpoint = CountingEndpoint::new(Some(u64::MAX / 2));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let err = refresher.get_valid_token("acct-1").await.unwrap_err();
    assert!(matches!(err, BackfillError::Auth(ref msg) if msg.contains("expires_in")));
    assert_eq!(store.get("acct-1").unwrap().access_token, "access-1");
  }

  #[test]
  fn expiry_after_bounds_the_lifetime() {
    let now = Utc::now();
    assert_eq!(expiry_after(now, 3600).unwrap(), now + chrono::Duration::seconds(3600));
    assert!(expiry_after(now, u64::MAX).is_err());
    assert!(expiry_after(now, i64::MAX as u64).is_err());
  }

  /// Fails every read, as a dropped database connection would.
  struct UnreachableStore;

  #[async_trait]
  impl TokenStore for UnreachableStore {
    async fn load(&self, _account_id: &str) -> Result<Option<Credential>> {
      Err(BackfillError::Storage("pool timed out while waiting for an open connection".to_string()))
    }

    async fn store_refreshed(&self, _updated: &Credential, _expected_version: i64) -> Result<bool> {
      Err(BackfillError::Storage("unreachable".to_string()))
    }

    async fn save(&self, _credential: &Credential) -> Result<()> {
      Err(BackfillError::Storage("unreachable".to_string()))
    }
  }

  #[tokio::test]
  async fn store_outage_is_not_reported_as_an_auth_failure() {
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&UnreachableStore, &endpoint, margin());

    let err = refresher.get_valid_token("acct-1").await.unwrap_err();
    assert!(matches!(err, BackfillError::CredentialStore(_)));
    assert!(err.is_fatal());
    assert_eq!(err.kind(), "credential_store_error");
    assert_eq!(endpoint.calls(), 0);
  }

  /// Simulates a second run that refreshed between our load and our write.
  struct RacingStore {
    inner: MemoryTokenStore,
    winner: Credential,
  }

  #[async_trait]
  impl TokenStore for RacingStore {
    async fn load(&self, account_id: &str) -> Result<Option<Credential>> {
      self.inner.load(account_id).await
    }

    async fn store_refreshed(&self, updated: &Credential, expected_version: i64) -> Result<bool> {
      self.inner.insert(self.winner.clone());
      self.inner.store_refreshed(updated, expected_version).await
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
      self.inner.save(credential).await
    }
  }

  #[tokio::test]
  async fn adopts_concurrently_refreshed_token_on_version_conflict() {
    let mut winner = credential(Some(Utc::now() + chrono::Duration::hours(1)));
    winner.access_token = "access-from-other-run".to_string();
    winner.version = 2;

    let store = RacingStore {
      inner: MemoryTokenStore::with_credential(credential(Some(Utc::now() - chrono::Duration::minutes(1)))),
      winner,
    };
    let endpoint = CountingEndpoint::new(Some(3600));
    let refresher = TokenRefresher::new(&store, &endpoint, margin());

    let token = refresher.get_valid_token("acct-1").await.unwrap();
    assert_eq!(token.access_token, "access-from-other-run");
    assert_eq!(endpoint.calls(), 1);
    assert_eq!(store.inner.get("acct-1").unwrap().version, 2);
  }
}
