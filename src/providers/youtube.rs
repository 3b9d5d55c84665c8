use std::time::Duration;

use async_trait::async_trait;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
  AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
  RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Serialize;

use crate::config::OAuthAppConfig;
use crate::credentials::TokenEndpoint;
use crate::error::{BackfillError, Result};

pub type YoutubeOAuthClient =
  BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

#[derive(Debug, Clone, Serialize)]
pub struct YoutubeOAuthTokens {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub token_type: String,
  pub scope: Option<String>,
  pub expires_in_seconds: Option<u64>,
}

pub fn youtube_oauth_client_from_config(cfg: &OAuthAppConfig) -> Result<YoutubeOAuthClient> {
  if cfg.client_id.trim().is_empty() {
    return Err(BackfillError::Config("Missing YOUTUBE_CLIENT_ID".to_string()));
  }
  if cfg.client_secret.trim().is_empty() {
    return Err(BackfillError::Config("Missing YOUTUBE_CLIENT_SECRET".to_string()));
  }

  let auth_url =
    AuthUrl::new(GOOGLE_AUTH_URL.to_string()).map_err(|e| BackfillError::Config(e.to_string()))?;
  let token_url =
    TokenUrl::new(cfg.token_url.clone()).map_err(|e| BackfillError::Config(format!("invalid token url: {e}")))?;

  // Google accepts client credentials in the form body; keep them out of the Authorization header.
  let mut client = BasicClient::new(ClientId::new(cfg.client_id.clone()))
    .set_client_secret(ClientSecret::new(cfg.client_secret.clone()))
    .set_auth_uri(auth_url)
    .set_token_uri(token_url)
    .set_auth_type(AuthType::RequestBody);

  if let Some(redirect_uri) = cfg.redirect_uri.as_deref().filter(|v| !v.trim().is_empty()) {
    let redirect_url = RedirectUrl::new(redirect_uri.to_string())
      .map_err(|e| BackfillError::Config(format!("invalid redirect uri: {e}")))?;
    client = client.set_redirect_uri(redirect_url);
  }

  Ok(client)
}

pub fn build_authorize_url(client: &YoutubeOAuthClient, state: Option<String>) -> (String, String) {
  let (url, csrf) = client
    .authorize_url(|| {
      state
        .clone()
        .map(CsrfToken::new)
        .unwrap_or_else(CsrfToken::new_random)
    })
    .add_scope(Scope::new(
      "https://www.googleapis.com/auth/youtube.readonly".to_string(),
    ))
    .add_scope(Scope::new(
      "https://www.googleapis.com/auth/yt-analytics.readonly".to_string(),
    ))
    .add_scope(Scope::new(
      "https://www.googleapis.com/auth/yt-analytics-monetary.readonly".to_string(),
    ))
    .add_extra_param("access_type", "offline")
    .add_extra_param("prompt", "consent")
    .url();

  (url.to_string(), csrf.secret().to_string())
}

fn oauth_http_client(timeout: Duration) -> Result<oauth2::reqwest::Client> {
  oauth2::reqwest::ClientBuilder::new()
    .redirect(oauth2::reqwest::redirect::Policy::none())
    .connect_timeout(Duration::from_secs(10).min(timeout))
    .timeout(timeout)
    .build()
    .map_err(|e| BackfillError::Config(e.to_string()))
}

fn tokens_from_response(token: &BasicTokenResponse) -> YoutubeOAuthTokens {
  YoutubeOAuthTokens {
    access_token: token.access_token().secret().to_string(),
    refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
    token_type: token.token_type().as_ref().to_string(),
    scope: token
      .scopes()
      .map(|scopes| scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")),
    expires_in_seconds: token.expires_in().map(|d| d.as_secs()),
  }
}

pub async fn exchange_code_for_tokens(
  client: &YoutubeOAuthClient,
  code: &str,
  timeout: Duration,
) -> Result<YoutubeOAuthTokens> {
  let http_client = oauth_http_client(timeout)?;

  let token = client
    .exchange_code(AuthorizationCode::new(code.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| BackfillError::Auth(format!("code exchange failed: {e}")))?;

  Ok(tokens_from_response(&token))
}

pub async fn refresh_tokens(
  client: &YoutubeOAuthClient,
  refresh_token: &str,
  timeout: Duration,
) -> Result<YoutubeOAuthTokens> {
  let http_client = oauth_http_client(timeout)?;

  let token = client
    .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| BackfillError::Auth(format!("token refresh failed: {e}")))?;

  Ok(tokens_from_response(&token))
}

/// Google's token endpoint as a [`TokenEndpoint`].
pub struct OAuthTokenEndpoint {
  client: YoutubeOAuthClient,
  timeout: Duration,
}

impl OAuthTokenEndpoint {
  pub fn new(cfg: &OAuthAppConfig, timeout: Duration) -> Result<Self> {
    Ok(Self {
      client: youtube_oauth_client_from_config(cfg)?,
      timeout,
    })
  }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
  async fn refresh(&self, refresh_token: &str) -> Result<YoutubeOAuthTokens> {
    refresh_tokens(&self.client, refresh_token, self.timeout).await
  }
}
