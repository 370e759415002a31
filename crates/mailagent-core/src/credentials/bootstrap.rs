//! Credential bootstrap collaborator
//!
//! Supplies the initial refresh token of a session and performs refresh
//! exchanges against an OAuth 2.0 token endpoint. The consent flow that
//! produces the first refresh token happens elsewhere; its output is read
//! from `<data_dir>/credentials/<session>.refresh_token` or the
//! `MAILAGENT_REFRESH_TOKEN` environment variable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::CredentialsConfig;
use crate::error::Result;

/// Environment variable consulted before the credentials directory
pub const REFRESH_TOKEN_ENV: &str = "MAILAGENT_REFRESH_TOKEN";

/// Failure reported by the bootstrap collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// No refresh token has been provisioned for the session
    #[error("no refresh token provisioned: {0}")]
    NotAuthorized(String),

    /// The provider refused the refresh token
    #[error("refresh token revoked: {0}")]
    Revoked(String),

    /// The token endpoint could not be reached or answered with an error
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a successful refresh exchange
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,

    /// Rotated refresh token, if the provider issued one
    pub refresh_token: Option<String>,

    /// Lifetime of the access token in seconds
    pub expires_in: i64,

    pub scopes: Vec<String>,
}

/// Boundary with the credential bootstrap collaborator
#[async_trait]
pub trait CredentialBootstrap: Send + Sync {
    /// Read the refresh token produced by the external consent flow
    async fn load_initial_refresh_token(
        &self,
        session_id: &str,
    ) -> std::result::Result<String, BootstrapError>;

    /// Exchange a refresh token for a new access token
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, BootstrapError>;
}

/// Response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    #[allow(dead_code)]
    token_type: Option<String>,
    scope: Option<String>,
}

/// Error body from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Bootstrap against an OAuth 2.0 token endpoint (Google by default)
pub struct OAuthBootstrap {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    credentials_dir: PathBuf,
}

impl OAuthBootstrap {
    /// Create from configuration, reading client credentials from the
    /// configured environment variables or `~/.secrets`
    pub fn new(config: &CredentialsConfig, credentials_dir: impl Into<PathBuf>) -> Self {
        let (client_id, client_secret) = load_client_credentials(config);
        Self {
            client: Client::new(),
            token_url: config.token_url.clone(),
            client_id,
            client_secret,
            credentials_dir: credentials_dir.into(),
        }
    }

    fn refresh_token_path(&self, session_id: &str) -> PathBuf {
        refresh_token_path(&self.credentials_dir, session_id)
    }
}

#[async_trait]
impl CredentialBootstrap for OAuthBootstrap {
    async fn load_initial_refresh_token(
        &self,
        session_id: &str,
    ) -> std::result::Result<String, BootstrapError> {
        if let Ok(token) = std::env::var(REFRESH_TOKEN_ENV) {
            if !token.trim().is_empty() {
                debug!("Using refresh token from {}", REFRESH_TOKEN_ENV);
                return Ok(token.trim().to_string());
            }
        }

        let path = self.refresh_token_path(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.trim().is_empty() => {
                debug!("Read refresh token from {:?}", path);
                Ok(contents.trim().to_string())
            }
            Ok(_) => Err(BootstrapError::NotAuthorized(format!("{:?} is empty", path))),
            Err(e) => Err(BootstrapError::NotAuthorized(format!(
                "cannot read {:?}: {}",
                path, e
            ))),
        }
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, BootstrapError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| BootstrapError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Token refresh failed: {} - {}", status, body);
            return Err(classify_refresh_failure(status, &body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| BootstrapError::Unavailable(format!("malformed token response: {}", e)))?;

        Ok(TokenGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_in: token_response.expires_in,
            scopes: token_response
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        })
    }
}

/// `invalid_grant` means the refresh token is dead; anything else is an outage
fn classify_refresh_failure(status: StatusCode, body: &str) -> BootstrapError {
    let parsed: Option<TokenErrorResponse> = serde_json::from_str(body).ok();
    match parsed {
        Some(err) if err.error == "invalid_grant" || err.error == "unauthorized_client" => {
            BootstrapError::Revoked(
                err.error_description
                    .unwrap_or_else(|| err.error.clone()),
            )
        }
        _ if status == StatusCode::UNAUTHORIZED => {
            BootstrapError::Revoked(format!("{} - {}", status, body))
        }
        _ => BootstrapError::Unavailable(format!("{} - {}", status, body)),
    }
}

/// Path of the bootstrap refresh token file for a session
pub fn refresh_token_path(credentials_dir: &Path, session_id: &str) -> PathBuf {
    credentials_dir.join(format!("{}.refresh_token", sanitize_session_id(session_id)))
}

/// Write the refresh token produced by an external consent flow
pub fn seed_refresh_token(credentials_dir: &Path, session_id: &str, token: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(credentials_dir)?;
    let path = refresh_token_path(credentials_dir, session_id);
    std::fs::write(&path, token.trim())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!("Seeded refresh token for session {}", session_id);
    Ok(path)
}

/// Keep session ids usable as file names
pub(crate) fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Load OAuth client credentials from env vars or ~/.secrets file
fn load_client_credentials(config: &CredentialsConfig) -> (String, String) {
    let client_id = std::env::var(&config.client_id_env).ok();
    let client_secret = std::env::var(&config.client_secret_env).ok();

    if let (Some(id), Some(secret)) = (client_id, client_secret) {
        return (id, secret);
    }

    if let Some(home) = dirs::home_dir() {
        if let Ok(contents) = std::fs::read_to_string(home.join(".secrets")) {
            if let (Some(id), Some(secret)) = parse_secrets_file(
                &contents,
                &config.client_id_env,
                &config.client_secret_env,
            ) {
                return (id, secret);
            }
        }
    }

    // The token endpoint will reject these; surfaces as ReauthRequired
    (String::new(), String::new())
}

/// Parse shell-style exports from a secrets file
fn parse_secrets_file(
    contents: &str,
    id_key: &str,
    secret_key: &str,
) -> (Option<String>, Option<String>) {
    let mut client_id = None;
    let mut client_secret = None;

    for line in contents.lines() {
        // Parse: export VAR_NAME="value" or export VAR_NAME='value'
        let Some(rest) = line.trim().strip_prefix("export ") else {
            continue;
        };
        if let Some((key, value)) = rest.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
            match key.trim() {
                k if k == id_key => client_id = Some(value),
                k if k == secret_key => client_secret = Some(value),
                _ => {}
            }
        }
    }

    (client_id, client_secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secrets_file() {
        let contents = r#"
            export OTHER=1
            export MAILAGENT_CLIENT_ID="id-123"
            export MAILAGENT_CLIENT_SECRET='secret-456'
        "#;
        let (id, secret) =
            parse_secrets_file(contents, "MAILAGENT_CLIENT_ID", "MAILAGENT_CLIENT_SECRET");
        assert_eq!(id.as_deref(), Some("id-123"));
        assert_eq!(secret.as_deref(), Some("secret-456"));
    }

    #[test]
    fn test_invalid_grant_is_revoked() {
        let err = classify_refresh_failure(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
        );
        assert_eq!(
            err,
            BootstrapError::Revoked("Token has been expired or revoked.".to_string())
        );

        let outage = classify_refresh_failure(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(matches!(outage, BootstrapError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_seeded_token_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        seed_refresh_token(dir.path(), "work/inbox", "  refresh-abc\n").unwrap();

        let bootstrap = OAuthBootstrap {
            client: Client::new(),
            token_url: "http://127.0.0.1:9/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            credentials_dir: dir.path().to_path_buf(),
        };

        if std::env::var(REFRESH_TOKEN_ENV).is_err() {
            let token = bootstrap.load_initial_refresh_token("work/inbox").await.unwrap();
            assert_eq!(token, "refresh-abc");
            assert!(bootstrap.load_initial_refresh_token("other").await.is_err());
        }
    }
}
