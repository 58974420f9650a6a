//! Google OAuth2 authorization for the drive client.
//!
//! Tokens are kept behind a [`TokenStore`] so the persistence mechanism can
//! be swapped. The [`Authenticator`] hands out access tokens and refreshes
//! them under a lock when they expire.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use axum::{extract::Query, routing::get, Router};
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    sync::{oneshot, Mutex},
};

use crate::constants::{DRIVE_SCOPE, TOKEN_EXPIRY_SKEW};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unable to read client secrets {path}: {source}")]
    SecretsIo {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid client secrets: {0}")]
    InvalidSecrets(String),
    #[error("token store failure: {0}")]
    Store(anyhow::Error),
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint rejected the request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("token expired and no refresh token is available")]
    NoRefreshToken,
    #[error("authorization flow failed: {0}")]
    Flow(String),
}

/// Cached google authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Token {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.is_empty() {
            return false;
        }
        let skew = chrono::Duration::from_std(TOKEN_EXPIRY_SKEW).unwrap_or_default();
        self.expires_at.map_or(true, |at| at - skew > now)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    // Refresh responses usually omit the refresh token, keep the previous one.
    fn into_token(self, previous_refresh: Option<String>) -> Token {
        Token {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: self.scope,
        }
    }
}

/// Client secrets downloaded from the google cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::SecretsIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, AuthError> {
        let file: ClientSecretsFile = serde_json::from_str(content)
            .map_err(|e| AuthError::InvalidSecrets(e.to_string()))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| AuthError::InvalidSecrets("expected an `installed` or `web` client".into()))
    }

    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<Url, AuthError> {
        Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", DRIVE_SCOPE),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| AuthError::InvalidSecrets(format!("auth_uri: {e}")))
    }
}

/// Persistence for the authorization token.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> anyhow::Result<Option<Token>>;
    async fn save(&self, token: &Token) -> anyhow::Result<()>;
}

/// Token cache kept as json on local disk.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> anyhow::Result<Option<Token>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&content) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                // A broken cache is replaced by a fresh authorization.
                tracing::warn!("Ignore invalid token cache {}: {e}", self.path.display());
                Ok(None)
            }
        }
    }

    async fn save(&self, token: &Token) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(token)?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        // The cache holds the refresh token, keep it private to the owner.
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // an older cache may have been created with wider permissions
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        file.write_all(&content).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryTokenStore {
    pub token: parking_lot::Mutex<Option<Token>>,
}

#[cfg(test)]
impl MemoryTokenStore {
    pub fn with_token(token: Token) -> Self {
        Self {
            token: parking_lot::Mutex::new(Some(token)),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> anyhow::Result<Option<Token>> {
        Ok(self.token.lock().clone())
    }

    async fn save(&self, token: &Token) -> anyhow::Result<()> {
        *self.token.lock() = Some(token.clone());
        Ok(())
    }
}

pub struct Authenticator {
    secrets: ClientSecrets,
    store: Arc<dyn TokenStore>,
    http: reqwest::Client,
    token: Mutex<Option<Token>>,
}

impl Authenticator {
    pub fn new(secrets: ClientSecrets, store: Arc<dyn TokenStore>, http: reqwest::Client) -> Self {
        Self {
            secrets,
            store,
            http,
            token: Mutex::new(None),
        }
    }

    /// Make sure a usable token exists, running the browser flow if needed.
    ///
    /// Called once at startup; any error here is fatal.
    pub async fn authorize(&self) -> Result<(), AuthError> {
        let mut guard = self.token.lock().await;
        let cached = self.store.load().await.map_err(AuthError::Store)?;

        let token = match cached {
            Some(token) if token.is_valid_at(Utc::now()) => {
                tracing::info!("Use cached google token");
                token
            }
            Some(Token {
                refresh_token: Some(refresh_token),
                ..
            }) => {
                tracing::info!("Cached google token expired, refreshing");
                let token = self.refresh(&refresh_token).await?;
                self.store.save(&token).await.map_err(AuthError::Store)?;
                token
            }
            _ => {
                let token = self.run_loopback_flow().await?;
                self.store.save(&token).await.map_err(AuthError::Store)?;
                token
            }
        };
        *guard = Some(token);
        Ok(())
    }

    /// Return a valid access token, refreshing it first when expired.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut guard = self.token.lock().await;
        if guard.is_none() {
            *guard = self.store.load().await.map_err(AuthError::Store)?;
        }
        let refresh_token = match guard.as_ref() {
            Some(token) if token.is_valid_at(Utc::now()) => return Ok(token.access_token.clone()),
            Some(token) => token.refresh_token.clone(),
            None => None,
        };
        let refresh_token = refresh_token.ok_or(AuthError::NoRefreshToken)?;

        let token = self.refresh(&refresh_token).await?;
        self.store.save(&token).await.map_err(AuthError::Store)?;
        tracing::info!("Google token refreshed");
        let access_token = token.access_token.clone();
        *guard = Some(token);
        Ok(access_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token, AuthError> {
        let resp = self
            .token_request(&[
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .await?;
        Ok(resp.into_token(Some(refresh_token.to_string())))
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Token, AuthError> {
        let resp = self
            .token_request(&[
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .await?;
        Ok(resp.into_token(None))
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let resp = self
            .http
            .post(&self.secrets.token_uri)
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }
        Ok(resp.json().await?)
    }

    /// Installed-app flow: wait for google to redirect the browser to a
    /// loopback listener carrying the authorization code.
    async fn run_loopback_flow(&self) -> Result<Token, AuthError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AuthError::Flow(format!("bind loopback listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Flow(e.to_string()))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}/");
        let csrf = uuid::Uuid::new_v4().simple().to_string();
        let url = self.secrets.authorization_url(&redirect_uri, &csrf)?;
        tracing::warn!("Open this url in a browser to authorize google drive access: {url}");

        let (code_tx, code_rx) = oneshot::channel::<Result<String, String>>();
        let code_tx = Arc::new(parking_lot::Mutex::new(Some(code_tx)));
        let callback = move |Query(params): Query<HashMap<String, String>>| {
            let code_tx = code_tx.clone();
            let csrf = csrf.clone();
            async move {
                let result = parse_callback(&params, &csrf);
                let reply = if result.is_ok() {
                    "Authorization complete, you may close this window."
                } else {
                    "Authorization failed, check the bot logs."
                };
                if let Some(tx) = code_tx.lock().take() {
                    let _ = tx.send(result);
                }
                reply
            }
        };
        let app = Router::new().route("/", get(callback));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let result = code_rx
            .await
            .map_err(|_| AuthError::Flow("authorization callback dropped".into()));
        let _ = stop_tx.send(());
        let _ = server.await;

        let code = result?.map_err(AuthError::Flow)?;
        self.exchange_code(&code, &redirect_uri).await
    }
}

fn parse_callback(params: &HashMap<String, String>, csrf: &str) -> Result<String, String> {
    if let Some(error) = params.get("error") {
        return Err(format!("google returned error: {error}"));
    }
    if params.get("state").map(String::as_str) != Some(csrf) {
        return Err("state mismatch in authorization callback".into());
    }
    params
        .get("code")
        .cloned()
        .ok_or_else(|| "authorization callback without code".into())
}
