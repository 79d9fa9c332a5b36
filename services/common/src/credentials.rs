//! Feed credentials
//!
//! Access tokens are rotated by an external login flow; this module only
//! reads them. The token file is the source of truth, with a Redis key as
//! fallback when the file is missing. There is no automatic refresh
//! against the broker; an expired token is surfaced to the operator.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Credentials needed to open a feed WebSocket.
#[derive(Debug, Clone)]
pub struct FeedCredentials {
    pub access_token: String,
    pub client_id: String,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
    client_id: String,
    expiry: Option<String>,
}

/// How the token file is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFileFormat {
    /// JSON `{access_token, client_id, expiry?}`.
    Json,
    /// A bare token string; the client id comes from configuration.
    Plain,
}

/// Two-source credential provider: file first, cache key fallback.
pub struct CredentialProvider {
    file_path: PathBuf,
    format: TokenFileFormat,
    /// Client id to pair with a plain token file.
    static_client_id: Option<String>,
    cache_key: String,
    redis: Option<redis::aio::ConnectionManager>,
    refresh_lock: Mutex<()>,
}

impl CredentialProvider {
    pub fn new(
        file_path: impl Into<PathBuf>,
        format: TokenFileFormat,
        static_client_id: Option<String>,
        cache_key: impl Into<String>,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            format,
            static_client_id,
            cache_key: cache_key.into(),
            redis,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Read current credentials: token file first, Redis key fallback.
    pub async fn get(&self) -> Result<FeedCredentials> {
        match self.read_file() {
            Ok(creds) => Ok(creds),
            Err(file_err) => {
                warn!(error = %file_err, path = %self.file_path.display(),
                      "token file unavailable, trying cache fallback");
                self.read_cache()
                    .await
                    .with_context(|| format!("token file failed: {file_err:#}"))
            }
        }
    }

    /// Re-read the sources. Serialized so concurrent reconnect attempts do
    /// not race on a half-written token file.
    pub async fn refresh(&self) -> Result<FeedCredentials> {
        let _guard = self.refresh_lock.lock().await;
        self.get().await
    }

    fn read_file(&self) -> Result<FeedCredentials> {
        let raw = std::fs::read_to_string(&self.file_path)
            .with_context(|| format!("cannot read {}", self.file_path.display()))?;
        let creds = match self.format {
            TokenFileFormat::Json => parse_token_json(&raw)?,
            TokenFileFormat::Plain => FeedCredentials {
                access_token: raw.trim().to_string(),
                client_id: self.static_client_id.clone().unwrap_or_default(),
                expiry: None,
            },
        };
        if creds.access_token.is_empty() {
            anyhow::bail!("empty access token in {}", self.file_path.display());
        }
        if let Some(expiry) = creds.expiry {
            if expiry < Utc::now() {
                warn!(%expiry, "access token appears expired, re-authenticate upstream");
            }
        }
        info!(
            client_id = %creds.client_id,
            token_len = creds.access_token.len(),
            "feed credentials loaded"
        );
        Ok(creds)
    }

    async fn read_cache(&self) -> Result<FeedCredentials> {
        let Some(conn) = self.redis.clone() else {
            anyhow::bail!("no credential cache configured");
        };
        let mut conn = conn;
        let raw: Option<String> = conn
            .get(&self.cache_key)
            .await
            .context("credential cache read failed")?;
        let raw = raw.with_context(|| format!("credential key '{}' not set", self.cache_key))?;
        parse_token_json(&raw)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn parse_token_json(raw: &str) -> Result<FeedCredentials> {
    let file: TokenFile = serde_json::from_str(raw).context("malformed token JSON")?;
    let expiry = file
        .expiry
        .as_deref()
        .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Ok(FeedCredentials {
        access_token: file.access_token,
        client_id: file.client_id,
        expiry,
    })
}
