//! Unseal key shares and their persistence
//!
//! Share values and the root token are redacted from `Debug` output and
//! zeroized when dropped. Init output is written to the credential store
//! before any share is used, so a crash mid-unseal never loses the keys.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use zeroize::Zeroize;

#[cfg(test)]
use mockall::automock;

use crate::error::InitError;
use crate::platform::InitResponse;

/// One Shamir share of the unseal key
#[derive(Clone)]
pub struct UnsealKeyShare {
    index: usize,
    value: String,
    threshold: u8,
}

impl UnsealKeyShare {
    /// Wrap a share value
    pub fn new(index: usize, value: impl Into<String>, threshold: u8) -> Self {
        Self {
            index,
            value: value.into(),
            threshold,
        }
    }

    /// Position of the share in the init output
    pub fn index(&self) -> usize {
        self.index
    }

    /// Shares required to unseal
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// The secret share value
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for UnsealKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealKeyShare")
            .field("index", &self.index)
            .field("value", &"[REDACTED]")
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl fmt::Display for UnsealKeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "share #{} (threshold {})", self.index, self.threshold)
    }
}

impl Drop for UnsealKeyShare {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

/// Output of a successful initialization
pub struct InitResult {
    /// Unseal key shares, in init output order
    pub shares: Vec<UnsealKeyShare>,
    /// Shares required to unseal
    pub threshold: u8,
    root_token: String,
    /// When the cluster was initialized
    pub created_at: DateTime<Utc>,
}

impl InitResult {
    /// Build from shares and a root token
    pub fn new(
        keys: Vec<String>,
        threshold: u8,
        root_token: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let shares = keys
            .into_iter()
            .enumerate()
            .map(|(index, value)| UnsealKeyShare::new(index, value, threshold))
            .collect();
        Self {
            shares,
            threshold,
            root_token: root_token.into(),
            created_at,
        }
    }

    /// Take ownership of the secrets in an init response
    pub fn from_response(mut response: InitResponse) -> Self {
        let keys = std::mem::take(&mut response.unseal_keys_b64);
        let token = std::mem::take(&mut response.root_token);
        Self::new(keys, response.unseal_threshold, token, Utc::now())
    }

    /// The initial root token
    pub fn root_token(&self) -> &str {
        &self.root_token
    }
}

impl fmt::Debug for InitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResult")
            .field("shares", &self.shares.len())
            .field("threshold", &self.threshold)
            .field("root_token", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Drop for InitResult {
    fn drop(&mut self) {
        self.root_token.zeroize();
    }
}

/// On-disk form of [`InitResult`]
#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    unseal_keys_b64: Vec<String>,
    unseal_threshold: u8,
    root_token: String,
    created_at: DateTime<Utc>,
}

impl Drop for StoredCredentials {
    fn drop(&mut self) {
        self.unseal_keys_b64.zeroize();
        self.root_token.zeroize();
    }
}

/// Where init output is kept between runs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Previously persisted init output, if any
    async fn load(&self) -> Result<Option<InitResult>, InitError>;

    /// Fail unless [`persist`](Self::persist) would be able to write.
    ///
    /// Checked before initializing, since init output that cannot be stored
    /// is lost for good.
    async fn ensure_writable(&self) -> Result<(), InitError>;

    /// Persist init output; must fail rather than replace existing output
    async fn persist(&self, result: &InitResult) -> Result<(), InitError>;

    /// Last-resort copy after `persist` failed; returns where it went
    async fn persist_fallback(&self, result: &InitResult) -> Result<String, InitError>;
}

/// JSON file readable only by its owner
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fallback location: `<path>.<created_at>`
    pub fn fallback_path(&self, created_at: DateTime<Utc>) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", created_at.format("%Y%m%dT%H%M%SZ")));
        PathBuf::from(name)
    }
}

fn owner_only_create() -> tokio::fs::OpenOptions {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
}

fn open_error(path: &Path, e: std::io::Error) -> InitError {
    if e.kind() == ErrorKind::AlreadyExists {
        InitError::Persist(format!(
            "refusing to overwrite existing credentials at {}",
            path.display()
        ))
    } else {
        InitError::Persist(format!("writing {}: {}", path.display(), e))
    }
}

async fn write_new(path: &Path, result: &InitResult) -> Result<(), InitError> {
    let stored = StoredCredentials {
        unseal_keys_b64: result.shares.iter().map(|s| s.expose().to_string()).collect(),
        unseal_threshold: result.threshold,
        root_token: result.root_token().to_string(),
        created_at: result.created_at,
    };
    let mut body =
        serde_json::to_vec_pretty(&stored).map_err(|e| InitError::Persist(e.to_string()))?;

    let written = async {
        let mut file = owner_only_create().open(path).await?;
        file.write_all(&body).await?;
        file.sync_all().await
    }
    .await;
    body.zeroize();

    written.map_err(|e| open_error(path, e))
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<InitResult>, InitError> {
        let mut bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(InitError::Persist(format!(
                    "reading {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let parsed: Result<StoredCredentials, _> = serde_json::from_slice(&bytes);
        bytes.zeroize();

        let mut stored = parsed.map_err(|e| {
            InitError::Persist(format!("parsing {}: {}", self.path.display(), e))
        })?;
        Ok(Some(InitResult::new(
            std::mem::take(&mut stored.unseal_keys_b64),
            stored.unseal_threshold,
            std::mem::take(&mut stored.root_token),
            stored.created_at,
        )))
    }

    async fn ensure_writable(&self) -> Result<(), InitError> {
        // create and remove an empty file: proves the directory exists, is
        // writable, and holds no earlier output
        owner_only_create()
            .open(&self.path)
            .await
            .map_err(|e| open_error(&self.path, e))?;
        tokio::fs::remove_file(&self.path)
            .await
            .map_err(|e| InitError::Persist(format!("removing {}: {}", self.path.display(), e)))
    }

    async fn persist(&self, result: &InitResult) -> Result<(), InitError> {
        write_new(&self.path, result).await?;
        info!(path = %self.path.display(), shares = result.shares.len(), "init output persisted");
        Ok(())
    }

    async fn persist_fallback(&self, result: &InitResult) -> Result<String, InitError> {
        let path = self.fallback_path(result.created_at);
        write_new(&path, result).await?;
        warn!(path = %path.display(), "init output written to fallback location");
        Ok(path.display().to_string())
    }
}
