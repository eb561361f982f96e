//! Reference resolution and content fetching.
//!
//! Loaders never touch the filesystem or network themselves. They ask a
//! [`Strategy`] to turn a textual reference into a canonical uri and to fetch
//! the raw content behind a uri.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

use crate::config::SandboxConfig;
use crate::fetch::{FetchConfig, RemoteFetcher};

#[async_trait]
pub trait Strategy: Send + Sync {
    /// Resolve `reference` relative to the dependency at `base_uri`.
    async fn resolve(&self, reference: &str, base_uri: &str) -> Result<String, Error>;

    /// Fetch the raw content behind a canonical uri.
    async fn fetch(&self, uri: &str) -> Result<String, Error>;
}

/// Canonical form of an absolute uri or an absolute filesystem path.
pub fn canonical_uri(reference: &str) -> Result<String, Error> {
    if let Ok(url) = Url::parse(reference) {
        return Ok(url.to_string());
    }
    let path = Path::new(reference);
    if path.is_absolute() {
        return Url::from_file_path(path)
            .map(|url| url.to_string())
            .map_err(|_| anyhow!("Invalid absolute path: {}", reference));
    }
    Err(anyhow!("'{}' is neither a uri nor an absolute path", reference))
}

/// Standard URL-relative resolution of `reference` against `base_uri`.
/// Protocol-relative references get an explicit `http:` scheme.
pub fn join_uri(reference: &str, base_uri: &str) -> Result<String, Error> {
    if reference.starts_with("//") {
        return canonical_uri(&format!("http:{}", reference));
    }
    if let Ok(url) = Url::parse(reference) {
        return Ok(url.to_string());
    }
    let base = Url::parse(base_uri).map_err(|e| anyhow!("Invalid base uri '{}': {}", base_uri, e))?;
    base.join(reference)
        .map(|url| url.to_string())
        .map_err(|e| anyhow!("Failed to resolve '{}': {}", reference, e))
}

/// Strategy over an in-memory uri → content table, e.g. unsaved editor buffers.
#[derive(Debug, Default)]
pub struct MemoryStrategy {
    files: RwLock<HashMap<String, String>>,
}

impl MemoryStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`MemoryStrategy::set`].
    pub fn with_file(self, uri: &str, content: impl Into<String>) -> Self {
        self.set(uri, content);
        self
    }

    /// Insert or replace the content behind `uri`.
    pub fn set(&self, uri: &str, content: impl Into<String>) {
        let key = canonical_uri(uri).unwrap_or_else(|_| uri.to_string());
        self.files.write().insert(key, content.into());
    }

    pub fn remove(&self, uri: &str) -> Option<String> {
        let key = canonical_uri(uri).unwrap_or_else(|_| uri.to_string());
        self.files.write().remove(&key)
    }
}

#[async_trait]
impl Strategy for MemoryStrategy {
    async fn resolve(&self, reference: &str, base_uri: &str) -> Result<String, Error> {
        join_uri(reference, base_uri)
    }

    async fn fetch(&self, uri: &str) -> Result<String, Error> {
        self.files
            .read()
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow!("No such file: {}", uri))
    }
}

/// A strategy that only reads files from one directory, plus remote uris on
/// an origin allowlist.
///
/// Guarantees:
/// - No filesystem escape (path traversal blocked via canonicalization)
/// - No `data:`/`blob:` references
/// - Remote content only from allowed origins (see [`RemoteFetcher`])
pub struct SandboxedStrategy {
    allowed_dir: PathBuf,
    remote: RemoteFetcher,
}

impl SandboxedStrategy {
    /// Create a strategy that only reads files under `allowed_dir`.
    pub fn new(allowed_dir: impl AsRef<Path>, fetch_config: FetchConfig) -> Result<Self, Error> {
        let canonical = allowed_dir
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("Failed to canonicalize allowed_dir: {}", e))?;

        if !canonical.is_dir() {
            return Err(anyhow!("allowed_dir must be a directory"));
        }

        Ok(Self {
            allowed_dir: canonical,
            remote: RemoteFetcher::new(fetch_config)?,
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, Error> {
        Self::new(
            &config.root_dir,
            FetchConfig {
                allowed_origins: config.allowed_origins.clone(),
                timeout_ms: config.fetch_timeout_ms,
            },
        )
    }

    pub fn allowed_dir(&self) -> &Path {
        &self.allowed_dir
    }

    /// Check if a path is within the allowed directory.
    /// Uses canonicalization to resolve symlinks and prevent traversal.
    fn is_path_allowed(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.allowed_dir),
            Err(_) => false,
        }
    }

    fn root_url(&self, relative: &str) -> Result<Url, Error> {
        Url::from_file_path(self.allowed_dir.join(relative.trim_start_matches('/')))
            .map_err(|_| anyhow!("Invalid path: {}", relative))
    }
}

#[async_trait]
impl Strategy for SandboxedStrategy {
    async fn resolve(&self, reference: &str, base_uri: &str) -> Result<String, Error> {
        if reference.starts_with("data:") || reference.starts_with("blob:") {
            return Err(anyhow!("Inline references are not dependencies: {}", reference));
        }

        let resolved = if reference.starts_with("//") {
            Url::parse(&format!("http:{}", reference))
                .map_err(|e| anyhow!("Invalid URL '{}': {}", reference, e))?
        } else if reference.starts_with("http://")
            || reference.starts_with("https://")
            || reference.starts_with("file://")
        {
            Url::parse(reference).map_err(|e| anyhow!("Invalid URL '{}': {}", reference, e))?
        } else if reference.starts_with('/') {
            // Absolute path - rooted at allowed_dir
            self.root_url(reference)?
        } else if let Ok(base) = Url::parse(base_uri) {
            // Relative reference - resolve against the containing dependency
            base.join(reference)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", reference, e))?
        } else {
            // No usable base - resolve from allowed_dir root
            self.root_url(reference)?
        };

        match resolved.scheme() {
            "http" | "https" => return Ok(resolved.to_string()),
            "file" => {}
            other => return Err(anyhow!("Unsupported scheme: {}", other)),
        }

        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;

        // Security check: path must be within allowed directory
        if !self.is_path_allowed(&path) {
            return Err(anyhow!(
                "Access denied: '{}' is outside the allowed directory",
                path.display()
            ));
        }

        Ok(resolved.to_string())
    }

    async fn fetch(&self, uri: &str) -> Result<String, Error> {
        let url = Url::parse(uri).map_err(|e| anyhow!("Invalid uri '{}': {}", uri, e))?;

        match url.scheme() {
            "http" | "https" => return self.remote.fetch(&url).await,
            "file" => {}
            other => return Err(anyhow!("Unsupported scheme: {}", other)),
        }

        let path = url
            .to_file_path()
            .map_err(|_| anyhow!("Invalid file path: {}", uri))?;

        // Re-check: the file may have been swapped for a symlink since resolve
        if !self.is_path_allowed(&path) {
            return Err(anyhow!("Access denied: {}", path.display()));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
