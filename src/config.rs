//! Sandbox configuration.

/// Configuration for a file-backed sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory containing the editable assets (only this dir is readable)
    pub root_dir: String,
    /// Allowed origins for remote dependencies (empty = remote fetch disabled)
    pub allowed_origins: Vec<String>,
    /// Maximum time for a single remote fetch in milliseconds (None = unlimited)
    pub fetch_timeout_ms: Option<u64>,
    /// Capacity of the per-instance event channels
    pub event_capacity: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root_dir: String::from("./"),
            allowed_origins: vec![],     // remote fetch disabled by default
            fetch_timeout_ms: Some(30_000), // 30 seconds default
            event_capacity: 64,
        }
    }
}
