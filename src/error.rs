//! Error types for dependency resolution, loading and sandbox evaluation.

use thiserror::Error;

/// Errors that abort an import or an open.
///
/// Malformed markup never shows up here: the parser is lenient and reports
/// such issues as diagnostics instead.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A reference could not be resolved or fetched.
    #[error("cannot resolve '{reference}'{}: {source}", referrer_suffix(.referrer))]
    Resolution {
        /// The textual reference (or uri) that failed.
        reference: String,
        /// The uri of the dependency containing the reference, if any.
        referrer: Option<String>,
        /// The underlying strategy failure.
        #[source]
        source: anyhow::Error,
    },

    /// A loader failed while transforming a dependency.
    #[error("failed to transform {uri}: {source}")]
    Transform {
        /// The dependency being transformed.
        uri: String,
        /// The loader failure.
        #[source]
        source: anyhow::Error,
    },

    /// A uri was revisited while still on the active resolution path.
    #[error("import cycle detected: {}", .path.join(" -> "))]
    Cycle {
        /// The uri that closed the cycle.
        uri: String,
        /// The resolution path, ending with `uri`.
        path: Vec<String>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn referrer_suffix(referrer: &Option<String>) -> String {
    referrer
        .as_deref()
        .map(|uri| format!(" from {uri}"))
        .unwrap_or_default()
}

impl SandboxError {
    /// Build a resolution error for `reference` found inside `referrer`.
    pub fn resolution(
        reference: impl Into<String>,
        referrer: Option<&str>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        SandboxError::Resolution {
            reference: reference.into(),
            referrer: referrer.map(str::to_string),
            source: source.into(),
        }
    }

    /// Build a transform error for the dependency at `uri`.
    pub fn transform(uri: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        SandboxError::Transform {
            uri: uri.into(),
            source: source.into(),
        }
    }

    /// Check if this error is a resolution failure.
    pub fn is_resolution(&self) -> bool {
        matches!(self, SandboxError::Resolution { .. })
    }

    /// Check if this error is a loader failure.
    pub fn is_transform(&self) -> bool {
        matches!(self, SandboxError::Transform { .. })
    }

    /// Check if this error is an import cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, SandboxError::Cycle { .. })
    }

    /// The uri the failure is attributed to, if any.
    ///
    /// For resolution errors this is the containing dependency when known,
    /// otherwise the reference itself.
    pub fn uri(&self) -> Option<&str> {
        match self {
            SandboxError::Resolution {
                reference,
                referrer,
                ..
            } => Some(referrer.as_deref().unwrap_or(reference)),
            SandboxError::Transform { uri, .. } | SandboxError::Cycle { uri, .. } => Some(uri),
            SandboxError::Config(_) | SandboxError::Io(_) => None,
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
