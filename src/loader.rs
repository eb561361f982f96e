//! Pluggable content loaders and the registry that selects them by content type.
//!
//! A loader turns the raw content of one dependency into transformed content,
//! an optional source map and the uris it references. Loaders must be pure
//! given the same content and the same strategy answers; the importer relies
//! on that to skip dependencies whose fingerprint did not change.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dependency::DependencyRef;
use crate::error::Result;
use crate::markup::MarkupLoader;
use crate::mime;
use crate::source_map::SourceMap;
use crate::strategy::Strategy;
use crate::style::StyleLoader;

/// Raw content handed to a loader, with the content type it should be read as.
#[derive(Debug, Clone)]
pub struct LoaderInput {
    pub mime_type: String,
    pub content: String,
}

impl LoaderInput {
    pub fn new(mime_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            content: content.into(),
        }
    }
}

/// Output of a single load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderResult {
    pub content: String,
    pub map: Option<SourceMap>,
    /// Resolved uris in first-encountered order, without duplicates.
    pub imported_dependency_uris: Vec<String>,
}

impl LoaderResult {
    /// Content unchanged, no map, no references.
    pub fn passthrough(content: String) -> Self {
        Self {
            content,
            map: None,
            imported_dependency_uris: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, dependency: &DependencyRef, input: LoaderInput) -> Result<LoaderResult>;
}

/// Everything a loader is bound to when it is created.
#[derive(Clone)]
pub struct LoaderContext {
    pub strategy: Arc<dyn Strategy>,
    pub registry: Arc<LoaderRegistry>,
}

pub trait LoaderFactory: Send + Sync {
    fn create(&self, context: LoaderContext) -> Box<dyn Loader>;
}

impl<F> LoaderFactory for F
where
    F: Fn(LoaderContext) -> Box<dyn Loader> + Send + Sync,
{
    fn create(&self, context: LoaderContext) -> Box<dyn Loader> {
        self(context)
    }
}

/// Loader used for content types nobody registered.
pub struct PassThroughLoader;

#[async_trait]
impl Loader for PassThroughLoader {
    async fn load(&self, _dependency: &DependencyRef, input: LoaderInput) -> Result<LoaderResult> {
        Ok(LoaderResult::passthrough(input.content))
    }
}

/// Maps normalized content types to loader factories.
#[derive(Default)]
pub struct LoaderRegistry {
    factories: HashMap<String, Arc<dyn LoaderFactory>>,
}

impl LoaderRegistry {
    /// An empty registry: every type passes through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the markup and style loaders installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(mime::HTML_MIME_TYPE, |context: LoaderContext| {
            Box::new(MarkupLoader::new(context)) as Box<dyn Loader>
        });
        registry.register(mime::CSS_MIME_TYPE, |context: LoaderContext| {
            Box::new(StyleLoader::new(context)) as Box<dyn Loader>
        });
        registry
    }

    /// Register (or replace) the factory for `mime_type`.
    pub fn register(&mut self, mime_type: &str, factory: impl LoaderFactory + 'static) {
        self.factories
            .insert(mime::normalize(mime_type), Arc::new(factory));
    }

    /// Exact-match lookup on the normalized type.
    pub fn find(&self, mime_type: &str) -> Option<Arc<dyn LoaderFactory>> {
        self.factories.get(&mime::normalize(mime_type)).cloned()
    }

    pub fn is_registered(&self, mime_type: &str) -> bool {
        self.factories.contains_key(&mime::normalize(mime_type))
    }

    /// Create the loader for `mime_type`, falling back to [`PassThroughLoader`].
    pub fn create(self: &Arc<Self>, mime_type: &str, strategy: Arc<dyn Strategy>) -> Box<dyn Loader> {
        match self.find(mime_type) {
            Some(factory) => factory.create(LoaderContext {
                strategy,
                registry: Arc::clone(self),
            }),
            None => Box::new(PassThroughLoader),
        }
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("LoaderRegistry").field("types", &types).finish()
    }
}

/// Append `uri` unless it is already present.
pub(crate) fn push_unique(uris: &mut Vec<String>, uri: String) {
    if !uris.contains(&uri) {
        uris.push(uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::Fingerprint;
    use crate::strategy::MemoryStrategy;

    struct Upper;

    #[async_trait]
    impl Loader for Upper {
        async fn load(&self, _dependency: &DependencyRef, input: LoaderInput) -> Result<LoaderResult> {
            Ok(LoaderResult::passthrough(input.content.to_uppercase()))
        }
    }

    fn dependency() -> DependencyRef {
        DependencyRef {
            uri: "mem:///a.txt".into(),
            fingerprint: Fingerprint::of("abc"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_type_passes_through() {
        let registry = Arc::new(LoaderRegistry::new());
        let loader = registry.create("text/plain", Arc::new(MemoryStrategy::new()));
        let result = loader
            .load(&dependency(), LoaderInput::new("text/plain", "abc"))
            .await
            .unwrap();
        assert_eq!(result, LoaderResult::passthrough("abc".into()));
    }

    #[tokio::test]
    async fn test_lookup_uses_normalized_type() {
        let mut registry = LoaderRegistry::new();
        registry.register("Text/Plain", |_: LoaderContext| Box::new(Upper) as Box<dyn Loader>);
        let registry = Arc::new(registry);

        assert!(registry.is_registered("text/plain; charset=utf-8"));
        assert!(registry.find("text/plainx").is_none());

        let loader = registry.create("TEXT/PLAIN", Arc::new(MemoryStrategy::new()));
        let result = loader
            .load(&dependency(), LoaderInput::new("text/plain", "abc"))
            .await
            .unwrap();
        assert_eq!(result.content, "ABC");
    }

    #[test]
    fn test_defaults_cover_markup_and_style() {
        let registry = LoaderRegistry::with_defaults();
        assert!(registry.is_registered(mime::HTML_MIME_TYPE));
        assert!(registry.is_registered(mime::CSS_MIME_TYPE));
        assert!(!registry.is_registered(mime::JS_MIME_TYPE));
    }

    #[test]
    fn test_push_unique_keeps_first_occurrence() {
        let mut uris = vec![];
        for uri in ["b", "a", "b", "c", "a"] {
            push_unique(&mut uris, uri.to_string());
        }
        assert_eq!(uris, vec!["b", "a", "c"]);
    }
}
