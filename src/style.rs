//! Stylesheet loader: resolves `url(…)` and `@import` references.

use std::ops::Range;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::future::try_join_all;
use regex::Regex;

use crate::dependency::DependencyRef;
use crate::error::{Result, SandboxError};
use crate::loader::{push_unique, Loader, LoaderContext, LoaderInput, LoaderResult};
use crate::source_map::{Position, SourceBuilder};

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)@import\s+(?:"([^"\n]*)"|'([^'\n]*)')|url\(\s*(?:"([^"\n]*)"|'([^'\n]*)'|([^"')\s]*))\s*\)"#,
    )
    .expect("reference pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferenceKind {
    Import,
    Url,
}

#[derive(Debug)]
struct Reference {
    kind: ReferenceKind,
    range: Range<usize>,
    value: String,
}

fn references(content: &str) -> Vec<Reference> {
    REFERENCE
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let (kind, value) = if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                (ReferenceKind::Import, m.as_str())
            } else {
                let m = caps.get(3).or_else(|| caps.get(4)).or_else(|| caps.get(5))?;
                (ReferenceKind::Url, m.as_str())
            };
            let value = value.trim();
            if value.is_empty() || value.starts_with('#') || value.starts_with("data:") {
                return None;
            }
            Some(Reference {
                kind,
                range: whole.range(),
                value: value.to_string(),
            })
        })
        .collect()
}

pub struct StyleLoader {
    context: LoaderContext,
}

impl StyleLoader {
    pub fn new(context: LoaderContext) -> Self {
        Self { context }
    }

    async fn resolve(&self, dependency: &DependencyRef, reference: &Reference) -> Result<String> {
        let value = match reference.value.strip_prefix("//") {
            Some(rest) => format!("http://{}", rest),
            None => reference.value.clone(),
        };
        self.context
            .strategy
            .resolve(&value, &dependency.uri)
            .await
            .map_err(|e| SandboxError::resolution(&value, Some(dependency.uri.as_str()), e))
    }
}

#[async_trait]
impl Loader for StyleLoader {
    async fn load(&self, dependency: &DependencyRef, input: LoaderInput) -> Result<LoaderResult> {
        let content = input.content;
        let found = references(&content);
        let resolved =
            try_join_all(found.iter().map(|reference| self.resolve(dependency, reference))).await?;

        let mut output = String::with_capacity(content.len());
        let mut imports = Vec::new();
        let mut last = 0;
        for (reference, uri) in found.iter().zip(resolved) {
            output.push_str(&content[last..reference.range.start]);
            match reference.kind {
                ReferenceKind::Import => output.push_str(&format!("@import \"{}\"", uri)),
                ReferenceKind::Url => output.push_str(&format!("url(\"{}\")", uri)),
            }
            last = reference.range.end;
            push_unique(&mut imports, uri);
        }
        output.push_str(&content[last..]);

        // Rewrites never add or remove lines, so every line maps to itself
        let mut builder = SourceBuilder::new(dependency.uri.clone());
        builder.push_verbatim(&output, Position::START);
        let (output, positions) = builder.finish();

        Ok(LoaderResult {
            content: output,
            map: Some(positions.to_source_map(None)),
            imported_dependency_uris: imports,
        })
    }
}
