//! The markup loader.
//!
//! Walks the parsed tree, resolves resource attributes through the strategy,
//! hands embedded script/style text to the loader registered for its type and
//! reassembles the document with a source map back to the original markup.
//!
//! Sibling attributes and child nodes are transformed concurrently, but each
//! level is joined with `try_join_all`, which yields results in input order.
//! Output text, source map and import order therefore always follow document
//! order, whatever order the strategy answers in.

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;

use crate::dependency::DependencyRef;
use crate::error::{Result, SandboxError};
use crate::loader::{push_unique, Loader, LoaderContext, LoaderInput, LoaderResult};
use crate::markup::parser::{self, Attribute, Element, Node};
use crate::mime;
use crate::source_map::{Position, SourceBuilder};

/// Elements allowed to pull in external resources. Anything else (anchors,
/// custom editor elements, …) keeps `src`/`href` values as inert text.
const RESOURCE_ELEMENTS: &[&str] = &["link", "script", "img"];

/// Attributes that reference a resource on an allow-listed element.
const RESOURCE_ATTRIBUTES: &[&str] = &["src", "href"];

pub struct MarkupLoader {
    context: LoaderContext,
}

impl MarkupLoader {
    pub fn new(context: LoaderContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Loader for MarkupLoader {
    async fn load(&self, dependency: &DependencyRef, input: LoaderInput) -> Result<LoaderResult> {
        let parsed = parser::parse(&input.content);
        for issue in &parsed.issues {
            tracing::debug!(
                uri = %dependency.uri,
                kind = ?issue.kind,
                line = issue.position.line,
                column = issue.position.column,
                "recovered from malformed markup"
            );
        }

        let transform = Transform {
            context: &self.context,
            dependency,
        };
        let fragment = transform.node(&parsed.document).await?;

        let mut builder = SourceBuilder::new(dependency.uri.clone());
        for chunk in &fragment.chunks {
            match chunk {
                Chunk::Verbatim(text, origin) => builder.push_verbatim(text, *origin),
                Chunk::Mapped(text, origin) => builder.push_mapped(text, *origin),
            }
        }
        let (content, positions) = builder.finish();

        Ok(LoaderResult {
            content,
            map: Some(positions.to_source_map(None)),
            imported_dependency_uris: fragment.imports,
        })
    }
}

enum Chunk {
    /// Original text copied unchanged.
    Verbatim(String, Position),
    /// Text generated for the construct at the position.
    Mapped(String, Position),
}

#[derive(Default)]
struct Fragment {
    chunks: Vec<Chunk>,
    imports: Vec<String>,
}

impl Fragment {
    fn mapped(&mut self, text: impl Into<String>, origin: Position) {
        self.chunks.push(Chunk::Mapped(text.into(), origin));
    }

    fn verbatim(&mut self, text: impl Into<String>, origin: Position) {
        self.chunks.push(Chunk::Verbatim(text.into(), origin));
    }

    fn import(&mut self, uri: String) {
        push_unique(&mut self.imports, uri);
    }

    fn extend(&mut self, other: Fragment) {
        self.chunks.extend(other.chunks);
        for uri in other.imports {
            self.import(uri);
        }
    }
}

struct Transform<'a> {
    context: &'a LoaderContext,
    dependency: &'a DependencyRef,
}

impl<'a> Transform<'a> {
    fn node(&'a self, node: &'a Node) -> BoxFuture<'a, Result<Fragment>> {
        async move {
            let mut fragment = Fragment::default();
            match node {
                Node::Document { children } => {
                    for child in self.children(children).await? {
                        fragment.extend(child);
                    }
                }
                Node::Doctype { name, position } => {
                    fragment.mapped(format!("<!DOCTYPE {}>", name), *position);
                }
                Node::Comment { data, position } => {
                    fragment.mapped(format!("<!--{}-->", data), *position);
                }
                Node::Text { raw, position, .. } => {
                    fragment.verbatim(raw.as_str(), *position);
                }
                Node::Element(element) => {
                    fragment = self.element(element).await?;
                }
            }
            Ok(fragment)
        }
        .boxed()
    }

    async fn children(&'a self, children: &'a [Node]) -> Result<Vec<Fragment>> {
        try_join_all(children.iter().map(|child| self.node(child))).await
    }

    async fn element(&'a self, element: &'a Element) -> Result<Fragment> {
        let mut fragment = Fragment::default();
        fragment.mapped(format!("<{}", element.name), element.position);

        let attributes = try_join_all(
            element
                .attrs
                .iter()
                .map(|attr| self.attribute(element, attr)),
        )
        .await?;
        for (text, position, import) in attributes {
            fragment.mapped(text, position);
            if let Some(uri) = import {
                fragment.import(uri);
            }
        }
        fragment.mapped(">", element.position);

        if element.is_void() {
            return Ok(fragment);
        }

        match self.embedded_text(element).await? {
            Some(embedded) => fragment.extend(embedded),
            None => {
                for child in self.children(&element.children).await? {
                    fragment.extend(child);
                }
            }
        }

        fragment.mapped(format!("</{}>", element.name), element.position);
        Ok(fragment)
    }

    /// Serialize one attribute, resolving it first when it references a
    /// resource.
    async fn attribute(
        &self,
        element: &Element,
        attr: &Attribute,
    ) -> Result<(String, Position, Option<String>)> {
        let Some(value) = attr.value.as_deref() else {
            return Ok((format!(" {}", attr.name), attr.position, None));
        };

        let is_resource = RESOURCE_ELEMENTS.contains(&element.name.as_str())
            && RESOURCE_ATTRIBUTES.contains(&attr.name.as_str())
            && !value.trim().is_empty();
        if !is_resource {
            return Ok((serialize_attribute(&attr.name, value), attr.position, None));
        }

        let reference = match value.strip_prefix("//") {
            Some(rest) => format!("http://{}", rest),
            None => value.to_string(),
        };
        let referrer = self.dependency.uri.as_str();
        let uri = self
            .context
            .strategy
            .resolve(&reference, referrer)
            .await
            .map_err(|e| SandboxError::resolution(&reference, Some(referrer), e))?;

        Ok((serialize_attribute(&attr.name, &uri), attr.position, Some(uri)))
    }

    /// Run an element's embedded text through the loader registered for its
    /// content type. Returns `None` when no such loader exists.
    async fn embedded_text(&self, element: &Element) -> Result<Option<Fragment>> {
        let Some(Node::Text { value, position, .. }) = element.children.first() else {
            return Ok(None);
        };
        let Some(mime_type) = mime::element_text_mime_type(&element.name, element.attr("type"))
        else {
            return Ok(None);
        };
        let Some(factory) = self.context.registry.find(&mime_type) else {
            return Ok(None);
        };

        // Leading blank lines keep the sub-loader's positions in the
        // coordinate space of the enclosing document.
        let padding = "\n".repeat(position.line.saturating_sub(1) as usize);
        let loader = factory.create(self.context.clone());
        let result = loader
            .load(
                self.dependency,
                LoaderInput::new(mime_type.as_str(), format!("{}{}", padding, value)),
            )
            .await?;

        let mut text = result.content;
        if let Some(map) = &result.map {
            let comment = map
                .inline_comment()
                .map_err(|e| SandboxError::transform(&self.dependency.uri, e))?;
            text.push_str(&comment);
        }

        let mut fragment = Fragment::default();
        fragment.mapped(text, *position);
        for uri in result.imported_dependency_uris {
            fragment.import(uri);
        }
        Ok(Some(fragment))
    }
}

/// Attribute values arrive decoded, so they are escaped again on the way out.
fn serialize_attribute(name: &str, value: &str) -> String {
    let escaped = value
        .replace('&', "&amp;")
        .replace('\u{a0}', "&nbsp;")
        .replace('"', "&quot;");
    format!(" {}=\"{}\"", name, escaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::dependency::Fingerprint;
    use crate::loader::LoaderRegistry;
    use crate::strategy::{MemoryStrategy, Strategy};

    const URI: &str = "mem:///site/index.html";

    async fn load(registry: LoaderRegistry, content: &str) -> Result<LoaderResult> {
        let strategy: Arc<dyn Strategy> = Arc::new(MemoryStrategy::new());
        let registry = Arc::new(registry);
        let loader = registry.create(mime::HTML_MIME_TYPE, strategy);
        let dependency = DependencyRef {
            uri: URI.into(),
            fingerprint: Fingerprint::of(content),
        };
        loader
            .load(&dependency, LoaderInput::new(mime::HTML_MIME_TYPE, content))
            .await
    }

    #[tokio::test]
    async fn test_serializes_document_structure() {
        let source = "<!doctype html>\n<!-- note -->\n<div class=\"a\" hidden>x</div><br>";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();
        assert_eq!(
            result.content,
            "<!DOCTYPE html>\n<!-- note -->\n<div class=\"a\" hidden>x</div><br>"
        );
        assert!(result.imported_dependency_uris.is_empty());
    }

    #[tokio::test]
    async fn test_resolves_resource_attributes() {
        let source = "<link rel=\"stylesheet\" href=\"css/site.css\"><img src=\"../logo.png\">";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();
        assert_eq!(
            result.content,
            "<link rel=\"stylesheet\" href=\"mem:///site/css/site.css\"><img src=\"mem:///logo.png\">"
        );
        assert_eq!(
            result.imported_dependency_uris,
            vec!["mem:///site/css/site.css", "mem:///logo.png"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_references_are_recorded_once() {
        let source = "<img src=\"a.png\"><img src=\"b.png\"><img src=\"a.png\">";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();
        assert_eq!(
            result.imported_dependency_uris,
            vec!["mem:///site/a.png", "mem:///site/b.png"]
        );
    }

    #[tokio::test]
    async fn test_source_map_points_at_original_positions() {
        let source = "<div>\n  <img src=\"a.png\">\n</div>";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();
        let positions = result.map.unwrap().decode().unwrap();

        // `<img` on generated line 2 comes from original 2:3
        let img = positions.original_position_for(Position::new(2, 3)).unwrap();
        assert_eq!(img.original, Position::new(2, 3));
        assert_eq!(img.source, URI);
        // the rewritten src attribute maps to the attribute's position
        let src = positions.original_position_for(Position::new(2, 8)).unwrap();
        assert_eq!(src.original, Position::new(2, 8));
    }

    #[tokio::test]
    async fn test_inline_style_is_delegated_with_padding() {
        let source = "<html>\n<style>\nbody { background: url(bg.png) }\n</style>\n</html>";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();

        assert!(result.content.contains("url(\"mem:///site/bg.png\")"));
        assert!(result.content.contains("/*# sourceMappingURL=data:application/json;base64,"));
        assert_eq!(result.imported_dependency_uris, vec!["mem:///site/bg.png"]);
    }

    #[tokio::test]
    async fn test_text_and_attributes_keep_their_escapes() {
        let source = "<p title=\"a &amp; &quot;b&quot;\">1 &lt; 2 &amp;&amp; x</p>";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();
        assert_eq!(result.content, source);
    }

    #[tokio::test]
    async fn test_unregistered_script_type_is_kept_verbatim() {
        let source = "<script>let a = \"<b>\";</script>";
        let result = load(LoaderRegistry::with_defaults(), source).await.unwrap();
        assert_eq!(result.content, source);
    }

    #[tokio::test]
    async fn test_unresolvable_reference_aborts_load() {
        let source = "<script src=\"http://[bad\"></script>";
        let err = load(LoaderRegistry::with_defaults(), source).await.unwrap_err();
        match err {
            SandboxError::Resolution {
                reference,
                referrer,
                ..
            } => {
                assert_eq!(reference, "http://[bad");
                assert_eq!(referrer.as_deref(), Some(URI));
            }
            other => panic!("expected resolution error, got {:?}", other),
        }
    }
}
