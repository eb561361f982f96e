//! Markup parsing and the canonical structural loader.

mod loader;
pub mod parser;

pub use loader::MarkupLoader;
pub use parser::{parse, Attribute, Element, Node, ParseIssue, ParseIssueKind, Parsed};
