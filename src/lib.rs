//! # Live Sandbox
//!
//! A live-reloading dependency graph for a visual content editor.
//!
//! A [`Sandbox`] owns one dependency graph and one execution context. Opening
//! an entry document imports it and everything it references through content
//! type specific [loaders](Loader), each of which rewrites references to
//! canonical uris and emits a source map back to the original text. When
//! upstream content changes, the graph is re-verified, only changed
//! dependencies are reloaded and the sandbox resets itself.
//!
//! ## Guarantees
//!
//! - **Deterministic output**: loaders resolve references concurrently but
//!   reassemble in document order
//! - **No partial graphs**: a failed import leaves the previously committed
//!   graph untouched
//! - **Fingerprint caching**: unchanged content is never transformed twice
//! - **Confined reads**: the default strategy only reads files under the root
//!   directory and remote uris on an origin allowlist
//!
//! ## Usage
//!
//! ```rust,ignore
//! use live_sandbox::{Sandbox, SandboxConfig, SandboxEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SandboxConfig {
//!         root_dir: "./site".into(),
//!         ..Default::default()
//!     };
//!
//!     let sandbox = Sandbox::from_config(&config, Vec::<String>::new).unwrap();
//!     let mut events = sandbox.subscribe();
//!     sandbox.open("text/html", "index.html", None).await.unwrap();
//!
//!     // a file watcher calls this after every save
//!     sandbox.importer().refresh().await.unwrap();
//!     while let Ok(event) = events.recv().await {
//!         if let SandboxEvent::Changed { uris } = event {
//!             println!("reloaded after {:?} changed", uris);
//!         }
//!     }
//! }
//! ```

mod config;
mod dependency;
mod error;
mod fetch;
mod importer;
mod loader;
pub mod markup;
pub mod mime;
mod sandbox;
pub mod source_map;
mod strategy;
mod style;

pub use config::SandboxConfig;
pub use dependency::{
    Dependency, DependencyRef, DependencyState, DependencyStore, Fingerprint, Upsert,
};
pub use error::{Result, SandboxError};
pub use fetch::{FetchConfig, RemoteFetcher};
pub use importer::{ImportEntry, ImportOutcome, ImportReport, ImporterEvent, ModuleImporter};
pub use loader::{
    Loader, LoaderContext, LoaderFactory, LoaderInput, LoaderRegistry, LoaderResult,
    PassThroughLoader,
};
pub use markup::MarkupLoader;
pub use sandbox::{ResetOutcome, Sandbox, SandboxEntry, SandboxEvent, SandboxState};
pub use source_map::{Position, PositionMap, SourceMap};
pub use strategy::{canonical_uri, join_uri, MemoryStrategy, SandboxedStrategy, Strategy};
pub use style::StyleLoader;
