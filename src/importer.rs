//! The module importer.
//!
//! Given an entry, the importer makes sure the store holds a loaded
//! [`Dependency`] for the entry and for everything reachable through
//! `imported_uris`. Traversal is depth-first in discovery order.
//!
//! Each traversal works on a staged copy of the store and is committed in one
//! swap once it has converged, so callers never observe a partial graph.
//! Dependencies that are no longer reachable from the entry are pruned at
//! commit time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};

use crate::dependency::{Dependency, DependencyState, DependencyStore, Upsert};
use crate::error::{Result, SandboxError};
use crate::loader::{LoaderInput, LoaderRegistry};
use crate::mime;
use crate::strategy::{canonical_uri, Strategy};

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Aggregated notification emitted once per committed traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImporterEvent {
    /// Fingerprints of previously known dependencies changed.
    Changed { uris: Vec<String> },
}

/// The entry of the last committed traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub mime_type: String,
    pub uri: String,
}

/// What a committed traversal did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Canonical uri of the entry.
    pub entry: String,
    /// Dependencies a loader ran for, in traversal order.
    pub loaded: Vec<String>,
    /// Previously known dependencies whose content changed.
    pub changed: Vec<String>,
    /// Dependencies pruned because they are no longer reachable.
    pub removed: Vec<String>,
    /// Generation the traversal ran in.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Committed(ImportReport),
    /// A `reset` happened while the traversal was in flight; its result was
    /// discarded.
    Superseded,
}

impl ImportOutcome {
    pub fn report(&self) -> Option<&ImportReport> {
        match self {
            ImportOutcome::Committed(report) => Some(report),
            ImportOutcome::Superseded => None,
        }
    }
}

#[derive(Default)]
struct ImporterState {
    store: DependencyStore,
    /// Uris whose content was checked against the strategy this generation.
    verified: HashSet<String>,
    entry: Option<ImportEntry>,
}

pub struct ModuleImporter {
    strategy: Arc<dyn Strategy>,
    registry: Arc<LoaderRegistry>,
    state: RwLock<ImporterState>,
    generation: AtomicU64,
    /// Serializes traversals.
    import_lock: Mutex<()>,
    events: broadcast::Sender<ImporterEvent>,
}

impl ModuleImporter {
    pub fn new(strategy: Arc<dyn Strategy>, registry: Arc<LoaderRegistry>) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            strategy,
            registry,
            state: RwLock::new(ImporterState::default()),
            generation: AtomicU64::new(0),
            import_lock: Mutex::new(()),
            events,
        }
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImporterEvent> {
        self.events.subscribe()
    }

    pub fn strategy(&self) -> &Arc<dyn Strategy> {
        &self.strategy
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn entry(&self) -> Option<ImportEntry> {
        self.state.read().entry.clone()
    }

    pub fn dependency(&self, uri: &str) -> Option<Dependency> {
        self.state.read().store.get(uri).cloned()
    }

    /// Snapshot of every committed dependency, ordered by uri.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.state.read().store.iter().cloned().collect()
    }

    /// Import the graph rooted at `reference`.
    ///
    /// With a `base`, the reference is resolved through the strategy against
    /// it. Without one it must already be an absolute uri or path; anything
    /// else is handed to the strategy with an empty base.
    pub async fn import(
        &self,
        mime_type: &str,
        reference: &str,
        base: Option<&str>,
    ) -> Result<ImportOutcome> {
        let uri = self.resolve_entry(reference, base).await?;
        self.run(&mime::normalize(mime_type), &uri, false, true).await
    }

    /// Like [`ModuleImporter::import`], but changed dependencies are only
    /// listed in the returned report and never broadcast to subscribers.
    pub async fn import_silently(
        &self,
        mime_type: &str,
        reference: &str,
        base: Option<&str>,
    ) -> Result<ImportOutcome> {
        let uri = self.resolve_entry(reference, base).await?;
        self.run(&mime::normalize(mime_type), &uri, false, false).await
    }

    async fn resolve_entry(&self, reference: &str, base: Option<&str>) -> Result<String> {
        match base {
            Some(base) => self
                .strategy
                .resolve(reference, base)
                .await
                .map_err(|e| SandboxError::resolution(reference, Some(base), e)),
            None => match canonical_uri(reference) {
                Ok(uri) => Ok(uri),
                Err(_) => self
                    .strategy
                    .resolve(reference, "")
                    .await
                    .map_err(|e| SandboxError::resolution(reference, None, e)),
            },
        }
    }

    /// Re-check the last entry's graph against the strategy.
    ///
    /// Returns `None` when nothing has been imported yet.
    pub async fn refresh(&self) -> Result<Option<ImportOutcome>> {
        let Some(entry) = self.entry() else {
            return Ok(None);
        };
        self.run(&entry.mime_type, &entry.uri, true, true).await.map(Some)
    }

    /// Forget which dependencies were verified and start a new generation.
    ///
    /// Uri identities and loaded output stay; the next traversal re-fetches
    /// every dependency and only reloads those whose fingerprint changed. A
    /// traversal still in flight will be superseded.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.verified.clear();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "importer reset");
    }

    async fn run(
        &self,
        mime_type: &str,
        uri: &str,
        reverify: bool,
        notify: bool,
    ) -> Result<ImportOutcome> {
        let _guard = self.import_lock.lock().await;
        let generation = self.generation();

        let (store, verified) = {
            let state = self.state.read();
            let verified = if reverify {
                HashSet::new()
            } else {
                state.verified.clone()
            };
            (state.store.clone(), verified)
        };
        tracing::debug!(uri, generation, reverify, "import started");

        let mut walk = Walk {
            strategy: &self.strategy,
            registry: &self.registry,
            store,
            verified,
            visited: HashSet::new(),
            path: Vec::new(),
            loaded: Vec::new(),
            changed: Vec::new(),
        };
        walk.visit(mime_type.to_string(), uri.to_string(), None).await?;

        let uri = canonical_uri(uri).map_err(|e| SandboxError::resolution(uri, None, e))?;
        let mut state = self.state.write();
        if self.generation() != generation {
            tracing::debug!(uri = %uri, generation, "import superseded");
            return Ok(ImportOutcome::Superseded);
        }

        let Walk {
            mut store,
            visited,
            loaded,
            changed,
            ..
        } = walk;
        let removed = store.retain(|uri| visited.contains(uri));
        for uri in &removed {
            tracing::debug!(uri = %uri, "pruned orphaned dependency");
        }
        state.store = store;
        state.verified = visited;
        state.entry = Some(ImportEntry {
            mime_type: mime_type.to_string(),
            uri: uri.clone(),
        });
        drop(state);

        tracing::info!(
            entry = %uri,
            generation,
            loaded = loaded.len(),
            changed = changed.len(),
            removed = removed.len(),
            "import committed"
        );
        if notify && !changed.is_empty() {
            // No receivers just means nobody is watching
            let _ = self.events.send(ImporterEvent::Changed {
                uris: changed.clone(),
            });
        }

        Ok(ImportOutcome::Committed(ImportReport {
            entry: uri,
            loaded,
            changed,
            removed,
            generation,
        }))
    }
}

impl std::fmt::Debug for ModuleImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleImporter")
            .field("registry", &self.registry)
            .field("generation", &self.generation())
            .field("dependencies", &self.state.read().store.len())
            .finish()
    }
}

/// One traversal over a staged store.
struct Walk<'a> {
    strategy: &'a Arc<dyn Strategy>,
    registry: &'a Arc<LoaderRegistry>,
    store: DependencyStore,
    verified: HashSet<String>,
    visited: HashSet<String>,
    /// Uris on the active resolution path.
    path: Vec<String>,
    loaded: Vec<String>,
    changed: Vec<String>,
}

impl<'a> Walk<'a> {
    fn visit(
        &mut self,
        mime_type: String,
        uri: String,
        referrer: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            let uri = canonical_uri(&uri)
                .map_err(|e| SandboxError::resolution(&uri, referrer.as_deref(), e))?;

            if let Some(start) = self.path.iter().position(|u| *u == uri) {
                let mut path = self.path[start..].to_vec();
                path.push(uri.clone());
                return Err(SandboxError::Cycle { uri, path });
            }
            if !self.visited.insert(uri.clone()) {
                return Ok(());
            }

            self.path.push(uri.clone());
            self.verify(&mime_type, &uri, referrer.as_deref()).await?;

            let imports = self
                .store
                .get(&uri)
                .map(|dependency| dependency.imported_uris.clone())
                .unwrap_or_default();
            for import in imports {
                let mime_type = mime::from_uri(&import).to_string();
                self.visit(mime_type, import, Some(uri.clone())).await?;
            }
            self.path.pop();
            Ok(())
        }
        .boxed()
    }

    /// Bring one dependency up to date: fetch it unless it was already
    /// verified this generation, then run its loader unless the loaded
    /// output is still current.
    async fn verify(&mut self, mime_type: &str, uri: &str, referrer: Option<&str>) -> Result<()> {
        let memoized = self.verified.contains(uri)
            && self
                .store
                .get(uri)
                .is_some_and(|dependency| dependency.mime_type == mime_type);

        if !memoized {
            let content = self
                .strategy
                .fetch(uri)
                .await
                .map_err(|e| SandboxError::resolution(uri, referrer, e))?;
            if self.store.upsert(uri, mime_type, content)? == Upsert::Changed {
                self.changed.push(uri.to_string());
            }
            self.verified.insert(uri.to_string());
        }

        let Some(dependency) = self.store.get_mut(uri) else {
            return Err(SandboxError::resolution(
                uri,
                referrer,
                anyhow::anyhow!("dependency vanished from the store"),
            ));
        };
        if dependency.is_loaded() {
            tracing::debug!(uri, "dependency unchanged, skipping loader");
            return Ok(());
        }

        dependency.state = DependencyState::Loading;
        let reference = dependency.reference();
        let input = LoaderInput::new(dependency.mime_type.as_str(), dependency.content.as_str());
        let loader = self
            .registry
            .create(&dependency.mime_type, Arc::clone(self.strategy));
        tracing::debug!(uri, mime_type = %input.mime_type, "loading dependency");

        let result = loader.load(&reference, input).await;
        let Some(dependency) = self.store.get_mut(uri) else {
            return Ok(());
        };
        match result {
            Ok(result) => {
                dependency.apply(result);
                self.loaded.push(uri.to_string());
                Ok(())
            }
            Err(e) => {
                dependency.state = DependencyState::Failed;
                Err(with_uri(uri, e))
            }
        }
    }
}

/// Loader failures that carry no uri are reported against the dependency
/// being transformed.
fn with_uri(uri: &str, error: SandboxError) -> SandboxError {
    match error {
        SandboxError::Resolution { .. }
        | SandboxError::Transform { .. }
        | SandboxError::Cycle { .. } => error,
        other => SandboxError::transform(uri, other),
    }
}
