//! The sandbox facade: one dependency graph, one execution context.
//!
//! `open` imports an entry through the [`ModuleImporter`]. When the importer
//! reports changed dependencies the sandbox resets itself: it drops the
//! execution context and reopens the same entry. Resets triggered while one is
//! running are coalesced into a single trailing run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::SandboxConfig;
use crate::dependency::Dependency;
use crate::error::{Result, SandboxError};
use crate::importer::{ImportOutcome, ImporterEvent, ModuleImporter};
use crate::loader::{push_unique, LoaderRegistry};
use crate::strategy::{SandboxedStrategy, Strategy};

/// The entry a sandbox was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEntry {
    pub mime_type: String,
    pub file_path: String,
    /// Base the file path was resolved against, if any.
    pub relative_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Closed,
    Opening,
    Open,
    Resetting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    /// An open (or the reopen of a reset) committed.
    Evaluated { entry: SandboxEntry },
    /// A reset finished; carries the dependency changes that triggered it.
    Changed { uris: Vec<String> },
    /// A reset could not reopen the entry. The sandbox keeps its prior state.
    ResetFailed { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// This call ran the reset, plus any trailing run queued meanwhile.
    Completed { runs: usize },
    /// A reset was already running; it will run once more for this trigger.
    Coalesced,
}

#[derive(Default)]
struct ResetQueue {
    running: bool,
    pending: bool,
    changed: Vec<String>,
}

type ContextFactory<G> = Box<dyn Fn() -> G + Send + Sync>;

struct Inner<G> {
    importer: ModuleImporter,
    factory: ContextFactory<G>,
    global: Mutex<Option<Arc<G>>>,
    entry: Mutex<Option<SandboxEntry>>,
    state: Mutex<SandboxState>,
    /// Bumped by every reset; an open that started before it is stale.
    generation: AtomicU64,
    open_lock: tokio::sync::Mutex<()>,
    resets: Mutex<ResetQueue>,
    events: broadcast::Sender<SandboxEvent>,
}

/// Owns one dependency graph and one lazily created execution context `G`.
///
/// Cloning is cheap and yields a handle to the same sandbox.
pub struct Sandbox<G> {
    inner: Arc<Inner<G>>,
}

impl<G> Clone for Sandbox<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Send + Sync + 'static> Sandbox<G> {
    /// Create a sandbox. Must be called from within a tokio runtime, which
    /// drives the change listener.
    pub fn new(
        strategy: Arc<dyn Strategy>,
        registry: Arc<LoaderRegistry>,
        factory: impl Fn() -> G + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::build(
            strategy,
            registry,
            Box::new(factory),
            SandboxConfig::default().event_capacity,
        )
    }

    /// Sandbox over a [`SandboxedStrategy`] rooted at `config.root_dir`,
    /// with the default loaders.
    pub fn from_config(
        config: &SandboxConfig,
        factory: impl Fn() -> G + Send + Sync + 'static,
    ) -> Result<Self> {
        let strategy = SandboxedStrategy::from_config(config)
            .map_err(|e| SandboxError::Config(e.to_string()))?;
        Self::build(
            Arc::new(strategy),
            Arc::new(LoaderRegistry::with_defaults()),
            Box::new(factory),
            config.event_capacity,
        )
    }

    fn build(
        strategy: Arc<dyn Strategy>,
        registry: Arc<LoaderRegistry>,
        factory: ContextFactory<G>,
        event_capacity: usize,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| SandboxError::Config(format!("sandbox needs a tokio runtime: {}", e)))?;
        let event_capacity = event_capacity.max(1);

        let importer = ModuleImporter::new(strategy, registry).with_event_capacity(event_capacity);
        let changes = importer.subscribe();
        let (events, _) = broadcast::channel(event_capacity);

        let inner = Arc::new(Inner {
            importer,
            factory,
            global: Mutex::new(None),
            entry: Mutex::new(None),
            state: Mutex::new(SandboxState::Closed),
            generation: AtomicU64::new(0),
            open_lock: tokio::sync::Mutex::new(()),
            resets: Mutex::new(ResetQueue::default()),
            events,
        });
        handle.spawn(listen(Arc::downgrade(&inner), changes));

        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> SandboxState {
        *self.inner.state.lock()
    }

    pub fn entry(&self) -> Option<SandboxEntry> {
        self.inner.entry.lock().clone()
    }

    pub fn importer(&self) -> &ModuleImporter {
        &self.inner.importer
    }

    /// The committed dependency for the current entry.
    pub fn entry_dependency(&self) -> Option<Dependency> {
        let entry = self.inner.importer.entry()?;
        self.inner.importer.dependency(&entry.uri)
    }

    /// The execution context, created on first access after open or reset.
    pub fn global(&self) -> Arc<G> {
        let mut global = self.inner.global.lock();
        Arc::clone(global.get_or_insert_with(|| Arc::new((self.inner.factory)())))
    }

    /// Import the graph rooted at `file_path` and make it the entry.
    ///
    /// Opens on one sandbox run one at a time. On failure the sandbox keeps
    /// its previous entry and state.
    pub async fn open(
        &self,
        mime_type: &str,
        file_path: &str,
        relative_path: Option<&str>,
    ) -> Result<()> {
        let entry = SandboxEntry {
            mime_type: mime_type.to_string(),
            file_path: file_path.to_string(),
            relative_path: relative_path.map(str::to_string),
        };
        self.open_entry(Some(entry), SandboxState::Opening)
            .await
            .map(|_| ())
    }

    /// Drop the execution context and reopen the current entry.
    pub async fn reset(&self) -> ResetOutcome {
        self.trigger_reset(Vec::new()).await
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Open `entry`, or reopen the recorded entry when `None`.
    ///
    /// A reopen (`Resetting`) imports without broadcasting and returns the
    /// changed uris, which the running reset reports itself.
    async fn open_entry(
        &self,
        entry: Option<SandboxEntry>,
        transitional: SandboxState,
    ) -> Result<Vec<String>> {
        let _guard = self.inner.open_lock.lock().await;
        let mut generation = self.inner.generation.load(Ordering::SeqCst);

        let Some(entry) = entry.or_else(|| self.entry()) else {
            return Ok(Vec::new());
        };
        let previous = std::mem::replace(&mut *self.inner.state.lock(), transitional);
        tracing::info!(
            file_path = %entry.file_path,
            mime_type = %entry.mime_type,
            generation,
            "opening sandbox entry"
        );

        let report = loop {
            let importer = &self.inner.importer;
            let (mime_type, file_path, base) = (
                entry.mime_type.as_str(),
                entry.file_path.as_str(),
                entry.relative_path.as_deref(),
            );
            let outcome = if transitional == SandboxState::Resetting {
                importer.import_silently(mime_type, file_path, base).await
            } else {
                importer.import(mime_type, file_path, base).await
            };

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    *self.inner.state.lock() = previous;
                    return Err(e);
                }
            };

            let current = self.inner.generation.load(Ordering::SeqCst);
            if current != generation {
                // A reset cleared the importer under this open; import again
                tracing::debug!(file_path = %entry.file_path, "open overtaken by reset, retrying");
                generation = current;
                continue;
            }

            match outcome {
                ImportOutcome::Committed(report) => break report,
                // The importer was reset directly; import again
                ImportOutcome::Superseded => continue,
            }
        };

        *self.inner.entry.lock() = Some(entry.clone());
        *self.inner.state.lock() = SandboxState::Open;
        let _ = self.inner.events.send(SandboxEvent::Evaluated { entry });
        Ok(report.changed)
    }

    // ========================================================================
    // Reset
    // ========================================================================

    async fn trigger_reset(&self, uris: Vec<String>) -> ResetOutcome {
        {
            let mut queue = self.inner.resets.lock();
            for uri in uris {
                push_unique(&mut queue.changed, uri);
            }
            if queue.running {
                queue.pending = true;
                tracing::debug!("reset already running, coalescing");
                return ResetOutcome::Coalesced;
            }
            queue.running = true;
        }

        let mut runs = 0;
        loop {
            let mut changed = {
                let mut queue = self.inner.resets.lock();
                queue.pending = false;
                std::mem::take(&mut queue.changed)
            };
            runs += 1;

            match self.run_reset().await {
                Ok(reopened) => {
                    for uri in reopened {
                        push_unique(&mut changed, uri);
                    }
                    let _ = self.inner.events.send(SandboxEvent::Changed { uris: changed });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sandbox reset failed");
                    let _ = self.inner.events.send(SandboxEvent::ResetFailed {
                        message: e.to_string(),
                    });
                }
            }

            let mut queue = self.inner.resets.lock();
            if !queue.pending {
                queue.running = false;
                break;
            }
        }

        tracing::debug!(runs, "sandbox reset completed");
        ResetOutcome::Completed { runs }
    }

    /// Returns the dependencies the reopen found changed.
    async fn run_reset(&self) -> Result<Vec<String>> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.importer.reset();
        *self.inner.global.lock() = None;
        self.open_entry(None, SandboxState::Resetting).await
    }
}

impl<G> std::fmt::Debug for Sandbox<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("state", &*self.inner.state.lock())
            .field("entry", &*self.inner.entry.lock())
            .field("importer", &self.inner.importer)
            .finish()
    }
}

/// Turn importer change notifications into resets for as long as the sandbox
/// is alive.
async fn listen<G: Send + Sync + 'static>(
    inner: Weak<Inner<G>>,
    mut changes: broadcast::Receiver<ImporterEvent>,
) {
    loop {
        let uris = match changes.recv().await {
            Ok(ImporterEvent::Changed { uris }) => uris,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "change listener lagged");
                Vec::new()
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let sandbox = Sandbox { inner };
        tokio::spawn(async move {
            sandbox.trigger_reset(uris).await;
        });
    }
}
