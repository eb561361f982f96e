//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use async_trait::async_trait;
use live_sandbox::{
    DependencyRef, Loader, LoaderContext, LoaderInput, LoaderResult, MemoryStrategy, Result,
    Strategy,
};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

/// In-memory strategy with controllable latency, a resolve log and a fetch
/// gate.
#[derive(Default)]
pub struct TestStrategy {
    files: MemoryStrategy,
    delays: Mutex<HashMap<String, u64>>,
    resolved: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    blocked: Notify,
}

impl TestStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, uri: &str, content: &str) -> Self {
        self.files.set(uri, content);
        self
    }

    pub fn set(&self, uri: &str, content: &str) {
        self.files.set(uri, content);
    }

    /// Delay resolution of `reference` by `ms` milliseconds.
    pub fn delay(&self, reference: &str, ms: u64) {
        self.delays.lock().insert(reference.to_string(), ms);
    }

    pub fn clear_delays(&self) {
        self.delays.lock().clear();
    }

    /// References passed to `resolve`, in call order.
    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    /// Make every following fetch wait until [`TestStrategy::open_gate`].
    pub fn close_gate(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(1);
        }
    }

    /// Wait until a fetch is parked on the closed gate.
    pub async fn wait_blocked(&self) {
        self.blocked.notified().await;
    }
}

#[async_trait]
impl Strategy for TestStrategy {
    async fn resolve(&self, reference: &str, base_uri: &str) -> std::result::Result<String, Error> {
        self.resolved.lock().push(reference.to_string());
        let delay = self.delays.lock().get(reference).copied();
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        self.files.resolve(reference, base_uri).await
    }

    async fn fetch(&self, uri: &str) -> std::result::Result<String, Error> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            self.blocked.notify_one();
            // The permit goes straight back so every parked fetch passes
            let _permit = gate.acquire().await?;
        }
        self.fetched.lock().push(uri.to_string());
        self.files.fetch(uri).await
    }
}

/// Loader that counts invocations and records the content it was handed.
#[derive(Clone, Default)]
pub struct CountingLoader {
    calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<String>>>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    /// Factory suitable for [`live_sandbox::LoaderRegistry::register`].
    pub fn factory(&self) -> impl Fn(LoaderContext) -> Box<dyn Loader> + Send + Sync {
        let loader = self.clone();
        move |_| Box::new(loader.clone()) as Box<dyn Loader>
    }
}

#[async_trait]
impl Loader for CountingLoader {
    async fn load(&self, _dependency: &DependencyRef, input: LoaderInput) -> Result<LoaderResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.content.clone());
        Ok(LoaderResult::passthrough(input.content))
    }
}

/// Receive until `pick` returns a value, failing after a few seconds.
pub async fn next_matching<E: Clone, T>(
    events: &mut tokio::sync::broadcast::Receiver<E>,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `condition` until it holds, failing after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}
