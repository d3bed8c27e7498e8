//! Async task launcher with shutdown gating.
//!
//! Side work spawned from the apply path (checksum computation, first-range
//! gossip) goes through a `Stopper` so shutdown can refuse new tasks and
//! drain in-flight ones. Callers must handle a refused launch themselves
//! (e.g. by completing any signal the task would have fired).

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use tokio::runtime::Handle;
use tokio::task::JoinSet;

pub struct Stopper {
    handle: Handle,
    quiescing: AtomicBool,
    tasks: Mutex<JoinSet<()>>,
}

impl Stopper {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            quiescing: AtomicBool::new(false),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Bind to the runtime the caller is running on.
    pub fn from_current() -> anyhow::Result<Self> {
        let handle = Handle::try_current().context("stopper requires a tokio runtime")?;
        Ok(Self::new(handle))
    }

    /// Spawn `task` unless the stopper is quiescing.
    pub fn run_async_task<F>(&self, name: &'static str, task: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_quiescing() {
            anyhow::bail!("stopper quiescing; refused async task {name}");
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, &self.handle);
        tracing::trace!(task = name, "spawned async task");
        Ok(())
    }

    pub fn quiesce(&self) {
        self.quiescing.store(true, Ordering::SeqCst);
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::SeqCst)
    }

    /// Wait for every task spawned so far to finish.
    pub async fn drain(&self) {
        loop {
            let mut tasks = {
                let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *guard)
            };
            if tasks.is_empty() {
                return;
            }
            while let Some(res) = tasks.join_next().await {
                if let Err(err) = res {
                    tracing::warn!(error = ?err, "async task failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for Stopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stopper")
            .field("quiescing", &self.is_quiescing())
            .finish()
    }
}
