//! Tracked background work
//!
//! Teardown of superseded deployments and startup redeploys run off the
//! caller's path. They are submitted here instead of being spawned loose so
//! failures get logged and shutdown can wait for them.

use crate::error::FleetResult;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::{Instrument, Span};

pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
    span: Span,
}

impl BackgroundTasks {
    /// Tasks inherit `span` so their logs carry the owner's context
    pub fn new(span: Span) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            span,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` in the background, logging its error if it fails.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = FleetResult<()>> + Send + 'static,
    {
        let task = async move {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "Background task failed");
            }
        }
        .instrument(self.span.clone());

        let mut tasks = self.lock();
        // Reap whatever already finished so the set does not grow unbounded
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        tasks.spawn(task);
    }

    /// Number of tasks not yet reaped
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every submitted task, including ones submitted while
    /// waiting, has finished
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.lock());
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Background task panicked");
                }
            }
        }
    }
}
