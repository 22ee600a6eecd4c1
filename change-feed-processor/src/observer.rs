//! Application callbacks.
//!
//! A [`ChangeFeedObserver`] is created per partition when this worker starts
//! supervising it and closed when supervision ends. Plain
//! `(changes, cancel) -> future` closures can be plugged in with
//! [`observer_fn`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::supervisor::checkpointer::Checkpointer;

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The worker is stopping or released the lease voluntarily.
    Shutdown,
    /// Another worker owns the lease now.
    LeaseLost,
    /// The partition split; child leases take over.
    LeaseGone,
    /// The observer itself failed.
    ObserverError,
    /// The monitored feed no longer exists.
    ResourceGone,
    Unknown,
}

/// What an observer knows about the batch it is handling.
#[derive(Clone)]
pub struct ChangeFeedContext {
    lease_token: String,
    continuation: Option<String>,
    checkpointer: Arc<Checkpointer>,
}

impl ChangeFeedContext {
    pub(crate) fn new(
        lease_token: String,
        continuation: Option<String>,
        checkpointer: Arc<Checkpointer>,
    ) -> Self {
        Self {
            lease_token,
            continuation,
            checkpointer,
        }
    }

    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    /// Continuation just past the current batch.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Persist progress up to the end of the current batch. Only meaningful
    /// with [`CheckpointFrequency::Explicit`](crate::config::CheckpointFrequency::Explicit)
    /// or to checkpoint ahead of the automatic schedule.
    pub async fn checkpoint(&self) -> Result<()> {
        match &self.continuation {
            Some(continuation) => self.checkpointer.checkpoint(continuation).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait ChangeFeedObserver: Send {
    async fn open(&mut self, _ctx: &ChangeFeedContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle one batch. Progress is only checkpointed once this returns `Ok`;
    /// an `Err` stops the partition on this worker.
    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedContext,
        changes: Vec<Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    async fn close(&mut self, _ctx: &ChangeFeedContext, _reason: CloseReason) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait ChangeFeedObserverFactory: Send + Sync {
    fn create(&self) -> Box<dyn ChangeFeedObserver>;
}

/// Wrap a batch callback into an observer factory.
pub fn observer_fn<F, Fut>(callback: F) -> Arc<dyn ChangeFeedObserverFactory>
where
    F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnObserverFactory {
        callback: Arc::new(callback),
    })
}

struct FnObserverFactory<F> {
    callback: Arc<F>,
}

impl<F, Fut> ChangeFeedObserverFactory for FnObserverFactory<F>
where
    F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn create(&self) -> Box<dyn ChangeFeedObserver> {
        Box::new(FnObserver {
            callback: self.callback.clone(),
        })
    }
}

struct FnObserver<F> {
    callback: Arc<F>,
}

#[async_trait]
impl<F, Fut> ChangeFeedObserver for FnObserver<F>
where
    F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process_changes(
        &mut self,
        _ctx: &ChangeFeedContext,
        changes: Vec<Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        (self.callback)(changes, cancel.clone()).await
    }
}
