//! Queue entries: a re-runnable unit of work plus its completion callback

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub type WorkFuture = BoxFuture<'static, anyhow::Result<()>>;

type WorkFn = Box<dyn Fn() -> WorkFuture + Send + Sync>;
type FinishFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// One item of the executor's FIFO queue
///
/// The work is a factory rather than a future so an entry that was cancelled
/// mid-flight can be put back on the queue and started again from scratch.
pub struct QueueEntry {
    label: String,
    work: WorkFn,
    on_finish: Option<FinishFn>,
    timeout: Option<Duration>,
}

impl QueueEntry {
    pub fn new<F, Fut>(label: impl Into<String>, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            work: Box::new(move || work().boxed()),
            on_finish: None,
            timeout: None,
        }
    }

    /// Callback invoked after the work completed successfully
    pub fn on_finish<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_finish = Some(Box::new(callback));
        self
    }

    /// Deadline for a single run of the work
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn set_default_timeout(&mut self, timeout: Option<Duration>) {
        if self.timeout.is_none() {
            self.timeout = timeout;
        }
    }

    pub(crate) fn start(&self) -> WorkFuture {
        (self.work)()
    }

    pub(crate) fn finish(&self) -> anyhow::Result<()> {
        match &self.on_finish {
            Some(callback) => callback(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("label", &self.label)
            .field("has_on_finish", &self.on_finish.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
