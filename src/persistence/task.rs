use crate::Error;
use futures::future::{BoxFuture, Shared};
use tokio::task::JoinHandle;

/// Whether a write blocks the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Durable before the call returns, used at orderly shutdown.
    Sync,
    /// Runs on the blocking pool; the caller gets a handle.
    Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing changed since the last write.
    Skipped,
    /// Number of files physically replaced.
    Written(usize),
}

/// Handle to a requested write.
///
/// Dropping a pending task does not cancel the write.
#[derive(Debug)]
pub enum WriteTask {
    Completed(Result<WriteOutcome, Error>),
    Pending(JoinHandle<Result<WriteOutcome, Error>>),
}

impl WriteTask {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(handle) if !handle.is_finished())
    }

    pub async fn wait(self) -> Result<WriteOutcome, Error> {
        match self {
            Self::Completed(result) => result,
            Self::Pending(handle) => handle
                .await
                .map_err(|err| Error::Storage(format!("Write task failed: {err}")))?,
        }
    }
}

/// Summary of a completed attribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttributionReport {
    /// Files decoded successfully.
    pub loaded: usize,
    /// Corrupt files replaced with an empty placeholder.
    pub rescued: usize,
}

/// Shared handle to the background load of a store's conversations.
///
/// Every clone resolves to the same result; the load runs whether or not
/// anyone awaits it.
#[derive(Clone)]
pub struct AttributeTask(Shared<BoxFuture<'static, Result<AttributionReport, Error>>>);

impl AttributeTask {
    pub(crate) fn new(future: Shared<BoxFuture<'static, Result<AttributionReport, Error>>>) -> Self {
        Self(future)
    }

    pub fn is_finished(&self) -> bool {
        self.0.peek().is_some()
    }

    pub async fn wait(self) -> Result<AttributionReport, Error> {
        self.0.await
    }

    /// Whether both handles refer to the same load.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}
