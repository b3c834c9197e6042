//! Background jobs.
//!
//! A job is a task spawned on the tokio runtime with its own cancel token.
//! Operations started through its [`JobContext`] observe that token while
//! waiting for rules and between the steps of long operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canopy_types::JobId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::operation::Operation;
use crate::rules::SchedulingRule;
use crate::workspace::Workspace;

/// What a running job gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub workspace: Arc<Workspace>,
    pub id: JobId,
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Start a batch owned by this job and bound to its cancel token.
    ///
    /// Fails with `IllegalNesting` while an earlier batch of the same job is
    /// still open; work inside a held rule goes through that batch.
    pub async fn begin(&self, rule: SchedulingRule) -> WorkspaceResult<Operation<'_>> {
        self.workspace
            .begin_as(self.id, rule, &self.cancel, self.workspace.config().lock_timeout())
            .await
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handle to a spawned job.
#[derive(Debug)]
pub struct JobHandle<T> {
    id: JobId,
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<WorkspaceResult<T>>>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the job to stop. Rule waits and copy loops inside it fail with
    /// `OperationCanceled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the job's result.
    ///
    /// Fails with `WaitTimeout` when `timeout` elapses and with
    /// `OperationCanceled` when the caller's `cancel` fires; the job keeps
    /// running in both cases and can be waited for again.
    pub async fn wait(
        &mut self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> WorkspaceResult<T> {
        let Some(task) = self.task.as_mut() else {
            return Err(WorkspaceError::JobFailed {
                job: self.id,
                reason: "result already taken".into(),
            });
        };
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        let joined = tokio::select! {
            joined = task => joined,
            _ = cancel.cancelled() => return Err(WorkspaceError::OperationCanceled),
            _ = deadline => {
                return Err(WorkspaceError::WaitTimeout(format!("job {} ({})", self.id, self.name)));
            }
        };
        self.task = None;
        match joined {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(WorkspaceError::JobFailed {
                job: self.id,
                reason: "aborted".into(),
            }),
            Err(err) => Err(WorkspaceError::JobFailed {
                job: self.id,
                reason: err.to_string(),
            }),
        }
    }
}

impl Workspace {
    /// Run `f` as a background job on the current runtime.
    pub fn spawn_job<F, Fut, T>(self: &Arc<Self>, name: impl Into<String>, f: F) -> JobHandle<T>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = WorkspaceResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.allocate_job();
        let name = name.into();
        let cancel = CancellationToken::new();
        let context = JobContext {
            workspace: Arc::clone(self),
            id,
            cancel: cancel.clone(),
        };
        debug!(job = %id, %name, "job spawned");
        let span = info_span!("job", job = %id, name = %name);
        let task = tokio::spawn(f(context).instrument(span));
        JobHandle {
            id,
            name,
            cancel,
            task: Some(task),
        }
    }
}
