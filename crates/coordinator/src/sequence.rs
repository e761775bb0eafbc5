//! The dedicated task every metadata job runs on.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A posted unit of metadata work, including delivery of its result.
pub(crate) type DbJob = BoxFuture<'static, ()>;

/// FIFO job runner. Each job runs to completion before the next starts.
pub(crate) struct DatabaseSequence {
    jobs: mpsc::UnboundedSender<DbJob>,
    task: JoinHandle<()>,
}

impl DatabaseSequence {
    pub fn spawn() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<DbJob>();
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            tracing::debug!("Database sequence stopped");
        });
        Self { jobs, task }
    }

    /// Returns false once the sequence has stopped.
    pub fn post(&self, job: DbJob) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Stop accepting jobs and wait for the queued ones to finish.
    pub async fn close(self) {
        drop(self.jobs);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Database sequence panicked");
        }
    }
}
