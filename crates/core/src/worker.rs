//! Single-job conversion worker
//!
//! Runs at most one conversion at a time on a background task. Callers get a
//! [`JobHandle`] to follow progress, cancel, and collect the result.

use crate::job::ConversionJob;
use crate::package::ArchiveBundle;
use crate::pipeline::{ConversionPipeline, PipelineError, Stage, StageError};
use crate::progress::{JobEvent, ProgressReporter};
use hls_packager_config::Config;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Another job holds the worker
    #[error("a conversion is already running")]
    Busy,
}

/// Runs conversions one at a time
#[derive(Clone)]
pub struct ConversionWorker {
    pipeline: Arc<ConversionPipeline>,
    /// One permit; held by the running job
    semaphore: Arc<Semaphore>,
}

impl ConversionWorker {
    pub fn new(pipeline: ConversionPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ConversionPipeline::from_config(config))
    }

    /// Whether a job is currently running
    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// Start `job` on a background task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`WorkerError::Busy`] while another job is running.
    pub fn start(&self, job: ConversionJob) -> Result<JobHandle, WorkerError> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| WorkerError::Busy)?;

        let (reporter, events) = ProgressReporter::channel();
        let cancel = CancellationToken::new();
        let id = job.id.clone();

        // The handle must not hold a sender, or `next_event` would never end
        let watch = reporter.detached();

        let pipeline = Arc::clone(&self.pipeline);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            pipeline.run(&job, &reporter, &task_cancel).await
        });

        Ok(JobHandle {
            id,
            events,
            cancel,
            watch,
            task,
        })
    }
}

/// A running job
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    events: mpsc::UnboundedReceiver<JobEvent>,
    cancel: CancellationToken,
    watch: ProgressReporter,
    task: JoinHandle<Result<ArchiveBundle, PipelineError>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next progress or state event; `None` once the job has finished and all
    /// events were read
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Ask the job to stop; a running transcoder is killed
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Highest progress the job has reported
    pub fn progress(&self) -> u8 {
        self.watch.current()
    }

    /// Wait for the job to end and return its result
    pub async fn wait(self) -> Result<ArchiveBundle, PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::new(
                Stage::from_progress(self.watch.current()),
                StageError::Panicked(e.to_string()),
            )),
        }
    }
}
