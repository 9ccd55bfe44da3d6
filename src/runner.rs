use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::executor::{Build, BuildResult, Executor, ExecutorConfig};
use crate::gitlab::{Cancelled, FailureReason, GitlabClient, Job, JobTrace};

const POLL_PERIOD: Duration = Duration::from_secs(5);
const WORKING_DIR: &str = "ci-repo";

/// Polls Gitlab for jobs and drives one job at a time through the executor.
pub struct Runner {
    access_token: String,
    client: Arc<GitlabClient>,
    executor_config: ExecutorConfig,
}

impl Runner {
    pub fn new(
        access_token: String,
        client: Arc<GitlabClient>,
        executor_config: ExecutorConfig,
    ) -> Self {
        Self {
            access_token,
            client,
            executor_config,
        }
    }

    /// Blocks until Gitlab hands out a job or `shutdown` fires.
    pub async fn poll_new_job(&self, shutdown: &CancellationToken) -> Result<Job> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Cancelled.into()),
                _ = tokio::time::sleep(POLL_PERIOD) => {}
            }

            let request = tokio::select! {
                _ = shutdown.cancelled() => return Err(Cancelled.into()),
                request = self.client.request_job(&self.access_token) => request,
            };
            match request {
                Ok(job) => {
                    info!("got new job {} ({})", job.id, job.job_info.name);
                    return Ok(job);
                }
                Err(err) => debug!(
                    "polling new job every {}s: {err:#}",
                    POLL_PERIOD.as_secs()
                ),
            }
        }
    }

    /// Runs one job to completion. Every exit path settles the trace with
    /// exactly one of complete or fail.
    pub async fn run_job(&self, shutdown: &CancellationToken, job: Job) -> Result<()> {
        let trace = JobTrace::new(self.client.clone(), job.token.clone(), job.id)
            .context("init trace")?;

        match self.run_job_inner(&job, trace.clone()).await {
            Ok(result) => match result.err {
                Some(err) => {
                    if let Err(finish_err) = trace
                        .fail(shutdown, result.exit_code, result.failure_reason)
                        .await
                    {
                        warn!("failing trace: {finish_err:#}");
                    }
                    Err(err.context("running build"))
                }
                None => {
                    if let Err(finish_err) = trace.complete(shutdown).await {
                        warn!("completing trace: {finish_err:#}");
                    }
                    Ok(())
                }
            },
            Err(err) => {
                if let Err(finish_err) = trace
                    .fail(shutdown, 0, FailureReason::RunnerSystemFailure)
                    .await
                {
                    warn!("failing trace: {finish_err:#}");
                }
                Err(err)
            }
        }
    }

    /// The executor is closed on every path before the caller settles the
    /// trace, so trace finalization runs against an already-torn-down VM.
    async fn run_job_inner(&self, job: &Job, trace: Arc<JobTrace>) -> Result<BuildResult> {
        let build = Build::new(job.clone(), WORKING_DIR).context("initializing build")?;
        let mut executor = Executor::new(self.executor_config.clone(), build, trace)
            .context("initializing executor")?;

        let result = match executor.prepare().await {
            Ok(()) => Ok(executor.build().await),
            Err(err) => Err(err.context("preparing build")),
        };
        executor.close().await;
        result
    }
}
