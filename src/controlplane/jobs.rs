//! Job Completion Tracker
//!
//! Drives a job handle to SUCCEEDED or FAILED by polling the array at a fixed
//! interval, bounded by a retry ceiling. Wall-clock time is bounded only by
//! `max_retries * poll_interval`; there is no other cancellation.

use crate::controlplane::allow_list::AllowList;
use crate::domain::model::{Job, JobStatus};
use crate::domain::ports::{ArrayTransportRef, Submission};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Default retry ceiling for job polling
pub const DEFAULT_MAX_JOB_RETRIES: u32 = 5;

/// Default delay between polls
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 1000;

/// Polling policy for the job tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPollConfig {
    /// Maximum number of polls before giving up
    pub max_retries: u32,
    /// Delay between polls in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_JOB_RETRIES,
            poll_interval_ms: DEFAULT_JOB_POLL_INTERVAL_MS,
        }
    }
}

impl JobPollConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Configuration(
                "jobs.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Job Tracker
// =============================================================================

/// Polls jobs to a terminal state
pub struct JobTracker {
    transport: ArrayTransportRef,
    allow_list: Arc<AllowList>,
    /// Configured policy, restored by `reset`
    defaults: JobPollConfig,
    /// Effective policy
    policy: RwLock<JobPollConfig>,
}

impl JobTracker {
    /// Create a tracker with the given policy
    pub fn new(
        transport: ArrayTransportRef,
        allow_list: Arc<AllowList>,
        config: JobPollConfig,
    ) -> Self {
        Self {
            transport,
            allow_list,
            policy: RwLock::new(config.clone()),
            defaults: config,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.read().max_retries
    }

    /// Change the retry ceiling
    pub fn set_max_retries(&self, max_retries: u32) -> Result<()> {
        if max_retries == 0 {
            return Err(Error::InvalidArgument(
                "max job retries must be at least 1".into(),
            ));
        }
        self.policy.write().max_retries = max_retries;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        self.policy.read().poll_interval()
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.policy.write().poll_interval_ms = interval.as_millis() as u64;
    }

    /// Restore the configured policy
    pub fn reset(&self) {
        *self.policy.write() = self.defaults.clone();
    }

    /// List job ids on an array, optionally filtered by status
    pub async fn list_jobs(&self, array_id: &str, status: Option<JobStatus>) -> Result<Vec<String>> {
        self.allow_list.check(array_id)?;
        self.transport.list_jobs(array_id, status).await
    }

    /// Fetch a job once, without waiting
    pub async fn get_job(&self, array_id: &str, job_id: &str) -> Result<Job> {
        self.allow_list.check(array_id)?;
        self.transport.get_job(array_id, job_id).await
    }

    /// Poll a job until it reaches a terminal state.
    ///
    /// Returns the succeeded job (its `result` may be empty). A FAILED job
    /// becomes `Error::JobFailed`; running out of polls becomes
    /// `Error::JobTimeout`. Transient poll failures use up a poll like any
    /// other non-terminal observation; other poll errors abort the wait.
    pub async fn wait_on_completion(&self, array_id: &str, job_id: &str) -> Result<Job> {
        self.allow_list.check(array_id)?;

        let policy = self.policy.read().clone();
        let mut last_status = None;

        for attempt in 1..=policy.max_retries {
            match self.transport.get_job(array_id, job_id).await {
                Ok(job) => {
                    debug!(
                        array_id = %array_id,
                        job_id = %job_id,
                        attempt = attempt,
                        status = %job.status,
                        "Polled job"
                    );
                    last_status = Some(job.status);
                    if job.is_terminal() {
                        return finish(job);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        array_id = %array_id,
                        job_id = %job_id,
                        attempt = attempt,
                        error = %e,
                        "Transient failure polling job"
                    );
                }
                Err(e) => return Err(e),
            }

            if attempt < policy.max_retries {
                tokio::time::sleep(policy.poll_interval()).await;
            }
        }

        warn!(
            array_id = %array_id,
            job_id = %job_id,
            attempts = policy.max_retries,
            "Job did not reach a terminal state"
        );
        Err(Error::JobTimeout {
            job_id: job_id.to_string(),
            attempts: policy.max_retries,
            last_status,
        })
    }

    /// Resolve a submission. Synchronous answers are returned as-is; jobs are
    /// waited on and yield `None`, leaving the caller to re-read the resource.
    pub(crate) async fn settle<T>(
        &self,
        array_id: &str,
        submission: Submission<T>,
    ) -> Result<Option<T>> {
        match submission {
            Submission::Complete(value) => Ok(Some(value)),
            Submission::Job(job) if job.is_terminal() => finish(job).map(|_| None),
            Submission::Job(job) => {
                info!(array_id = %array_id, job_id = %job.job_id, name = %job.name, "Waiting on job");
                self.wait_on_completion(array_id, &job.job_id).await?;
                Ok(None)
            }
        }
    }
}

fn finish(job: Job) -> Result<Job> {
    match job.status {
        JobStatus::Succeeded => Ok(job),
        status => Err(Error::JobFailed {
            job_id: job.job_id,
            status,
            result: job.result,
        }),
    }
}
