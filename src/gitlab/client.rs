use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::gitlab::{
    Features, Job, RegisterReq, RegisterResp, RequestJobReq, RunnerInfo, TraceSummary,
    UpdateJobReq,
};

pub static LAST_UPDATE_HEADER: &str = "X-Gitlab-Last-Update";
pub static TRACE_UPDATE_INTERVAL_HEADER: &str = "X-GitLab-Trace-Update-Interval";

const UPDATE_JOB_MAX_TRIALS: u32 = 8;

/// Returned by [`GitlabClient::request_job`] when Gitlab has no queued job
/// for this runner. Not a failure, the caller keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoJobAvailable;

impl fmt::Display for NoJobAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no job available")
    }
}

impl std::error::Error for NoJobAvailable {}

/// Raised when an operation is cut short by the shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation canceled")
    }
}

impl std::error::Error for Cancelled {}

/// Bridges Tart and Gitlab.
pub struct GitlabClient {
    http: reqwest::Client,
    features: Features,
    /// API endpoint, only scheme + host, e.g. https://gitlab.example.com
    endpoint: String,
    last_update_cursor: RwLock<String>,
}

impl GitlabClient {
    pub fn new(endpoint: &str, features: Features) -> Result<Self> {
        let url = Url::parse(endpoint).context("parsing endpoint")?;
        match url.scheme() {
            "http" | "https" => {}
            scheme => bail!("unexpected endpoint scheme, want http or https, got {scheme:?}"),
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| anyhow!("endpoint host is empty"))?;
        let mut endpoint = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            endpoint.push_str(&format!(":{port}"));
        }
        let http = reqwest::Client::builder()
            .user_agent(config::full_name())
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            features,
            endpoint,
            last_update_cursor: RwLock::new(String::new()),
        })
    }

    pub fn last_update_cursor(&self) -> String {
        self.last_update_cursor.read().unwrap().clone()
    }

    fn info(&self) -> RunnerInfo {
        RunnerInfo {
            architecture: "amd64".into(),
            // let's pretend we are shell
            executor: Some("shell".into()),
            shell: Some("bash".into()),
            features: self.features,
            name: config::NAME.into(),
            platform: "linux".into(),
            revision: config::REVISION.into(),
            version: config::full_name(),
        }
    }

    fn registration_info(&self) -> RunnerInfo {
        RunnerInfo {
            executor: None,
            shell: None,
            ..self.info()
        }
    }

    /// Turns a non-2xx response into an error carrying the status and the
    /// first bytes of the body.
    async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(256).collect();
        bail!("API responds with code {status}, body: {excerpt:?}")
    }

    /// Registers a new runner and obtains its access token.
    pub async fn register(&self, token: &str, description: &str) -> Result<String> {
        let body = RegisterReq {
            token: token.to_string(),
            description: description.to_string(),
            info: self.registration_info(),
            locked: false,
            maintenance_note: "Tart is an educational purpose toy CI runner.".to_string(),
            paused: false,
            run_untagged: true,
        };
        let resp = self
            .http
            .post(format!("{}/api/v4/runners", self.endpoint))
            .json(&body)
            .send()
            .await
            .context("calling Gitlab API")?;
        let resp = Self::ensure_success(resp).await?;
        let resp_body: RegisterResp = resp.json().await.context("unmarshaling JSON")?;
        Ok(resp_body.token)
    }

    pub async fn request_job(&self, access_token: &str) -> Result<Job> {
        let body = RequestJobReq {
            info: self.info(),
            last_update: self.last_update_cursor(),
            token: access_token.to_string(),
        };
        let resp = self
            .http
            .post(format!("{}/api/v4/jobs/request", self.endpoint))
            .json(&body)
            .send()
            .await
            .context("calling Gitlab API")?;
        let resp = Self::ensure_success(resp).await?;

        if let Some(cursor) = resp
            .headers()
            .get(LAST_UPDATE_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            if !cursor.is_empty() {
                *self.last_update_cursor.write().unwrap() = cursor.to_string();
            }
        }

        if resp.status() == StatusCode::NO_CONTENT {
            return Err(NoJobAvailable.into());
        }

        let job: Job = resp.json().await.context("unmarshaling JSON")?;
        Ok(job)
    }

    /// Reports the final state of a job.
    ///
    /// Gitlab may answer 202 with an `X-GitLab-Trace-Update-Interval` header,
    /// meaning "not ready, retry after N seconds". The request is re-issued
    /// after the suggested interval, up to 8 trials in total.
    pub async fn update_job(
        &self,
        shutdown: &CancellationToken,
        param: UpdateJobParam,
    ) -> Result<()> {
        let body = UpdateJobReq {
            checksum: param.trace_checksum.clone(),
            exit_code: param.exit_code,
            failure_reason: param.failure_reason,
            info: self.info(),
            output: TraceSummary {
                byte_size: param.trace_byte_size,
                checksum: param.trace_checksum.clone(),
            },
            state: param.state,
            token: param.job_token.clone(),
        };
        let url = format!("{}/api/v4/jobs/{}", self.endpoint, param.job_id);

        for trial in 1..=UPDATE_JOB_MAX_TRIALS {
            let resp = self
                .http
                .put(&url)
                .json(&body)
                .send()
                .await
                .context("calling Gitlab API")?;
            let backoff = resp
                .headers()
                .get(TRACE_UPDATE_INTERVAL_HEADER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0);
            Self::ensure_success(resp).await?;
            if backoff == 0 {
                return Ok(());
            }
            if trial == UPDATE_JOB_MAX_TRIALS {
                bail!("API still asks for backoff after {UPDATE_JOB_MAX_TRIALS} trials");
            }
            debug!("job status not accepted yet, retrying in {backoff}s...");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                _ = shutdown.cancelled() => bail!(
                    "retrying to update the job status for the {} time: {}",
                    trial + 1,
                    Cancelled
                ),
            }
        }
        unreachable!("update job trial loop always returns")
    }

    /// Uploads `content_length` trace bytes starting at `range_start`.
    /// Returns the next range start on success.
    pub async fn append_job_trace(
        &self,
        param: AppendJobTraceParam,
        body: reqwest::Body,
    ) -> Result<u64> {
        if param.content_length == 0 {
            bail!("content length must be positive, got 0");
        }
        let resp = self
            .http
            .patch(format!(
                "{}/api/v4/jobs/{}/trace",
                self.endpoint, param.job_id
            ))
            .header(CONTENT_TYPE, "text/plain")
            .header("Job-Token", &param.job_token)
            .header(CONTENT_LENGTH, param.content_length)
            // both ends are zero-indexed and inclusive
            .header(
                "Content-Range",
                format!(
                    "{}-{}",
                    param.range_start,
                    param.range_start + param.content_length - 1
                ),
            )
            .body(body)
            .send()
            .await
            .context("calling Gitlab API")?;
        Self::ensure_success(resp).await?;
        Ok(param.range_start + param.content_length)
    }
}

pub struct UpdateJobParam {
    /// Job's authentication token
    pub job_token: String,
    pub job_id: i64,
    /// success or failed
    pub state: crate::gitlab::JobState,
    /// e.g. crc32:29212cab
    pub trace_checksum: String,
    pub trace_byte_size: u64,
    pub exit_code: i32,
    pub failure_reason: crate::gitlab::FailureReason,
}

pub struct AppendJobTraceParam {
    /// Job's authentication token
    pub job_token: String,
    pub job_id: i64,
    pub content_length: u64,
    pub range_start: u64,
}
