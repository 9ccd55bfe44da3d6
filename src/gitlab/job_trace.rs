use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::gitlab::{
    AppendJobTraceParam, FailureReason, GitlabClient, JobState, UpdateJobParam,
};

const UPLOAD_PERIOD: Duration = Duration::from_secs(10);
const UPLOAD_RETRY_PERIOD: Duration = Duration::from_secs(3);
const APPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Console log of one job: durably buffered in a temp file and shipped to
/// Gitlab in chunks by a companion uploader task.
///
/// Producers call [`JobTrace::write`] concurrently; exactly one of
/// [`JobTrace::complete`] or [`JobTrace::fail`] terminates the trace and
/// submits the final job status.
pub struct JobTrace {
    client: Arc<GitlabClient>,
    job_token: String,
    job_id: i64,
    path: PathBuf,
    /// write-side state, held only for the duration of a file append
    write_state: Mutex<WriteState>,
    /// held across a whole append request so chunks never overlap
    upload_state: tokio::sync::Mutex<UploadState>,
    finished: AtomicBool,
    finish_notify: Notify,
}

struct WriteState {
    sink: std::fs::File,
    checksum: crc32fast::Hasher,
    written_bytes: u64,
}

struct UploadState {
    uploaded_bytes: u64,
}

impl JobTrace {
    /// Creates the trace and starts its uploader task.
    pub fn new(client: Arc<GitlabClient>, job_token: String, job_id: i64) -> Result<Arc<Self>> {
        let file = tempfile::Builder::new()
            .prefix("tart-job-log-")
            .suffix(".txt")
            .tempfile()
            .context("creating temp file")?;
        let (sink, path) = file
            .keep()
            .map_err(|e| anyhow!("keeping temp file: {e}"))?;

        let trace = Arc::new(Self {
            client,
            job_token,
            job_id,
            path,
            write_state: Mutex::new(WriteState {
                sink,
                checksum: crc32fast::Hasher::new(),
                written_bytes: 0,
            }),
            upload_state: tokio::sync::Mutex::new(UploadState { uploaded_bytes: 0 }),
            finished: AtomicBool::new(false),
            finish_notify: Notify::new(),
        });
        tokio::spawn(Self::interval_append_trace(trace.clone()));
        Ok(trace)
    }

    /// Appends bytes to the job log. Returns the number of bytes written.
    pub fn write(&self, p: &[u8]) -> Result<usize> {
        if self.finished.load(Ordering::Acquire) {
            bail!("trace collecting is finished");
        }

        let mut state = self.write_state.lock().unwrap();
        state.sink.write_all(p).context("writing to sink")?;
        state.checksum.update(p);
        state.written_bytes += p.len() as u64;
        Ok(p.len())
    }

    pub async fn complete(&self, shutdown: &CancellationToken) -> Result<()> {
        self.finish(shutdown, JobState::Success, 0, FailureReason::None)
            .await
    }

    pub async fn fail(
        &self,
        shutdown: &CancellationToken,
        exit_code: i32,
        reason: FailureReason,
    ) -> Result<()> {
        self.finish(shutdown, JobState::Failed, exit_code, reason).await
    }

    async fn finish(
        &self,
        shutdown: &CancellationToken,
        state: JobState,
        exit_code: i32,
        failure_reason: FailureReason,
    ) -> Result<()> {
        if self.finished.swap(true, Ordering::AcqRel) {
            bail!("job trace has been finished");
        }
        self.finish_notify.notify_one();

        self.appending_upload().await.context("flushing trace log")?;

        let checksum = {
            let write_state = self.write_state.lock().unwrap();
            write_state.checksum.clone().finalize()
        };
        let uploaded_bytes = self.upload_state.lock().await.uploaded_bytes;

        self.client
            .update_job(
                shutdown,
                UpdateJobParam {
                    job_token: self.job_token.clone(),
                    job_id: self.job_id,
                    state,
                    trace_checksum: format!("crc32:{checksum:08x}"),
                    trace_byte_size: uploaded_bytes,
                    exit_code,
                    failure_reason,
                },
            )
            .await
            .context("updating job status")?;

        std::fs::remove_file(&self.path).ok();
        Ok(())
    }

    /// Ships the unsent suffix of the log, if any. The upload lock serializes
    /// ticks against the final flush; `uploaded_bytes` only advances after
    /// the server acknowledged the chunk.
    async fn appending_upload(&self) -> Result<()> {
        let mut upload_state = self.upload_state.lock().await;

        let written_bytes = self.write_state.lock().unwrap().written_bytes;
        if written_bytes == 0 || upload_state.uploaded_bytes >= written_bytes {
            // nothing to do
            return Ok(());
        }
        let length = written_bytes - upload_state.uploaded_bytes;

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .context("opening trace log for upload")?;
        file.seek(std::io::SeekFrom::Start(upload_state.uploaded_bytes))
            .await
            .context("seeking trace log")?;
        let section = file.take(length);

        let param = AppendJobTraceParam {
            job_token: self.job_token.clone(),
            job_id: self.job_id,
            content_length: length,
            range_start: upload_state.uploaded_bytes,
        };
        let next_range_start = tokio::time::timeout(
            APPEND_TIMEOUT,
            self.client
                .append_job_trace(param, reqwest::Body::wrap_stream(ReaderStream::new(section))),
        )
        .await
        .map_err(|_| anyhow!("append job trace to Gitlab: timed out after {APPEND_TIMEOUT:?}"))?
        .context("append job trace to Gitlab")?;

        upload_state.uploaded_bytes = next_range_start;
        Ok(())
    }

    async fn interval_append_trace(self: Arc<Self>) {
        let mut period = UPLOAD_PERIOD;
        loop {
            tokio::select! {
                _ = self.finish_notify.notified() => return,
                _ = tokio::time::sleep(period) => {}
            }
            match self.appending_upload().await {
                Ok(()) => period = UPLOAD_PERIOD,
                Err(err) => {
                    warn!(
                        "appending trace failed, retry in {}s: {err:#}",
                        UPLOAD_RETRY_PERIOD.as_secs()
                    );
                    period = UPLOAD_RETRY_PERIOD;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitlab::Features;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> Arc<GitlabClient> {
        Arc::new(GitlabClient::new(&server.base_url(), Features::supported()).unwrap())
    }

    fn crc32_of(data: &[u8]) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        format!("crc32:{:08x}", hasher.finalize())
    }

    #[tokio::test]
    async fn write_then_complete_flushes_and_updates() {
        let server = MockServer::start_async().await;
        let append = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH)
                    .path("/api/v4/jobs/7/trace")
                    .header("Content-Range", "0-10")
                    .body("hello world");
                then.status(202);
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/v4/jobs/7").json_body_partial(
                    json!({
                        "state": "success",
                        "exit_code": 0,
                        "failure_reason": "",
                        "checksum": crc32_of(b"hello world"),
                        "output": {"bytesize": 11, "checksum": crc32_of(b"hello world")},
                    })
                    .to_string(),
                );
                then.status(200);
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 7).unwrap();
        assert_eq!(trace.write(b"hello ").unwrap(), 6);
        assert_eq!(trace.write(b"world").unwrap(), 5);
        trace.complete(&CancellationToken::new()).await.unwrap();

        append.assert_async().await;
        update.assert_async().await;
        assert!(!trace.path.exists());
    }

    #[tokio::test]
    async fn fail_reports_exit_code_and_reason() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH).path("/api/v4/jobs/9/trace");
                then.status(202);
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/v4/jobs/9").json_body_partial(
                    r#"{"state": "failed", "exit_code": 2, "failure_reason": "script_failure"}"#,
                );
                then.status(200);
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 9).unwrap();
        trace.write(b"exit 2\n").unwrap();
        trace
            .fail(&CancellationToken::new(), 2, FailureReason::ScriptFailure)
            .await
            .unwrap();
        update.assert_async().await;
    }

    #[tokio::test]
    async fn empty_trace_completes_without_append() {
        let server = MockServer::start_async().await;
        let append = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH).path("/api/v4/jobs/7/trace");
                then.status(202);
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/v4/jobs/7").json_body_partial(
                    json!({"output": {"bytesize": 0, "checksum": "crc32:00000000"}}).to_string(),
                );
                then.status(200);
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 7).unwrap();
        trace.complete(&CancellationToken::new()).await.unwrap();

        assert_eq!(append.hits_async().await, 0);
        update.assert_async().await;
    }

    #[tokio::test]
    async fn second_finish_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/v4/jobs/7");
                then.status(200);
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 7).unwrap();
        let shutdown = CancellationToken::new();
        trace.complete(&shutdown).await.unwrap();

        let err = trace
            .fail(&shutdown, 1, FailureReason::ScriptFailure)
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("job trace has been finished"));
    }

    #[tokio::test]
    async fn write_after_finish_is_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/v4/jobs/7");
                then.status(200);
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 7).unwrap();
        trace.complete(&CancellationToken::new()).await.unwrap();

        let err = trace.write(b"too late").unwrap_err();
        assert!(format!("{err}").contains("trace collecting is finished"));
    }

    #[tokio::test]
    async fn chunks_are_contiguous_across_flushes() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH)
                    .path("/api/v4/jobs/7/trace")
                    .header("Content-Range", "0-5")
                    .body("first\n");
                then.status(202);
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 7).unwrap();
        trace.write(b"first\n").unwrap();
        trace.appending_upload().await.unwrap();
        first.assert_async().await;

        let second = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH)
                    .path("/api/v4/jobs/7/trace")
                    .header("Content-Range", "6-12")
                    .body("second\n");
                then.status(202);
            })
            .await;
        let update = server
            .mock_async(|when, then| {
                when.method(PUT).path("/api/v4/jobs/7").json_body_partial(
                    json!({"output": {"bytesize": 13, "checksum": crc32_of(b"first\nsecond\n")}})
                        .to_string(),
                );
                then.status(200);
            })
            .await;

        trace.write(b"second\n").unwrap();
        trace.complete(&CancellationToken::new()).await.unwrap();
        second.assert_async().await;
        update.assert_async().await;
    }

    #[tokio::test]
    async fn failed_append_does_not_advance_offset() {
        let server = MockServer::start_async().await;
        let mut broken = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH).path("/api/v4/jobs/7/trace");
                then.status(500).body("oops");
            })
            .await;

        let trace = JobTrace::new(client_for(&server), "job-token".into(), 7).unwrap();
        trace.write(b"payload").unwrap();
        assert!(trace.appending_upload().await.is_err());
        assert_eq!(trace.upload_state.lock().await.uploaded_bytes, 0);
        broken.delete_async().await;

        // the retry re-sends the same range from the start
        let retry = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PATCH)
                    .path("/api/v4/jobs/7/trace")
                    .header("Content-Range", "0-6")
                    .body("payload");
                then.status(202);
            })
            .await;
        trace.appending_upload().await.unwrap();
        retry.assert_async().await;
        assert_eq!(trace.upload_state.lock().await.uploaded_bytes, 7);
    }
}
