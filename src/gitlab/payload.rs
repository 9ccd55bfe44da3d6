use serde::{Deserialize, Serialize};

/// Abilities advertised to Gitlab on every API call.
/// Since Tart is a toy runner, this is a fixed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub shared: bool,
    pub multi_build_steps: bool,
    pub cancelable: bool,
    pub return_exit_code: bool,
    pub variables: bool,
    pub raw_variables: bool,
    pub artifacts: bool,
    pub upload_multiple_artifacts: bool,
    pub upload_raw_artifacts: bool,
    pub artifacts_exclude: bool,
    pub trace_reset: bool,
    pub trace_checksum: bool,
    pub trace_size: bool,
}

impl Features {
    pub fn supported() -> Self {
        Self {
            shared: true,
            multi_build_steps: true,
            cancelable: true,
            return_exit_code: true,
            variables: true,
            raw_variables: true,
            artifacts: true,
            upload_multiple_artifacts: true,
            upload_raw_artifacts: true,
            artifacts_exclude: true,
            trace_reset: true,
            trace_checksum: true,
            trace_size: true,
        }
    }
}

/// Runner metadata submitted with every request.
/// The registration variant leaves `executor` and `shell` unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    /// e.g. amd64
    pub architecture: String,
    /// e.g. shell
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// e.g. bash
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub features: Features,
    /// e.g. gitlab-runner
    pub name: String,
    /// e.g. linux
    pub platform: String,
    /// e.g. f98d0f26
    pub revision: String,
    /// e.g. 15.2.0~beta.60.gf98d0f26
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReq {
    /// Registration token
    pub token: String,
    /// Runner's description
    pub description: String,
    pub info: RunnerInfo,
    /// Whether the runner should be locked for current project
    pub locked: bool,
    pub maintenance_note: String,
    /// Whether the runner should ignore new jobs
    pub paused: bool,
    /// Whether the runner should handle untagged jobs
    pub run_untagged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResp {
    /// Runner's ID on Gitlab side
    pub id: i64,
    /// Runner's authentication token
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestJobReq {
    pub info: RunnerInfo,
    /// runner work queue cursor, for cache purpose
    pub last_update: String,
    /// Runner's authentication token
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub allow_git_fetch: bool,
    #[serde(default)]
    pub credentials: Vec<JobCredential>,
    #[serde(default)]
    pub git_info: GitInfo,
    #[serde(default)]
    pub job_info: JobInfo,
    #[serde(default)]
    pub steps: Vec<JobStep>,
    /// Job's authentication token
    pub token: String,
    #[serde(default)]
    pub variables: Vec<JobVariable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobCredential {
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "type")]
    pub credential_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default)]
    pub before_sha: String,
    #[serde(default)]
    pub depth: i64,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub ref_type: String,
    #[serde(default)]
    pub refspecs: Vec<String>,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_id: i64,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub stage: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStep {
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub script: Vec<String>,
    /// seconds
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub when: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobVariable {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub masked: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "script_failure")]
    ScriptFailure,
    #[serde(rename = "runner_system_failure")]
    RunnerSystemFailure,
    #[serde(rename = "archived_failure")]
    ArchivedFailure,
    #[serde(rename = "job_execution_timeout")]
    JobExecutionTimeout,
    #[serde(rename = "runner_unsupported")]
    RunnerUnsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobReq {
    pub checksum: String,
    pub exit_code: i32,
    pub failure_reason: FailureReason,
    pub info: RunnerInfo,
    pub output: TraceSummary,
    pub state: JobState,
    /// Job's authentication token
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    #[serde(rename = "bytesize")]
    pub byte_size: u64,
    pub checksum: String,
}
