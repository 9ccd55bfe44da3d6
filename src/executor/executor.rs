use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use crossterm::style::{Attribute, Color, SetForegroundColor};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use ssh2::{ExtendedData, Session};

use crate::config;
use crate::executor::{Build, Machine, MachineConfig};
use crate::gitlab::{FailureReason, JobTrace};

const SSH_USER: &str = "root";
const SSH_PORT: u16 = 22;
const SSH_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const SSH_READY_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_RETRY_PERIOD: Duration = Duration::from_millis(500);
const VM_MEM_SIZE_MIB: u64 = 1024;
const VM_VCPU_COUNT: u64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ExecutorConfig {
    pub kernel_path: String,
    #[serde(rename = "RootFSPath")]
    pub root_fs_path: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "GatewayIP")]
    pub gateway_ip: String,
    pub netmask: String,
    pub tap_device: String,
    pub tap_mac: String,
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kernel_path.is_empty() {
            bail!("kernel path is required");
        }
        if self.root_fs_path.is_empty() {
            bail!("rootFS path is required");
        }
        if self.ip.is_empty() {
            bail!("ip is required");
        }
        if self.gateway_ip.is_empty() {
            bail!("gatewayIP is required");
        }
        if self.netmask.is_empty() {
            bail!("netmask is required");
        }
        if self.tap_device.is_empty() {
            bail!("tap device is required");
        }
        if self.tap_mac.is_empty() {
            bail!("tap MAC is required");
        }
        Ok(())
    }
}

/// Outcome of the build phase, mapped onto the protocol's failure taxonomy.
#[derive(Debug, Default)]
pub struct BuildResult {
    pub err: Option<anyhow::Error>,
    pub exit_code: i32,
    pub failure_reason: FailureReason,
}

struct ScriptOutcome {
    exit_status: i32,
    exit_signal: Option<String>,
}

/// Runs one job inside a freshly provisioned Firecracker microVM over SSH.
pub struct Executor {
    config: ExecutorConfig,
    build: Build,
    trace: Arc<JobTrace>,
    /// fresh writable copy of the configured rootfs image
    temp_rootfs: PathBuf,
    socket_path: Option<PathBuf>,
    machine: Option<Machine>,
    ssh: Option<Session>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("build", &self.build)
            .field("temp_rootfs", &self.temp_rootfs)
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Validates the config and clones the rootfs image into a writable copy
    /// for this job.
    pub fn new(config: ExecutorConfig, build: Build, trace: Arc<JobTrace>) -> Result<Self> {
        config.validate().context("validating config")?;

        let mut origin =
            std::fs::File::open(&config.root_fs_path).context("open original rootFS file")?;
        let temp = tempfile::Builder::new()
            .prefix("tart-rootfs-")
            .suffix(".ext4")
            .tempfile()
            .context("creating temp rootFS")?;
        let (mut temp_rootfs, temp_path) = temp
            .keep()
            .map_err(|e| anyhow!("keeping temp rootFS: {e}"))?;
        if let Err(err) = std::io::copy(&mut origin, &mut temp_rootfs)
            .and_then(|_| temp_rootfs.sync_all())
        {
            std::fs::remove_file(&temp_path).ok();
            return Err(anyhow::Error::new(err).context("clone rootFS"));
        }

        Ok(Self {
            config,
            build,
            trace,
            temp_rootfs: temp_path,
            socket_path: None,
            machine: None,
            ssh: None,
        })
    }

    /// Boots the microVM, waits for SSH and clones the repository inside it.
    pub async fn prepare(&mut self) -> Result<()> {
        let result = self.prepare_inner().await;
        if let Err(err) = &result {
            self.banner(
                Color::Red,
                &format!("Build failed during preparing: {err:#}"),
            );
        }
        result
    }

    async fn prepare_inner(&mut self) -> Result<()> {
        self.banner(
            Color::Yellow,
            &format!("Running with {} on {}\n", config::full_name(), self.config.ip),
        );
        self.banner(Color::Blue, "Spinning up microVM...");

        let socket_path = unique_socket_path();
        let machine_config = MachineConfig {
            kernel_image_path: self.config.kernel_path.clone(),
            kernel_args: self.kernel_args(),
            rootfs_path: self.temp_rootfs.clone(),
            tap_device: self.config.tap_device.clone(),
            tap_mac: self.config.tap_mac.clone(),
            mem_size_mib: VM_MEM_SIZE_MIB,
            vcpu_count: VM_VCPU_COUNT,
        };
        self.banner(Color::Green, "MicroVM is initialized, starting...");
        self.socket_path = Some(socket_path.clone());
        let machine = Machine::boot(&socket_path, &machine_config)
            .await
            .context("starting the VM")?;
        self.machine = Some(machine);

        self.banner(Color::Green, "MicroVM started, connecting...");
        let session = self
            .wait_for_ssh()
            .await
            .context("establish SSH connection to VM")?;
        self.ssh = Some(session);

        self.banner(
            Color::Green,
            "MicroVM connected, cloning repo and checking out...",
        );
        let script = self.build.prepare_script();
        let outcome = self
            .run_script(script, self.build.timeout())
            .await
            .context("running prepare script over SSH")?;
        if outcome.exit_status != 0 {
            bail!("prepare script exited with code {}", outcome.exit_status);
        }
        if let Some(signal) = outcome.exit_signal {
            bail!("prepare script terminated by signal {signal}");
        }

        self.banner(Color::Green, "Repo cloned and checked out.");
        Ok(())
    }

    /// Runs the build script and maps the outcome onto the job's failure
    /// taxonomy.
    pub async fn build(&mut self) -> BuildResult {
        let result = self.build_inner().await;
        if let Some(err) = &result.err {
            self.banner(Color::Red, &format!("Build failed: {err:#}"));
        }
        result
    }

    async fn build_inner(&mut self) -> BuildResult {
        self.banner(Color::Blue, "build phase starting...");

        let script = match self.build.build_script() {
            Ok(script) => script,
            Err(err) => {
                return BuildResult {
                    err: Some(err.context("forging build script")),
                    exit_code: 0,
                    failure_reason: FailureReason::RunnerSystemFailure,
                }
            }
        };
        match self.run_script(script, self.build.timeout()).await {
            Ok(outcome) if outcome.exit_status != 0 => BuildResult {
                err: Some(anyhow!(
                    "build script exited with code {}",
                    outcome.exit_status
                )),
                exit_code: outcome.exit_status,
                failure_reason: FailureReason::ScriptFailure,
            },
            Ok(outcome) => match outcome.exit_signal {
                // the remote never delivered an exit status
                Some(signal) => BuildResult {
                    err: Some(anyhow!("build script terminated by signal {signal}")),
                    exit_code: 0,
                    failure_reason: FailureReason::ScriptFailure,
                },
                None => {
                    self.banner(Color::Green, "Job succeeded");
                    BuildResult::default()
                }
            },
            Err(err) => BuildResult {
                err: Some(err.context("running build script over SSH")),
                exit_code: 0,
                failure_reason: FailureReason::RunnerSystemFailure,
            },
        }
    }

    /// Releases SSH, VM, API socket and the rootfs copy. Each step runs
    /// regardless of the outcome of the others.
    pub async fn close(&mut self) {
        self.ssh = None;

        if let Some(mut machine) = self.machine.take() {
            if let Err(err) = machine.shutdown().await {
                warn!("graceful VM shutdown failed, stopping VMM: {err:#}");
                if let Err(err) = machine.stop_vmm().await {
                    warn!("stopping VMM: {err:#}");
                }
            }
        }

        if let Some(socket_path) = self.socket_path.take() {
            std::fs::remove_file(socket_path).ok();
        }
        std::fs::remove_file(&self.temp_rootfs).ok();
    }

    fn kernel_args(&self) -> String {
        format!(
            "ro console=ttyS0 noapic reboot=k panic=1 pci=off nomodules random.trust_cpu=on \
             ip={}::{}:{}::eth0:off",
            self.config.ip, self.config.gateway_ip, self.config.netmask
        )
    }

    async fn wait_for_ssh(&self) -> Result<Session> {
        let address: SocketAddr = format!("{}:{}", self.config.ip, SSH_PORT)
            .parse()
            .context("parsing VM SSH address")?;
        let private_key = crate::rootfs::private_key()?;
        let deadline = tokio::time::Instant::now() + SSH_READY_TIMEOUT;
        loop {
            let attempt = tokio::task::spawn_blocking(move || dial_ssh(address, private_key))
                .await
                .context("SSH dial task died")?;
            match attempt {
                Ok(session) => return Ok(session),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(
                            err.context(format!("SSH not ready within {SSH_READY_TIMEOUT:?}"))
                        );
                    }
                    debug!("SSH not ready yet: {err:#}");
                }
            }
            tokio::time::sleep(SSH_RETRY_PERIOD).await;
        }
    }

    async fn run_script(&self, script: String, timeout: Duration) -> Result<ScriptOutcome> {
        let session = self
            .ssh
            .clone()
            .ok_or_else(|| anyhow!("SSH session is not established"))?;
        let trace = self.trace.clone();
        run_until_timeout(timeout, move || exec_script(&session, &trace, &script)).await
    }

    fn banner(&self, color: Color, text: &str) {
        let line = format!("{}{}{}\n", SetForegroundColor(color), text, Attribute::Reset);
        if let Err(err) = self.trace.write(line.as_bytes()) {
            warn!("writing banner to trace: {err:#}");
        }
    }
}

/// Runs a blocking function on a helper thread, racing it against a one-shot
/// timer. On timeout the helper keeps running to completion and its result is
/// dropped.
pub async fn run_until_timeout<T, F>(timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.context("script task died")?,
        Err(_) => bail!("execution timed out after {timeout:?}"),
    }
}

fn unique_socket_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    PathBuf::from(format!("/tmp/tart-firecracker-{nanos}.socket"))
}

fn dial_ssh(address: SocketAddr, private_key: &str) -> Result<Session> {
    let tcp = TcpStream::connect_timeout(&address, SSH_ATTEMPT_TIMEOUT).context("dialing ssh")?;
    let mut session = Session::new().context("init ssh session")?;
    session.set_timeout(SSH_ATTEMPT_TIMEOUT.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session.handshake().context("ssh handshake")?;
    session
        .userauth_pubkey_memory(SSH_USER, None, private_key, None)
        .context("ssh public key auth")?;
    // user scripts may legitimately block for minutes
    session.set_timeout(0);
    Ok(session)
}

/// Runs a script in a fresh SSH channel, streaming its merged stdout/stderr
/// into the trace, and reports how it exited.
fn exec_script(session: &Session, trace: &JobTrace, script: &str) -> Result<ScriptOutcome> {
    let mut channel = session.channel_session().context("init ssh session")?;
    channel
        .handle_extended_data(ExtendedData::Merge)
        .context("merging stderr into stdout")?;
    channel.exec(script).context("sending script over SSH")?;

    let mut buf = [0u8; 8192];
    loop {
        let n = channel.read(&mut buf).context("reading script output")?;
        if n == 0 {
            break;
        }
        // a finished trace drops further output without failing the session
        let _ = trace.write(&buf[..n]);
    }

    channel.wait_close().context("waiting for script to finish")?;
    let exit_status = channel.exit_status().context("reading exit status")?;
    let exit_signal = channel.exit_signal().ok().and_then(|s| s.exit_signal);
    Ok(ScriptOutcome {
        exit_status,
        exit_signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitlab::{Features, GitlabClient, Job};
    use std::io::Write;

    fn valid_config(root_fs_path: &str) -> ExecutorConfig {
        ExecutorConfig {
            kernel_path: "vmlinux-5.10.bin".into(),
            root_fs_path: root_fs_path.into(),
            ip: "172.18.0.2".into(),
            gateway_ip: "172.18.0.1".into(),
            netmask: "255.255.255.0".into(),
            tap_device: "tap0".into(),
            tap_mac: "AA:FC:42:42:66:88".into(),
        }
    }

    #[test]
    fn config_rejects_empty_fields() {
        let mut config = valid_config("jammy.rootfs.ext4");
        assert!(config.validate().is_ok());
        config.ip = String::new();
        assert_eq!(format!("{}", config.validate().unwrap_err()), "ip is required");

        let mut config = valid_config("");
        assert_eq!(
            format!("{}", config.validate().unwrap_err()),
            "rootFS path is required"
        );
        config.root_fs_path = "x.ext4".into();
        config.tap_mac = String::new();
        assert_eq!(
            format!("{}", config.validate().unwrap_err()),
            "tap MAC is required"
        );
    }

    #[tokio::test]
    async fn kernel_args_wire_up_the_static_network() {
        let trace_config = valid_config("jammy.rootfs.ext4");
        let executor = Executor {
            config: trace_config,
            build: Build::new(Job::default(), "ci-repo").unwrap(),
            trace: dummy_trace(),
            temp_rootfs: PathBuf::new(),
            socket_path: None,
            machine: None,
            ssh: None,
        };
        assert_eq!(
            executor.kernel_args(),
            "ro console=ttyS0 noapic reboot=k panic=1 pci=off nomodules random.trust_cpu=on \
             ip=172.18.0.2::172.18.0.1:255.255.255.0::eth0:off"
        );
    }

    fn dummy_trace() -> Arc<JobTrace> {
        let client =
            Arc::new(GitlabClient::new("http://127.0.0.1:1", Features::supported()).unwrap());
        JobTrace::new(client, "job-token".into(), 1).unwrap()
    }

    #[test]
    fn socket_paths_are_unique() {
        let a = unique_socket_path();
        std::thread::sleep(Duration::from_millis(2));
        let b = unique_socket_path();
        assert_ne!(a, b);
        assert!(a.to_string_lossy().starts_with("/tmp/tart-firecracker-"));
        assert!(a.to_string_lossy().ends_with(".socket"));
    }

    #[tokio::test]
    async fn run_until_timeout_returns_the_result_in_time() {
        let value = run_until_timeout(Duration::from_secs(1), || Ok(42)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn run_until_timeout_cuts_off_slow_functions() {
        let err = run_until_timeout(Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(format!("{err}").contains("execution timed out after"));
    }

    #[tokio::test]
    async fn run_until_timeout_propagates_errors() {
        let err = run_until_timeout(Duration::from_secs(1), || {
            Err::<(), _>(anyhow!("inner failure"))
        })
        .await
        .unwrap_err();
        assert!(format!("{err}").contains("inner failure"));
    }

    #[tokio::test]
    async fn new_clones_the_rootfs_and_close_removes_it() {
        let mut origin = tempfile::NamedTempFile::new().unwrap();
        origin.write_all(b"pretend this is ext4").unwrap();
        let config = valid_config(origin.path().to_str().unwrap());

        let build = Build::new(Job::default(), "ci-repo").unwrap();
        let mut executor = Executor::new(config, build, dummy_trace()).unwrap();

        let cloned = std::fs::read(&executor.temp_rootfs).unwrap();
        assert_eq!(cloned, b"pretend this is ext4");
        assert_ne!(executor.temp_rootfs, origin.path());

        let temp_rootfs = executor.temp_rootfs.clone();
        executor.close().await;
        assert!(!temp_rootfs.exists());
        // the original image is untouched
        assert!(origin.path().exists());
    }

    #[tokio::test]
    async fn new_fails_on_missing_rootfs_image() {
        let config = valid_config("/definitely/not/here.ext4");
        let build = Build::new(Job::default(), "ci-repo").unwrap();
        let err = Executor::new(config, build, dummy_trace()).unwrap_err();
        assert!(format!("{err:#}").contains("open original rootFS file"));
    }
}
