use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::UnixStream;
use tokio::process::{Child, ChildStdin, Command};

const API_SOCKET_WAIT: Duration = Duration::from_secs(2);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

/// Boot parameters of one microVM.
pub struct MachineConfig {
    pub kernel_image_path: String,
    pub kernel_args: String,
    pub rootfs_path: PathBuf,
    pub tap_device: String,
    pub tap_mac: String,
    pub mem_size_mib: u64,
    pub vcpu_count: u64,
}

/// A Firecracker VMM subprocess, driven through its API socket.
pub struct Machine {
    socket_path: PathBuf,
    child: Child,
    /// keeps the VMM's stdin open so it never observes EOF
    _stdin: ChildStdin,
}

impl Machine {
    /// Spawns the VMM, pushes the configuration and starts the instance.
    pub async fn boot(socket_path: &Path, config: &MachineConfig) -> Result<Self> {
        let binary = which::which("firecracker").context("firecracker binary not found in PATH")?;
        let mut child = Command::new(binary)
            .arg("--api-sock")
            .arg(socket_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning firecracker")?;
        let stdin = child.stdin.take().expect("stdin is piped");
        let mut machine = Self {
            socket_path: socket_path.to_path_buf(),
            child,
            _stdin: stdin,
        };
        machine.wait_for_api_socket().await?;
        machine.configure(config).await?;
        machine
            .api_put("/actions", json!({"action_type": "InstanceStart"}))
            .await
            .context("starting the instance")?;
        Ok(machine)
    }

    async fn wait_for_api_socket(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + API_SOCKET_WAIT;
        while !self.socket_path.exists() {
            if let Some(status) = self.child.try_wait().context("polling firecracker")? {
                bail!("firecracker exited early with {status}");
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("firecracker API socket did not appear within {API_SOCKET_WAIT:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    async fn configure(&self, config: &MachineConfig) -> Result<()> {
        self.api_put(
            "/machine-config",
            json!({
                "vcpu_count": config.vcpu_count,
                "mem_size_mib": config.mem_size_mib,
            }),
        )
        .await
        .context("setting machine config")?;
        self.api_put(
            "/boot-source",
            json!({
                "kernel_image_path": config.kernel_image_path,
                "boot_args": config.kernel_args,
            }),
        )
        .await
        .context("setting boot source")?;
        self.api_put(
            "/drives/1",
            json!({
                "drive_id": "1",
                "path_on_host": config.rootfs_path,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await
        .context("attaching root drive")?;
        self.api_put(
            "/network-interfaces/eth0",
            json!({
                "iface_id": "eth0",
                "guest_mac": config.tap_mac,
                "host_dev_name": config.tap_device,
            }),
        )
        .await
        .context("attaching network interface")?;
        Ok(())
    }

    /// Asks the guest to power off and waits for the VMM to exit.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.api_put("/actions", json!({"action_type": "SendCtrlAltDel"}))
            .await
            .context("sending Ctrl-Alt-Del")?;
        tokio::time::timeout(SHUTDOWN_WAIT, self.child.wait())
            .await
            .map_err(|_| anyhow!("VMM still running {SHUTDOWN_WAIT:?} after Ctrl-Alt-Del"))?
            .context("reaping firecracker")?;
        Ok(())
    }

    /// Kills the VMM process.
    pub async fn stop_vmm(&mut self) -> Result<()> {
        self.child.start_kill().context("killing firecracker")?;
        self.child.wait().await.context("reaping firecracker")?;
        Ok(())
    }

    async fn api_put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context("connecting to API socket")?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake on API socket")?;
        tokio::spawn(connection);

        let request = Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(hyper::header::HOST, "localhost")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .context("forging request")?;
        let response = sender
            .send_request(request)
            .await
            .context("calling firecracker API")?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            bail!(
                "firecracker API responds with code {status} on {path}: {}",
                String::from_utf8_lossy(&body)
            );
        }
        Ok(())
    }
}
