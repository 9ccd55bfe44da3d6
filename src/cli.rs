use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::executor::ExecutorConfig;
use crate::gitlab::{Cancelled, Features, GitlabClient};
use crate::Runner;

#[derive(Parser, Debug)]
#[command(version, about = "An educational purpose, unofficial Gitlab Runner.", long_about = None)]
struct Cli {
    /// Path to the config file
    #[clap(long, global = true, default_value = "tart.toml")]
    config: PathBuf,
    #[clap(subcommand)]
    command: CliCommands,
}

#[derive(Subcommand, Debug)]
enum CliCommands {
    /// Register self to Gitlab and print TOML config into stdout
    Register {
        /// Gitlab URL, only scheme + host, e.g. https://gitlab.example.com
        #[clap(long)]
        endpoint: String,
        /// Gitlab Runner registration token
        #[clap(long)]
        token: String,
        /// Description to this runner, submitted to Gitlab
        #[clap(long, default_value = "")]
        description: String,
    },
    /// Listen and run CI jobs
    Run,
    /// Listen, wait and run a single CI job, then exit
    Single,
    /// Print version and exit
    Version,
}

pub async fn run_cli(args: Vec<String>) -> Result<()> {
    let cli = Cli::parse_from(args.iter());
    match cli.command {
        CliCommands::Register {
            endpoint,
            token,
            description,
        } => register(&endpoint, &token, &description).await,
        CliCommands::Run => run(&cli.config, false).await,
        CliCommands::Single => run(&cli.config, true).await,
        CliCommands::Version => {
            println!("{}", config::full_name());
            Ok(())
        }
    }
}

async fn register(endpoint: &str, token: &str, description: &str) -> Result<()> {
    let client = GitlabClient::new(endpoint, Features::supported())
        .context("initializing Gitlab client")?;
    let access_token = client
        .register(token, description)
        .await
        .context("registering tart via Gitlab API")?;

    let config = Config {
        gitlab_endpoint: endpoint.to_string(),
        access_token,
        executor: ExecutorConfig {
            kernel_path: "vmlinux-5.10.bin".into(),
            root_fs_path: "jammy.rootfs.ext4".into(),
            ip: "172.18.0.2".into(),
            gateway_ip: "172.18.0.1".into(),
            netmask: "255.255.255.0".into(),
            tap_device: "tap0".into(),
            tap_mac: "AA:FC:42:42:66:88".into(),
        },
    };
    print!("{}", toml::to_string(&config).context("encoding config toml")?);
    Ok(())
}

async fn run(config_path: &Path, single: bool) -> Result<()> {
    crate::rootfs::private_key().context("parsing embedded SSH key")?;
    let config = Config::read(config_path).context("loading config")?;
    let client = Arc::new(
        GitlabClient::new(&config.gitlab_endpoint, Features::supported())
            .context("initializing Gitlab client")?,
    );
    let runner = Runner::new(config.access_token.clone(), client, config.executor.clone());
    let shutdown = shutdown_token()?;

    info!("start to polling new job...");
    loop {
        match poll_and_run(&runner, &shutdown).await {
            Ok(()) if single => return Ok(()),
            Ok(()) => continue,
            Err(err) if err.root_cause().downcast_ref::<Cancelled>().is_some() => {
                info!("received signal, exit.");
                return Ok(());
            }
            Err(err) if single => return Err(err),
            Err(err) => info!("error when polling and running job: {err:#}"),
        }
    }
}

async fn poll_and_run(runner: &Runner, shutdown: &CancellationToken) -> Result<()> {
    let job = runner
        .poll_new_job(shutdown)
        .await
        .context("polling new job")?;
    runner
        .run_job(shutdown, job)
        .await
        .context("running job")?;
    Ok(())
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("binding SIGTERM handler")?;
    let handler_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        handler_token.cancel();
    });
    Ok(token)
}
