//! Flow metrics agent binary.
//!
//! ```bash
//! agent --node worker-1 --namespace observability
//! agent --node worker-1 --namespace observability --containers --log.level=debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use log::{info, warn};
use tokio::signal;

use flow_agent::{cgroupfs, App, AppConfig, JsonLinesSink};

/// Per-node agent emitting per-flow network metrics for local workloads.
#[derive(Parser, Debug)]
#[command(name = "agent", version, about, long_about = None)]
struct Args {
    /// The current kubernetes node name.
    #[arg(long, short = 'n', env = "NODE")]
    node: String,

    /// The current kubernetes namespace of the agent's pod.
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Monitor containers instead of pods.
    #[arg(long, env = "CONTAINERS")]
    containers: bool,

    /// Log level, e.g. 'debug', 'info', 'error'.
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Path to the packet object file; defaults to the embedded image.
    #[arg(long, env = "BPF_OBJECT")]
    bpf_object: Option<PathBuf>,

    /// Seconds between metric emissions.
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// cgroupv2 mount point.
    #[arg(long, default_value = cgroupfs::DEFAULT_CGROUP_ROOT)]
    cgroup_root: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .init();

    // The verifier accounts loaded programs and maps against the locked
    // memory limit; raise it before any load happens.
    raise_memlock_limit();

    cgroupfs::ensure(&args.cgroup_root).context("unable to prepare cgroupv2 mount")?;

    let client = Client::try_default()
        .await
        .context("unable to build kubernetes client")?;

    let app = App::start(
        client,
        Arc::new(JsonLinesSink),
        AppConfig {
            node: args.node,
            namespace: args.namespace,
            containers: args.containers,
            cgroup_root: args.cgroup_root,
            interval: Duration::from_secs(args.interval.max(1)),
            bpf_object: args.bpf_object,
        },
    )
    .await
    .context("unable to start agent")?;

    signal::ctrl_c()
        .await
        .context("unable to wait for shutdown signal")?;
    info!("received shutdown signal");

    if let Err(err) = app.close().await {
        warn!("shutdown: {err}");
    }

    Ok(())
}

fn raise_memlock_limit() {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if rc != 0 {
        warn!(
            "unable to raise RLIMIT_MEMLOCK: {}",
            std::io::Error::last_os_error()
        );
    }
}
