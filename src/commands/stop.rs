//! `code-switch-relay stop`: read the PID file, send SIGTERM, and
//! poll until the process exits or `timeout` elapses, optionally
//! escalating to SIGKILL with `--force`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::SignalKind;

pub async fn execute(pid_file: Option<PathBuf>, force: bool, timeout: u64) -> Result<()> {
    let pid = crate::pid::PidFile::read(pid_file).context("no running instance found")?;

    info!(pid, "stopping relay");
    println!("Stopping relay (pid {pid})...");
    #[cfg(unix)]
    {
        relay_gateway::signals::send_signal_to_pid(pid, SignalKind::terminate())
            .context("failed to send SIGTERM")?;

        let deadline = std::time::Instant::now() + Duration::from_secs(timeout);
        while std::time::Instant::now() < deadline {
            if !process_is_alive(pid) {
                println!("Relay stopped.");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if force {
            warn!(pid, "graceful shutdown timed out, sending SIGKILL");
            relay_gateway::signals::send_signal_to_pid(pid, SignalKind::from_raw(nix::libc::SIGKILL))?;
            println!("Relay force-killed.");
            Ok(())
        } else {
            anyhow::bail!("relay did not stop within {timeout}s; rerun with --force to kill it")
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (force, timeout);
        anyhow::bail!("stopping a running instance is not supported on this platform")
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
