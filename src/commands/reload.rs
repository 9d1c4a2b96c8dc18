//! `code-switch-relay reload`: send SIGHUP to a running instance so it
//! reloads `Config` without restarting (§5, `signals.rs`).

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::SignalKind;

pub async fn execute(pid_file: Option<PathBuf>) -> Result<()> {
    let pid = crate::pid::PidFile::read(pid_file).context("no running instance found")?;
    info!(pid, "requesting configuration reload");

    #[cfg(unix)]
    {
        relay_gateway::signals::send_signal_to_pid(pid, SignalKind::hangup())
            .context("failed to send SIGHUP")?;
        println!("Reload signal sent to pid {pid}.");
        Ok(())
    }

    #[cfg(not(unix))]
    anyhow::bail!("reload is not supported on this platform")
}
