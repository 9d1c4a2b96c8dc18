//! CLI surface (`clap` derive), grounded on the teacher's `cli.rs`.
//! The `start`/`stop`/`reload`/`test`/`stats` subcommands are kept; the
//! teacher's `oauth login/status/refresh/logout` group is replaced by a
//! `proxy connect/disconnect/status/apply` group that is the CLI's
//! only surface onto the §4.4 mutator (the desktop UI shell is out of
//! scope per §1, but something has to call `enableProxy`/
//! `disableProxy`/`applySingleProvider`/`proxyStatus`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "code-switch-relay", version, about = "Local LLM relay gateway")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the relay server (default)
    Start {
        /// Run in daemon mode (background process)
        #[arg(short, long)]
        daemon: bool,

        /// Path to PID file
        #[arg(short, long)]
        pid_file: Option<PathBuf>,
    },

    /// Stop a running relay instance
    Stop {
        #[arg(short, long)]
        pid_file: Option<PathBuf>,

        /// Force kill if graceful shutdown times out
        #[arg(short, long)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Reload configuration without restarting (sends SIGHUP)
    Reload {
        #[arg(short, long)]
        pid_file: Option<PathBuf>,
    },

    /// Validate the configuration file without starting the server
    Test,

    /// Display request/health statistics
    Stats {
        /// Number of hours to analyze
        #[arg(short = 'n', long, default_value = "24")]
        hours: u32,

        /// Show a breakdown by provider and model
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show version information
    Version,

    /// Inject/withdraw relay settings into a CLI's own config (§4.4)
    Proxy {
        #[command(subcommand)]
        action: ProxyCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProxyCommands {
    /// Point a CLI's config at the relay (`enableProxy`)
    Connect {
        /// Target CLI family: claude, codex, or gemini
        platform: String,
    },

    /// Surgically revert a CLI's config to its pre-injection state (`disableProxy`)
    Disconnect {
        platform: String,
    },

    /// Report whether a CLI's config currently points at the relay (`proxyStatus`)
    Status {
        platform: String,
    },

    /// Point a CLI directly at one provider, bypassing the relay (`applySingleProvider`)
    Apply {
        platform: String,
        /// Provider id within that platform's provider list
        provider_id: u64,
    },
}

impl Cli {
    /// The command to execute, defaulting to `Start` if none was given.
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start {
            daemon: false,
            pid_file: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_is_start() {
        let cli = Cli {
            config: PathBuf::from("config.toml"),
            command: None,
        };
        match cli.get_command() {
            Commands::Start { daemon, pid_file } => {
                assert!(!daemon);
                assert!(pid_file.is_none());
            }
            _ => panic!("expected Start command"),
        }
    }

    #[test]
    fn parses_start_with_daemon_flag() {
        let args = vec!["code-switch-relay", "start", "--daemon"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.get_command() {
            Commands::Start { daemon, .. } => assert!(daemon),
            _ => panic!("expected Start command"),
        }
    }

    #[test]
    fn parses_stop_with_timeout() {
        let args = vec!["code-switch-relay", "stop", "--timeout", "60"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.get_command() {
            Commands::Stop { timeout, .. } => assert_eq!(timeout, 60),
            _ => panic!("expected Stop command"),
        }
    }

    #[test]
    fn parses_proxy_connect() {
        let args = vec!["code-switch-relay", "proxy", "connect", "claude"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.get_command() {
            Commands::Proxy {
                action: ProxyCommands::Connect { platform },
            } => assert_eq!(platform, "claude"),
            _ => panic!("expected Proxy Connect command"),
        }
    }

    #[test]
    fn parses_proxy_apply_with_provider_id() {
        let args = vec!["code-switch-relay", "proxy", "apply", "codex", "42"];
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.get_command() {
            Commands::Proxy {
                action: ProxyCommands::Apply { platform, provider_id },
            } => {
                assert_eq!(platform, "codex");
                assert_eq!(provider_id, 42);
            }
            _ => panic!("expected Proxy Apply command"),
        }
    }
}
