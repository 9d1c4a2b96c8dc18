//! Command implementations for the CLI.
//!
//! - `start` / `stop` / `reload`: server lifecycle (daemonize, PID
//!   file, signal the running instance).
//! - `test`: validate the configuration file.
//! - `stats`: summarize `request_log` / `health_check_history`.
//! - `proxy`: the CLI surface onto the §4.4 CLI-config mutator.

pub mod proxy;
pub mod reload;
pub mod start;
pub mod stats;
pub mod stop;
pub mod test;
