pub mod atomic_file;
pub mod auth_forward;
pub mod availability;
pub mod blacklist;
pub mod cli_config;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod provider;
pub mod provider_store;
pub mod request_log;
pub mod retention;
pub mod signals;
pub mod sse;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging. Grounded on the teacher's `lib.rs`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
