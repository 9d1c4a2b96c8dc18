use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod daemon;
mod pid;

use relay_gateway::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    // On macOS, disable fork safety check before any library initialization.
    // Must happen before parsing CLI arguments or any other library calls.
    #[cfg(target_os = "macos")]
    unsafe {
        std::env::set_var("OBJC_DISABLE_INITIALIZE_FORK_SAFETY", "YES");
    }

    let args = cli::Cli::parse();
    let config_path = args.config.to_string_lossy().into_owned();

    // `start` initializes tracing itself, after the optional fork() in
    // daemon mode; every other command can init eagerly.
    let needs_early_tracing = !matches!(args.get_command(), cli::Commands::Start { .. });
    if needs_early_tracing {
        init_tracing();
    }

    match args.get_command() {
        cli::Commands::Start { daemon, pid_file } => {
            if !daemon {
                init_tracing();
            }
            commands::start::execute(&config_path, daemon, pid_file).await?;
        }
        cli::Commands::Stop { pid_file, force, timeout } => {
            commands::stop::execute(pid_file, force, timeout).await?;
        }
        cli::Commands::Reload { pid_file } => {
            commands::reload::execute(pid_file).await?;
        }
        cli::Commands::Test => {
            commands::test::execute(&config_path)?;
        }
        cli::Commands::Stats { hours, detailed } => {
            commands::stats::execute(&config_path, hours, detailed).await?;
        }
        cli::Commands::Version => {
            println!("code-switch-relay v{}", env!("CARGO_PKG_VERSION"));
        }
        cli::Commands::Proxy { action } => match action {
            cli::ProxyCommands::Connect { platform } => {
                commands::proxy::connect(&config_path, &platform)?;
            }
            cli::ProxyCommands::Disconnect { platform } => {
                commands::proxy::disconnect(&config_path, &platform)?;
            }
            cli::ProxyCommands::Status { platform } => {
                commands::proxy::status(&config_path, &platform)?;
            }
            cli::ProxyCommands::Apply { platform, provider_id } => {
                commands::proxy::apply(&config_path, &platform, provider_id)?;
            }
        },
    }

    Ok(())
}
