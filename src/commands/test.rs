use anyhow::Result;
use relay_gateway::config;
use tracing::info;

/// Validate the configuration file without starting the server
/// (`code-switch-relay test`).
pub fn execute(config_path: &str) -> Result<()> {
    println!("Testing configuration at {config_path}...");
    info!(config_path, "loading and validating configuration");

    let cfg = config::load_config(config_path)?;

    println!("Configuration is valid\n");
    println!("Summary:");
    println!("  Server:                {}:{}", cfg.server.host, cfg.server.port);
    println!("  Log level:             {}", cfg.server.log_level);
    println!(
        "  Dispatcher mode:       {}",
        if cfg.blacklist.fixed_mode { "retry-until-blacklisted" } else { "failover" }
    );
    println!("  Blacklist threshold:   {}", cfg.blacklist.failure_threshold);
    println!("  Blacklist duration:    {} min", cfg.blacklist.duration_minutes);
    println!("  Availability interval: {}s", cfg.availability.poll_interval_seconds);
    println!("  Data directory:        {}", cfg.data_dir.root.display());
    println!(
        "  HTTP proxy:            {}",
        if cfg.http_proxy.enabled { cfg.http_proxy.address.as_str() } else { "disabled" }
    );

    info!("configuration test successful");
    Ok(())
}
