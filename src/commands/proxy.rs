//! `code-switch-relay proxy`: the CLI surface onto the §4.4 mutator.
//! The desktop UI shell normally drives `enableProxy`/`disableProxy`/
//! `applySingleProvider`/`proxyStatus`, but that shell is out of scope
//! (§1) — this subcommand group is the one caller this workspace
//! provides, in the same "thin CLI wrapper over a library operation"
//! shape as the teacher's `oauth login/status/refresh/logout` group.

use anyhow::{bail, Context, Result};
use relay_gateway::cli_config;
use relay_gateway::config;
use relay_gateway::provider::Platform;
use relay_gateway::provider_store::ProviderStore;
use std::str::FromStr;

fn home_dir() -> Result<std::path::PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

fn relay_base_url(cfg: &config::Config) -> String {
    format!("http://{}:{}", cfg.server.host, cfg.server.port)
}

pub fn connect(config_path: &str, platform: &str) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let platform = Platform::from_str(platform).expect("Platform::from_str is infallible");
    let home = home_dir()?;
    cli_config::enable_proxy(&platform, &home, &relay_base_url(&cfg), &cfg.data_dir.proxy_state_dir())
        .with_context(|| format!("failed to enable the relay for {platform}"))?;
    println!("{platform} now points at the relay ({}).", relay_base_url(&cfg));
    Ok(())
}

pub fn disconnect(config_path: &str, platform: &str) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let platform = Platform::from_str(platform).expect("Platform::from_str is infallible");
    let home = home_dir()?;
    cli_config::disable_proxy(&platform, &home, &cfg.data_dir.proxy_state_dir())
        .with_context(|| format!("failed to disable the relay for {platform}"))?;
    println!("{platform} reverted to its pre-relay configuration.");
    Ok(())
}

pub fn status(config_path: &str, platform: &str) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let platform = Platform::from_str(platform).expect("Platform::from_str is infallible");
    let home = home_dir()?;
    let relay_url = relay_base_url(&cfg);

    let enabled = cli_config::proxy_status(&platform, &home, &relay_url)?;
    if enabled {
        println!("{platform}: relay ENABLED ({relay_url})");
        return Ok(());
    }

    let store = ProviderStore::open(cfg.data_dir.providers_dir());
    let providers = store.load(&platform);
    match cli_config::get_direct_applied_provider_id(&platform, &home, &providers)? {
        Some(id) => println!("{platform}: relay disabled, directly applied provider id {id}"),
        None => println!("{platform}: relay disabled, direct-applied provider unknown"),
    }
    Ok(())
}

pub fn apply(config_path: &str, platform: &str, provider_id: u64) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let platform = Platform::from_str(platform).expect("Platform::from_str is infallible");
    let home = home_dir()?;

    let store = ProviderStore::open(cfg.data_dir.providers_dir());
    let providers = store.load(&platform);
    let provider = providers
        .iter()
        .find(|p| p.id == provider_id)
        .with_context(|| format!("no provider with id {provider_id} for {platform}"))?;

    if cli_config::proxy_status(&platform, &home, &relay_base_url(&cfg))? {
        bail!("cannot apply a single provider while the relay is enabled for {platform}; disconnect first");
    }

    cli_config::apply_single_provider(&platform, &home, &relay_base_url(&cfg), provider)?;
    println!("{platform} now points directly at provider '{}' (id {provider_id}).", provider.name);
    Ok(())
}
