//! The CLI-config mutator (§4.4): three format-specific modules, one
//! per CLI family, sharing the `enableProxy` / `disableProxy` /
//! `applySingleProvider` / `proxyStatus` /
//! `getDirectAppliedProviderID` template and the sidecar bookkeeping in
//! `sidecar.rs`.
//!
//! No teacher file does this — the teacher *is* the gateway other CLIs
//! point at, it never rewrites another CLI's own config file. Built
//! using the teacher's atomic-file-write idiom (`atomic_file.rs`) and
//! its `anyhow`/`tracing` conventions.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod sidecar;

use crate::provider::Platform;
use anyhow::{bail, Result};

/// Placeholder auth token the mutator writes into a CLI config when
/// enabling the relay — the CLI never needs a real upstream key of its
/// own, since the relay holds the real keys (§4.4).
pub const RELAY_PLACEHOLDER_TOKEN: &str = "code-switch-r";

/// Compare two base-URL-shaped strings the way `proxyStatus` does:
/// trimmed, case-insensitive, ignoring a trailing slash (§4.4
/// `proxyStatus`).
pub fn urls_match(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/').eq_ignore_ascii_case(b.trim().trim_end_matches('/'))
}

/// Enable the relay for `platform`'s CLI config, rooted at `home`
/// (normally the user's home directory; tests pass a temp dir).
/// Only `claude`, `codex`, and `gemini` have a canonical CLI config
/// layout (§4.4's table) — `custom:*` families have no CLI of their
/// own to mutate.
pub fn enable_proxy(platform: &Platform, home: &std::path::Path, relay_base_url: &str, proxy_state_dir: &std::path::Path) -> Result<()> {
    match platform {
        Platform::Claude => claude::enable_proxy(home, relay_base_url, proxy_state_dir),
        Platform::Codex => codex::enable_proxy(home, relay_base_url, proxy_state_dir),
        Platform::Gemini => gemini::enable_proxy(home, relay_base_url, proxy_state_dir),
        Platform::Custom(id) => bail!("custom:{id} has no CLI config layout to mutate"),
    }
}

pub fn disable_proxy(platform: &Platform, home: &std::path::Path, proxy_state_dir: &std::path::Path) -> Result<()> {
    match platform {
        Platform::Claude => claude::disable_proxy(home, proxy_state_dir),
        Platform::Codex => codex::disable_proxy(home, proxy_state_dir),
        Platform::Gemini => gemini::disable_proxy(home, proxy_state_dir),
        Platform::Custom(id) => bail!("custom:{id} has no CLI config layout to mutate"),
    }
}

pub fn proxy_status(platform: &Platform, home: &std::path::Path, relay_base_url: &str) -> Result<bool> {
    match platform {
        Platform::Claude => claude::proxy_status(home, relay_base_url),
        Platform::Codex => codex::proxy_status(home, relay_base_url),
        Platform::Gemini => gemini::proxy_status(home, relay_base_url),
        Platform::Custom(id) => bail!("custom:{id} has no CLI config layout to mutate"),
    }
}

pub fn apply_single_provider(
    platform: &Platform,
    home: &std::path::Path,
    relay_base_url: &str,
    provider: &crate::provider::Provider,
) -> Result<()> {
    if proxy_status(platform, home, relay_base_url)? {
        bail!("cannot apply a single provider while the proxy is enabled");
    }
    match platform {
        Platform::Claude => claude::apply_single_provider(home, provider),
        Platform::Codex => codex::apply_single_provider(home, provider),
        Platform::Gemini => gemini::apply_single_provider(home, provider),
        Platform::Custom(id) => bail!("custom:{id} has no CLI config layout to mutate"),
    }
}

/// `getDirectAppliedProviderID` (§4.4): only meaningful when
/// `proxy_status` is disabled; scans `providers` for the one whose
/// base URL (and, where applicable, key) matches what the CLI config
/// currently holds.
pub fn get_direct_applied_provider_id(
    platform: &Platform,
    home: &std::path::Path,
    providers: &[crate::provider::Provider],
) -> Result<Option<u64>> {
    match platform {
        Platform::Claude => claude::get_direct_applied_provider_id(home, providers),
        Platform::Codex => codex::get_direct_applied_provider_id(home, providers),
        Platform::Gemini => gemini::get_direct_applied_provider_id(home, providers),
        Platform::Custom(id) => bail!("custom:{id} has no CLI config layout to mutate"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_match_ignores_trailing_slash_and_case() {
        assert!(urls_match("http://127.0.0.1:18100", "HTTP://127.0.0.1:18100/"));
        assert!(!urls_match("http://127.0.0.1:18100", "http://127.0.0.1:18101"));
    }
}
