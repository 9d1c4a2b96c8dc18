//! Claude CLI config mutator (§4.4's table, claude row):
//! `~/.claude/settings.json`, keys `env.ANTHROPIC_BASE_URL` and
//! `env.ANTHROPIC_AUTH_TOKEN`.

use super::sidecar::{self, FieldSnapshot, ProxyState};
use super::{urls_match, RELAY_PLACEHOLDER_TOKEN};
use crate::provider::Provider;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;

const PLATFORM_KEY: &str = "claude";
const BASE_URL_FIELD: &str = "env.ANTHROPIC_BASE_URL";
const AUTH_TOKEN_FIELD: &str = "env.ANTHROPIC_AUTH_TOKEN";

fn config_path(home: &Path) -> std::path::PathBuf {
    home.join(".claude").join("settings.json")
}

fn read_config(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {:?} as JSON", path))
}

fn env_object(config: &Value) -> Option<&serde_json::Map<String, Value>> {
    config.get("env").and_then(Value::as_object)
}

pub fn enable_proxy(home: &Path, relay_base_url: &str, proxy_state_dir: &Path) -> Result<()> {
    let path = config_path(home);

    if !sidecar::exists(proxy_state_dir, PLATFORM_KEY) {
        let config_existed = path.exists();
        let config = read_config(&path)?;
        let parent_existed = env_object(&config).is_some();
        let before_base_url = config.pointer("/env/ANTHROPIC_BASE_URL").cloned();
        let before_auth_token = config.pointer("/env/ANTHROPIC_AUTH_TOKEN").cloned();

        if config_existed {
            crate::atomic_file::backup(&path)?;
        }

        sidecar::save(
            proxy_state_dir,
            PLATFORM_KEY,
            &ProxyState {
                version: 1,
                config_path: path.clone(),
                config_existed,
                parent_existed,
                fields: vec![
                    FieldSnapshot {
                        path: BASE_URL_FIELD.into(),
                        before: before_base_url,
                    },
                    FieldSnapshot {
                        path: AUTH_TOKEN_FIELD.into(),
                        before: before_auth_token,
                    },
                ],
            },
        )?;
    }

    let mut config = read_config(&path)?;
    let obj = config.as_object_mut().context("settings.json root is not an object")?;
    let env = obj
        .entry("env")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .context("env is not an object")?;
    env.insert(
        "ANTHROPIC_BASE_URL".into(),
        Value::String(relay_base_url.to_string()),
    );
    env.insert(
        "ANTHROPIC_AUTH_TOKEN".into(),
        Value::String(RELAY_PLACEHOLDER_TOKEN.to_string()),
    );

    crate::atomic_file::write_json(&path, &config)
}

pub fn disable_proxy(home: &Path, proxy_state_dir: &Path) -> Result<()> {
    let path = config_path(home);
    let mut config = read_config(&path)?;

    match sidecar::load(proxy_state_dir, PLATFORM_KEY) {
        Some(state) => {
            restore_field(&mut config, "ANTHROPIC_BASE_URL", state.before(BASE_URL_FIELD));
            restore_field(&mut config, "ANTHROPIC_AUTH_TOKEN", state.before(AUTH_TOKEN_FIELD));

            if !state.parent_existed {
                if let Some(env) = env_object(&config) {
                    if env.is_empty() {
                        config.as_object_mut().unwrap().remove("env");
                    }
                }
            }
        }
        None => {
            // Soft fallback (§9): delete-if-still-equal-to-relay-value,
            // never touch a user-customised value.
            if let Some(env) = config.get("env").and_then(Value::as_object).cloned() {
                let relay_url_present = env
                    .get("ANTHROPIC_AUTH_TOKEN")
                    .and_then(Value::as_str)
                    .map(|v| v == super::RELAY_PLACEHOLDER_TOKEN)
                    .unwrap_or(false);
                if relay_url_present {
                    let obj = config.as_object_mut().unwrap();
                    if let Some(env) = obj.get_mut("env").and_then(Value::as_object_mut) {
                        env.remove("ANTHROPIC_BASE_URL");
                        env.remove("ANTHROPIC_AUTH_TOKEN");
                    }
                }
            }
        }
    }

    crate::atomic_file::write_json(&path, &config)?;
    sidecar::delete(proxy_state_dir, PLATFORM_KEY)
}

fn restore_field(config: &mut Value, key: &str, before: Option<&Value>) {
    let obj = config.as_object_mut().expect("settings.json root is an object");
    let env = obj.entry("env").or_insert_with(|| json!({}));
    let env_obj = env.as_object_mut().expect("env is an object");
    match before {
        Some(value) => {
            env_obj.insert(key.to_string(), value.clone());
        }
        None => {
            env_obj.remove(key);
        }
    }
}

pub fn proxy_status(home: &Path, relay_base_url: &str) -> Result<bool> {
    let config = read_config(&config_path(home))?;
    let current = config
        .pointer("/env/ANTHROPIC_BASE_URL")
        .and_then(Value::as_str)
        .unwrap_or("");
    Ok(urls_match(current, relay_base_url))
}

pub fn apply_single_provider(home: &Path, provider: &Provider) -> Result<()> {
    let path = config_path(home);
    if path.exists() {
        crate::atomic_file::backup(&path)?;
    }
    let mut config = read_config(&path)?;
    let obj = config.as_object_mut().context("settings.json root is not an object")?;
    let env = obj
        .entry("env")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .context("env is not an object")?;
    env.insert(
        "ANTHROPIC_BASE_URL".into(),
        Value::String(provider.base_url.clone()),
    );
    env.insert(
        "ANTHROPIC_AUTH_TOKEN".into(),
        Value::String(provider.api_key.clone()),
    );
    crate::atomic_file::write_json(&path, &config)
}

pub fn get_direct_applied_provider_id(home: &Path, providers: &[Provider]) -> Result<Option<u64>> {
    let config = read_config(&config_path(home))?;
    let current_url = config
        .pointer("/env/ANTHROPIC_BASE_URL")
        .and_then(Value::as_str)
        .unwrap_or("");
    let current_key = config
        .pointer("/env/ANTHROPIC_AUTH_TOKEN")
        .and_then(Value::as_str)
        .unwrap_or("");

    Ok(providers
        .iter()
        .find(|p| urls_match(&p.base_url, current_url) && p.api_key == current_key)
        .map(|p| p.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn test_provider() -> Provider {
        Provider {
            id: 7,
            name: "p".into(),
            base_url: "https://api.anthropic.com".into(),
            api_key: "sk-ant-real".into(),
            endpoint_override: None,
            enabled: true,
            priority: 1,
            supported_models: vec![],
            model_mapping: HashMap::new(),
            connectivity_auth_type: Default::default(),
            availability_monitor_enabled: false,
            connectivity_auto_blacklist: false,
            availability: Default::default(),
        }
    }

    #[test]
    fn enable_then_disable_restores_an_absent_env_object() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        let config = read_config(&config_path(home.path())).unwrap();
        assert_eq!(config["env"]["ANTHROPIC_BASE_URL"], "http://127.0.0.1:18100");

        disable_proxy(home.path(), state_dir.path()).unwrap();
        let config = read_config(&config_path(home.path())).unwrap();
        assert!(config.get("env").is_none());
        assert!(!sidecar::exists(state_dir.path(), PLATFORM_KEY));
    }

    #[test]
    fn disable_preserves_an_unrelated_key_edited_while_enabled() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();

        let mut config = read_config(&config_path(home.path())).unwrap();
        config["someUserToggle"] = Value::Bool(true);
        crate::atomic_file::write_json(&config_path(home.path()), &config).unwrap();

        disable_proxy(home.path(), state_dir.path()).unwrap();
        let config = read_config(&config_path(home.path())).unwrap();
        assert_eq!(config["someUserToggle"], true);
    }

    #[test]
    fn disable_restores_a_pre_existing_value() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".claude")).unwrap();
        std::fs::write(
            config_path(home.path()),
            serde_json::to_vec(&json!({"env": {"ANTHROPIC_BASE_URL": "https://api.anthropic.com"}}))
                .unwrap(),
        )
        .unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        disable_proxy(home.path(), state_dir.path()).unwrap();

        let config = read_config(&config_path(home.path())).unwrap();
        assert_eq!(config["env"]["ANTHROPIC_BASE_URL"], "https://api.anthropic.com");
        assert!(config.get("env").unwrap().get("ANTHROPIC_AUTH_TOKEN").is_none());
    }

    #[test]
    fn enable_is_idempotent_and_does_not_recreate_the_sidecar() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        let first = sidecar::load(state_dir.path(), PLATFORM_KEY).unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        let second = sidecar::load(state_dir.path(), PLATFORM_KEY).unwrap();
        assert_eq!(first.fields, second.fields);
    }

    #[test]
    fn proxy_status_matches_trimmed_case_insensitive_url() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        assert!(proxy_status(home.path(), "HTTP://127.0.0.1:18100/").unwrap());
        assert!(!proxy_status(home.path(), "http://127.0.0.1:18101").unwrap());
    }

    #[test]
    fn disable_without_sidecar_falls_back_to_delete_if_equal() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        sidecar::delete(state_dir.path(), PLATFORM_KEY).unwrap();

        disable_proxy(home.path(), state_dir.path()).unwrap();
        let config = read_config(&config_path(home.path())).unwrap();
        assert!(config["env"].get("ANTHROPIC_BASE_URL").is_none());
    }

    #[test]
    fn apply_single_provider_writes_its_own_url_and_key() {
        let home = tempdir().unwrap();
        apply_single_provider(home.path(), &test_provider()).unwrap();
        let config = read_config(&config_path(home.path())).unwrap();
        assert_eq!(config["env"]["ANTHROPIC_BASE_URL"], "https://api.anthropic.com");
        assert_eq!(config["env"]["ANTHROPIC_AUTH_TOKEN"], "sk-ant-real");
    }

    #[test]
    fn get_direct_applied_provider_id_finds_a_matching_provider() {
        let home = tempdir().unwrap();
        let provider = test_provider();
        apply_single_provider(home.path(), &provider).unwrap();
        let found = get_direct_applied_provider_id(home.path(), &[provider.clone()]).unwrap();
        assert_eq!(found, Some(provider.id));
    }
}
