//! Gemini CLI config mutator (§4.4's table, gemini row): `~/.gemini/.env`
//! (dotenv keys `GOOGLE_GEMINI_BASE_URL`, `GEMINI_API_KEY`) plus a
//! sister `~/.gemini/settings.json` (`security.auth.selectedType`,
//! deep-merged on write per §6's file-format list).
//!
//! The dotenv editor is hand-rolled rather than pulled from a crate:
//! §6 requires blank lines and `#` comments preserved and values kept
//! verbatim to EOL with only outer whitespace trimmed, which is a
//! line-rewrite operation, not a parse/re-serialize round trip — the
//! same "minimal diff, preserve everything else" discipline the
//! teacher's `config.rs` applies to `#[serde(default = ...)]` so absent
//! fields round-trip losslessly.

use super::sidecar::{self, FieldSnapshot, ProxyState};
use super::{urls_match, RELAY_PLACEHOLDER_TOKEN};
use crate::provider::Provider;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const PLATFORM_KEY: &str = "gemini";
const BASE_URL_KEY: &str = "GOOGLE_GEMINI_BASE_URL";
const API_KEY_KEY: &str = "GEMINI_API_KEY";
const FIELD_BASE_URL: &str = "env.GOOGLE_GEMINI_BASE_URL";
const FIELD_API_KEY: &str = "env.GEMINI_API_KEY";

fn env_path(home: &Path) -> PathBuf {
    home.join(".gemini").join(".env")
}

fn settings_path(home: &Path) -> PathBuf {
    home.join(".gemini").join("settings.json")
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(text.lines().map(|l| l.to_string()).collect())
}

fn render_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn dotenv_get<'a>(lines: &'a [String], key: &str) -> Option<&'a str> {
    for line in lines {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim());
            }
        }
    }
    None
}

fn dotenv_set(lines: &mut Vec<String>, key: &str, value: &str) {
    for line in lines.iter_mut() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        if let Some((k, _)) = line.split_once('=') {
            if k.trim() == key {
                *line = format!("{key}={value}");
                return;
            }
        }
    }
    lines.push(format!("{key}={value}"));
}

fn dotenv_remove(lines: &mut Vec<String>, key: &str) {
    lines.retain(|line| {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            return true;
        }
        match line.split_once('=') {
            Some((k, _)) => k.trim() != key,
            None => true,
        }
    });
}

fn read_settings(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {:?} as JSON", path))
}

/// Deep-merge `patch` into `base` (objects merge key-by-key recursively;
/// any other value type replaces outright).
fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                deep_merge(base_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, patch) => *slot = patch,
    }
}

fn relay_url_with_suffix(relay_base_url: &str) -> String {
    format!("{}/gemini", relay_base_url.trim_end_matches('/'))
}

pub fn enable_proxy(home: &Path, relay_base_url: &str, proxy_state_dir: &Path) -> Result<()> {
    let env_path = env_path(home);

    if !sidecar::exists(proxy_state_dir, PLATFORM_KEY) {
        let env_existed = env_path.exists();
        let lines = read_lines(&env_path)?;
        let before_base_url = dotenv_get(&lines, BASE_URL_KEY).map(|s| Value::String(s.to_string()));
        let before_api_key = dotenv_get(&lines, API_KEY_KEY).map(|s| Value::String(s.to_string()));

        if env_existed {
            crate::atomic_file::backup(&env_path)?;
        }

        sidecar::save(
            proxy_state_dir,
            PLATFORM_KEY,
            &ProxyState {
                version: 1,
                config_path: env_path.clone(),
                config_existed: env_existed,
                parent_existed: true, // dotenv has no sub-object; fields live at top level
                fields: vec![
                    FieldSnapshot {
                        path: FIELD_BASE_URL.into(),
                        before: before_base_url,
                    },
                    FieldSnapshot {
                        path: FIELD_API_KEY.into(),
                        before: before_api_key,
                    },
                ],
            },
        )?;
    }

    let mut lines = read_lines(&env_path)?;
    dotenv_set(&mut lines, BASE_URL_KEY, &relay_url_with_suffix(relay_base_url));
    dotenv_set(&mut lines, API_KEY_KEY, RELAY_PLACEHOLDER_TOKEN);
    crate::atomic_file::write_text(&env_path, &render_lines(&lines))?;

    let settings_path = settings_path(home);
    let mut settings = read_settings(&settings_path)?;
    deep_merge(
        &mut settings,
        json!({ "security": { "auth": { "selectedType": "gemini-api-key" } } }),
    );
    crate::atomic_file::write_json(&settings_path, &settings)
}

pub fn disable_proxy(home: &Path, proxy_state_dir: &Path) -> Result<()> {
    let env_path = env_path(home);
    let mut lines = read_lines(&env_path)?;

    match sidecar::load(proxy_state_dir, PLATFORM_KEY) {
        Some(state) => {
            restore(&mut lines, BASE_URL_KEY, state.before(FIELD_BASE_URL));
            restore(&mut lines, API_KEY_KEY, state.before(FIELD_API_KEY));
        }
        None => {
            let relay_present = dotenv_get(&lines, API_KEY_KEY) == Some(RELAY_PLACEHOLDER_TOKEN);
            if relay_present {
                dotenv_remove(&mut lines, BASE_URL_KEY);
                dotenv_remove(&mut lines, API_KEY_KEY);
            }
        }
    }

    crate::atomic_file::write_text(&env_path, &render_lines(&lines))?;
    sidecar::delete(proxy_state_dir, PLATFORM_KEY)
}

fn restore(lines: &mut Vec<String>, key: &str, before: Option<&Value>) {
    match before.and_then(Value::as_str) {
        Some(v) => dotenv_set(lines, key, v),
        None => dotenv_remove(lines, key),
    }
}

pub fn proxy_status(home: &Path, relay_base_url: &str) -> Result<bool> {
    let lines = read_lines(&env_path(home))?;
    let current = dotenv_get(&lines, BASE_URL_KEY).unwrap_or("");
    Ok(urls_match(current, &relay_url_with_suffix(relay_base_url)))
}

pub fn apply_single_provider(home: &Path, provider: &Provider) -> Result<()> {
    let env_path = env_path(home);
    if env_path.exists() {
        crate::atomic_file::backup(&env_path)?;
    }
    let mut lines = read_lines(&env_path)?;
    dotenv_set(&mut lines, BASE_URL_KEY, &provider.base_url);
    dotenv_set(&mut lines, API_KEY_KEY, &provider.api_key);
    crate::atomic_file::write_text(&env_path, &render_lines(&lines))
}

pub fn get_direct_applied_provider_id(home: &Path, providers: &[Provider]) -> Result<Option<u64>> {
    let lines = read_lines(&env_path(home))?;
    let current_url = dotenv_get(&lines, BASE_URL_KEY).unwrap_or("");
    let current_key = dotenv_get(&lines, API_KEY_KEY).unwrap_or("");

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
            id: 9,
            name: "p".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            api_key: "gm-real".into(),
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
    fn enable_appends_gemini_suffix_to_base_url() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();

        let lines = read_lines(&env_path(home.path())).unwrap();
        assert_eq!(dotenv_get(&lines, BASE_URL_KEY), Some("http://127.0.0.1:18100/gemini"));
    }

    #[test]
    fn blank_lines_and_comments_are_preserved_across_enable() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".gemini")).unwrap();
        std::fs::write(
            env_path(home.path()),
            "# user comment\nGEMINI_MODEL=gemini-2.5-pro\n\n",
        )
        .unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();

        let contents = std::fs::read_to_string(env_path(home.path())).unwrap();
        assert!(contents.contains("# user comment"));
        assert!(contents.contains("GEMINI_MODEL=gemini-2.5-pro"));
    }

    #[test]
    fn disable_restores_pre_existing_values_and_leaves_others_untouched() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".gemini")).unwrap();
        std::fs::write(
            env_path(home.path()),
            "GEMINI_MODEL=gemini-2.5-pro\nGOOGLE_GEMINI_BASE_URL=https://generativelanguage.googleapis.com\n",
        )
        .unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        disable_proxy(home.path(), state_dir.path()).unwrap();

        let lines = read_lines(&env_path(home.path())).unwrap();
        assert_eq!(
            dotenv_get(&lines, BASE_URL_KEY),
            Some("https://generativelanguage.googleapis.com")
        );
        assert_eq!(dotenv_get(&lines, "GEMINI_MODEL"), Some("gemini-2.5-pro"));
        assert!(dotenv_get(&lines, API_KEY_KEY).is_none());
    }

    #[test]
    fn settings_json_deep_merge_preserves_sibling_keys() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".gemini")).unwrap();
        std::fs::write(
            settings_path(home.path()),
            serde_json::to_vec(&json!({"security": {"other": true}}, )).unwrap(),
        )
        .unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();

        let settings = read_settings(&settings_path(home.path())).unwrap();
        assert_eq!(settings["security"]["other"], true);
        assert_eq!(settings["security"]["auth"]["selectedType"], "gemini-api-key");
    }

    #[test]
    fn proxy_status_checks_the_suffixed_url() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        assert!(proxy_status(home.path(), "http://127.0.0.1:18100").unwrap());
    }

    #[test]
    fn apply_single_provider_writes_a_plain_url_with_no_gemini_suffix() {
        let home = tempdir().unwrap();
        apply_single_provider(home.path(), &test_provider()).unwrap();
        let lines = read_lines(&env_path(home.path())).unwrap();
        assert_eq!(
            dotenv_get(&lines, BASE_URL_KEY),
            Some("https://generativelanguage.googleapis.com")
        );
    }
}
