//! Codex CLI config mutator (§4.4's table, codex row):
//! `~/.codex/config.toml` (top-level `preferred_auth_method`,
//! `model_provider`, sub-table `[model_providers.<key>]`) plus the
//! sibling `~/.codex/auth.json` (`OPENAI_API_KEY`).
//!
//! TOML edits use `toml_edit` rather than the teacher's plain `toml`
//! crate: §8's "surgical disable" property (`disableProxy` preserves an
//! unrelated key `K` a user added while the proxy was enabled, *and*
//! every other key's original formatting/comments) requires a format-
//! preserving document model, which `toml::Value` round-tripping does
//! not give. `toml_edit` is the ecosystem's standard answer to exactly
//! this (surgical, comment-preserving TOML mutation).

use super::sidecar::{self, FieldSnapshot, ProxyState};
use super::{urls_match, RELAY_PLACEHOLDER_TOKEN};
use crate::provider::Provider;
use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use std::path::{Path, PathBuf};
use toml_edit::{value, DocumentMut, Item, Table};

const PLATFORM_KEY: &str = "codex";
const PROVIDER_KEY: &str = "code-switch-r";

const FIELD_PREFERRED_AUTH_METHOD: &str = "preferred_auth_method";
const FIELD_MODEL_PROVIDER: &str = "model_provider";
const FIELD_SUBTABLE_EXISTED: &str = "model_providers.code-switch-r";
const FIELD_OPENAI_API_KEY: &str = "auth.OPENAI_API_KEY";

fn config_path(home: &Path) -> PathBuf {
    home.join(".codex").join("config.toml")
}

fn auth_path(home: &Path) -> PathBuf {
    home.join(".codex").join("auth.json")
}

fn read_document(path: &Path) -> Result<DocumentMut> {
    if !path.exists() {
        return Ok(DocumentMut::new());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    text.parse::<DocumentMut>()
        .with_context(|| format!("failed to parse {:?} as TOML", path))
}

fn read_auth_json(path: &Path) -> Result<JsonValue> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {:?} as JSON", path))
}

fn str_field(doc: &DocumentMut, key: &str) -> Option<JsonValue> {
    doc.get(key)
        .and_then(Item::as_str)
        .map(|s| JsonValue::String(s.to_string()))
}

pub fn enable_proxy(home: &Path, relay_base_url: &str, proxy_state_dir: &Path) -> Result<()> {
    let toml_path = config_path(home);
    let json_path = auth_path(home);

    if !sidecar::exists(proxy_state_dir, PLATFORM_KEY) {
        let toml_existed = toml_path.exists();
        let json_existed = json_path.exists();

        let doc = read_document(&toml_path)?;
        let before_auth_method = str_field(&doc, FIELD_PREFERRED_AUTH_METHOD);
        let before_model_provider = str_field(&doc, FIELD_MODEL_PROVIDER);
        let subtable_existed = doc
            .get("model_providers")
            .and_then(Item::as_table)
            .map(|t| t.contains_key(PROVIDER_KEY))
            .unwrap_or(false);

        let auth_json = read_auth_json(&json_path)?;
        let before_api_key = auth_json.get("OPENAI_API_KEY").cloned();

        if toml_existed {
            crate::atomic_file::backup(&toml_path)?;
        }
        if json_existed {
            crate::atomic_file::backup(&json_path)?;
        }

        sidecar::save(
            proxy_state_dir,
            PLATFORM_KEY,
            &ProxyState {
                version: 1,
                config_path: toml_path.clone(),
                config_existed: toml_existed && json_existed,
                // `parent_existed` doubles here as "the whole
                // model_providers table pre-existed", used to decide
                // whether to remove it entirely on disable.
                parent_existed: doc.get("model_providers").is_some(),
                fields: vec![
                    FieldSnapshot {
                        path: FIELD_PREFERRED_AUTH_METHOD.into(),
                        before: before_auth_method,
                    },
                    FieldSnapshot {
                        path: FIELD_MODEL_PROVIDER.into(),
                        before: before_model_provider,
                    },
                    FieldSnapshot {
                        path: FIELD_SUBTABLE_EXISTED.into(),
                        before: Some(JsonValue::Bool(subtable_existed)),
                    },
                    FieldSnapshot {
                        path: FIELD_OPENAI_API_KEY.into(),
                        before: before_api_key,
                    },
                ],
            },
        )?;
    }

    let mut doc = read_document(&toml_path)?;
    doc[FIELD_PREFERRED_AUTH_METHOD] = value("apikey");
    doc[FIELD_MODEL_PROVIDER] = value(PROVIDER_KEY);

    if doc.get("model_providers").is_none() {
        doc["model_providers"] = Item::Table(Table::new());
    }
    let model_providers = doc["model_providers"]
        .as_table_mut()
        .context("model_providers is not a table")?;
    model_providers.insert(PROVIDER_KEY, Item::Table(Table::new()));
    let sub = model_providers[PROVIDER_KEY]
        .as_table_mut()
        .context("model_providers.code-switch-r is not a table")?;
    sub.insert("name", value(PROVIDER_KEY));
    sub.insert("base_url", value(relay_base_url));
    sub.insert("wire_api", value("responses"));
    sub.insert("requires_openai_auth", value(false));

    crate::atomic_file::write_text(&toml_path, &doc.to_string())?;

    let mut auth_json = read_auth_json(&json_path)?;
    auth_json
        .as_object_mut()
        .context("auth.json root is not an object")?
        .insert(
            "OPENAI_API_KEY".into(),
            JsonValue::String(RELAY_PLACEHOLDER_TOKEN.to_string()),
        );
    crate::atomic_file::write_json(&json_path, &auth_json)
}

pub fn disable_proxy(home: &Path, proxy_state_dir: &Path) -> Result<()> {
    let toml_path = config_path(home);
    let json_path = auth_path(home);

    let mut doc = read_document(&toml_path)?;
    let mut auth_json = read_auth_json(&json_path)?;

    match sidecar::load(proxy_state_dir, PLATFORM_KEY) {
        Some(state) => {
            restore_str(&mut doc, FIELD_PREFERRED_AUTH_METHOD, state.before(FIELD_PREFERRED_AUTH_METHOD));
            restore_str(&mut doc, FIELD_MODEL_PROVIDER, state.before(FIELD_MODEL_PROVIDER));

            if let Some(table) = doc.get_mut("model_providers").and_then(Item::as_table_mut) {
                table.remove(PROVIDER_KEY);
            }
            if !state.parent_existed {
                doc.as_table_mut().remove("model_providers");
            }

            if let Some(obj) = auth_json.as_object_mut() {
                match state.before(FIELD_OPENAI_API_KEY) {
                    Some(v) => {
                        obj.insert("OPENAI_API_KEY".into(), v.clone());
                    }
                    None => {
                        obj.remove("OPENAI_API_KEY");
                    }
                }
            }
        }
        None => {
            // Soft fallback: delete-if-still-equal-to-relay-value.
            if doc
                .get(FIELD_MODEL_PROVIDER)
                .and_then(Item::as_str)
                .map(|s| s == PROVIDER_KEY)
                .unwrap_or(false)
            {
                doc.as_table_mut().remove(FIELD_PREFERRED_AUTH_METHOD);
                doc.as_table_mut().remove(FIELD_MODEL_PROVIDER);
                if let Some(table) = doc.get_mut("model_providers").and_then(Item::as_table_mut) {
                    table.remove(PROVIDER_KEY);
                    if table.is_empty() {
                        doc.as_table_mut().remove("model_providers");
                    }
                }
            }
            if let Some(obj) = auth_json.as_object_mut() {
                if obj.get("OPENAI_API_KEY").and_then(JsonValue::as_str) == Some(RELAY_PLACEHOLDER_TOKEN) {
                    obj.remove("OPENAI_API_KEY");
                }
            }
        }
    }

    crate::atomic_file::write_text(&toml_path, &doc.to_string())?;
    crate::atomic_file::write_json(&json_path, &auth_json)?;
    sidecar::delete(proxy_state_dir, PLATFORM_KEY)
}

fn restore_str(doc: &mut DocumentMut, key: &str, before: Option<&JsonValue>) {
    match before.and_then(JsonValue::as_str) {
        Some(s) => doc[key] = value(s),
        None => {
            doc.as_table_mut().remove(key);
        }
    }
}

pub fn proxy_status(home: &Path, relay_base_url: &str) -> Result<bool> {
    let doc = read_document(&config_path(home))?;
    let current_base_url = doc
        .get("model_providers")
        .and_then(Item::as_table)
        .and_then(|t| t.get(PROVIDER_KEY))
        .and_then(Item::as_table)
        .and_then(|t| t.get("base_url"))
        .and_then(Item::as_str)
        .unwrap_or("");
    let provider_selected = doc
        .get(FIELD_MODEL_PROVIDER)
        .and_then(Item::as_str)
        .map(|s| s == PROVIDER_KEY)
        .unwrap_or(false);

    Ok(provider_selected && urls_match(current_base_url, relay_base_url))
}

pub fn apply_single_provider(home: &Path, provider: &Provider) -> Result<()> {
    let toml_path = config_path(home);
    let json_path = auth_path(home);

    if toml_path.exists() {
        crate::atomic_file::backup(&toml_path)?;
    }
    if json_path.exists() {
        crate::atomic_file::backup(&json_path)?;
    }

    let mut doc = read_document(&toml_path)?;
    doc[FIELD_PREFERRED_AUTH_METHOD] = value("apikey");
    doc[FIELD_MODEL_PROVIDER] = value(provider.name.as_str());

    if doc.get("model_providers").is_none() {
        doc["model_providers"] = Item::Table(Table::new());
    }
    let model_providers = doc["model_providers"].as_table_mut().unwrap();
    model_providers.insert(&provider.name, Item::Table(Table::new()));
    let sub = model_providers[provider.name.as_str()].as_table_mut().unwrap();
    sub.insert("name", value(provider.name.as_str()));
    sub.insert("base_url", value(provider.base_url.as_str()));
    sub.insert("wire_api", value("responses"));
    sub.insert("requires_openai_auth", value(false));

    crate::atomic_file::write_text(&toml_path, &doc.to_string())?;

    let mut auth_json = read_auth_json(&json_path)?;
    auth_json
        .as_object_mut()
        .context("auth.json root is not an object")?
        .insert("OPENAI_API_KEY".into(), JsonValue::String(provider.api_key.clone()));
    crate::atomic_file::write_json(&json_path, &auth_json)
}

pub fn get_direct_applied_provider_id(home: &Path, providers: &[Provider]) -> Result<Option<u64>> {
    let doc = read_document(&config_path(home))?;
    let auth_json = read_auth_json(&auth_path(home))?;
    let selected_key = doc.get(FIELD_MODEL_PROVIDER).and_then(Item::as_str).unwrap_or("");
    let current_url = doc
        .get("model_providers")
        .and_then(Item::as_table)
        .and_then(|t| t.get(selected_key))
        .and_then(Item::as_table)
        .and_then(|t| t.get("base_url"))
        .and_then(Item::as_str)
        .unwrap_or("");
    let current_key = auth_json.get("OPENAI_API_KEY").and_then(JsonValue::as_str).unwrap_or("");

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
            id: 3,
            name: "openai-direct".into(),
            base_url: "https://api.openai.com".into(),
            api_key: "sk-real".into(),
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
    fn enable_then_edit_then_disable_preserves_unrelated_keys() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        std::fs::create_dir_all(home.path().join(".codex")).unwrap();
        std::fs::write(
            config_path(home.path()),
            "model = \"gpt-5\"\n\n[tools]\nweb = true\n",
        )
        .unwrap();

        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();

        // Simulate a user edit while enabled.
        let mut doc = read_document(&config_path(home.path())).unwrap();
        doc["tools"]["note"] = value("hello");
        crate::atomic_file::write_text(&config_path(home.path()), &doc.to_string()).unwrap();

        disable_proxy(home.path(), state_dir.path()).unwrap();

        let doc = read_document(&config_path(home.path())).unwrap();
        assert_eq!(doc["model"].as_str(), Some("gpt-5"));
        assert_eq!(doc["tools"]["web"].as_bool(), Some(true));
        assert_eq!(doc["tools"]["note"].as_str(), Some("hello"));
        assert!(doc.get("model_provider").is_none());
        assert!(doc.get("preferred_auth_method").is_none());
        assert!(doc.get("model_providers").is_none());
        assert!(!sidecar::exists(state_dir.path(), PLATFORM_KEY));
    }

    #[test]
    fn enable_writes_array_free_table_with_relay_base_url() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();

        let doc = read_document(&config_path(home.path())).unwrap();
        assert_eq!(
            doc["model_providers"]["code-switch-r"]["base_url"].as_str(),
            Some("http://127.0.0.1:18100")
        );
        assert_eq!(doc["model_providers"]["code-switch-r"]["wire_api"].as_str(), Some("responses"));

        let auth_json = read_auth_json(&auth_path(home.path())).unwrap();
        assert_eq!(auth_json["OPENAI_API_KEY"], RELAY_PLACEHOLDER_TOKEN);
    }

    #[test]
    fn proxy_status_requires_both_selection_and_matching_url() {
        let home = tempdir().unwrap();
        let state_dir = tempdir().unwrap();
        enable_proxy(home.path(), "http://127.0.0.1:18100", state_dir.path()).unwrap();
        assert!(proxy_status(home.path(), "http://127.0.0.1:18100").unwrap());
        assert!(!proxy_status(home.path(), "http://127.0.0.1:18101").unwrap());
    }

    #[test]
    fn apply_single_provider_refuses_is_enforced_by_caller_not_here() {
        // apply_single_provider itself performs the write unconditionally;
        // the "refuses when proxy enabled" check lives in cli_config::mod's
        // apply_single_provider wrapper.
        let home = tempdir().unwrap();
        apply_single_provider(home.path(), &test_provider()).unwrap();
        let auth_json = read_auth_json(&auth_path(home.path())).unwrap();
        assert_eq!(auth_json["OPENAI_API_KEY"], "sk-real");
    }
}
