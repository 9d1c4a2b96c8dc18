//! The proxy-state sidecar (§3, §4.4): one JSON file per platform under
//! `~/.code-switch/proxy-state/<platform>.json`, recording the
//! "before" baseline a CLI-config mutator needs to surgically revert.
//!
//! Grounded on the teacher's atomic-file-write idiom (`atomic_file.rs`)
//! plus `config.rs`'s `#[serde(default = ...)]` discipline (absent
//! fields round-trip losslessly); no teacher file does sidecar
//! bookkeeping itself since the teacher never mutates another CLI's
//! config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SIDECAR_VERSION: u32 = 1;

/// A single field's pre-injection value, recorded as "present with
/// value v" (`Some`) or "absent" (`None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldSnapshot {
    /// Dotted path within the target config, e.g. `"env.ANTHROPIC_BASE_URL"`
    /// or `"model_providers.code-switch-r.base_url"`.
    pub path: String,
    pub before: Option<serde_json::Value>,
}

/// The sidecar file itself (§3 "Proxy-state sidecar").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyState {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Path of the target CLI config file this sidecar was recorded
    /// against (the primary file; codex's auxiliary `auth.json` is
    /// tracked via its own field snapshots with a distinguishing path
    /// prefix, not a second sidecar).
    pub config_path: PathBuf,
    /// Did the config file itself exist pre-injection?
    pub config_existed: bool,
    /// Did the sub-object directly containing the injected fields
    /// (`env`, `model_providers.<key>`, ...) exist pre-injection? If
    /// `false` and every field below is restored to absent, the parent
    /// itself should be deleted on disable.
    pub parent_existed: bool,
    /// Pre-injection value of every field the mutator overwrites.
    pub fields: Vec<FieldSnapshot>,
}

fn default_version() -> u32 {
    SIDECAR_VERSION
}

impl ProxyState {
    pub fn before(&self, path: &str) -> Option<&serde_json::Value> {
        self.fields
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| f.before.as_ref())
    }
}

fn sidecar_path(proxy_state_dir: &Path, platform_key: &str) -> PathBuf {
    proxy_state_dir.join(format!("{}.json", platform_key.replace(':', "_")))
}

/// Load the sidecar for `platform_key`, if one exists. A missing or
/// corrupt sidecar is a soft fallback (§4.4, §9 "sidecar
/// absence/corruption"), never a fatal error — callers decide whether
/// to fall back to delete-if-equal revert.
pub fn load(proxy_state_dir: &Path, platform_key: &str) -> Option<ProxyState> {
    let path = sidecar_path(proxy_state_dir, platform_key);
    let bytes = std::fs::read(&path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn exists(proxy_state_dir: &Path, platform_key: &str) -> bool {
    sidecar_path(proxy_state_dir, platform_key).exists()
}

/// Persist a freshly-captured sidecar (§4.4 `enableProxy`, first enable
/// only — idempotent callers must not call this if one already exists).
pub fn save(proxy_state_dir: &Path, platform_key: &str, state: &ProxyState) -> Result<()> {
    let path = sidecar_path(proxy_state_dir, platform_key);
    crate::atomic_file::write_json(&path, state)
        .with_context(|| format!("failed to write proxy-state sidecar for {platform_key}"))
}

/// Delete the sidecar (§4.4 `disableProxy`'s final step).
pub fn delete(proxy_state_dir: &Path, platform_key: &str) -> Result<()> {
    let path = sidecar_path(proxy_state_dir, platform_key);
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove proxy-state sidecar {:?}", path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state() -> ProxyState {
        ProxyState {
            version: SIDECAR_VERSION,
            config_path: PathBuf::from("/home/user/.claude/settings.json"),
            config_existed: true,
            parent_existed: false,
            fields: vec![
                FieldSnapshot {
                    path: "env.ANTHROPIC_BASE_URL".into(),
                    before: None,
                },
                FieldSnapshot {
                    path: "env.ANTHROPIC_AUTH_TOKEN".into(),
                    before: Some(serde_json::Value::String("sk-old".into())),
                },
            ],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        save(dir.path(), "claude", &state()).unwrap();
        let loaded = load(dir.path(), "claude").unwrap();
        assert_eq!(loaded.fields.len(), 2);
        assert_eq!(
            loaded.before("env.ANTHROPIC_AUTH_TOKEN"),
            Some(&serde_json::Value::String("sk-old".into()))
        );
        assert_eq!(loaded.before("env.ANTHROPIC_BASE_URL"), None);
    }

    #[test]
    fn missing_sidecar_loads_as_none() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path(), "codex").is_none());
    }

    #[test]
    fn corrupt_sidecar_loads_as_none_not_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("gemini.json"), b"not json").unwrap();
        assert!(load(dir.path(), "gemini").is_none());
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempdir().unwrap();
        save(dir.path(), "claude", &state()).unwrap();
        assert!(exists(dir.path(), "claude"));
        delete(dir.path(), "claude").unwrap();
        assert!(!exists(dir.path(), "claude"));
    }

    #[test]
    fn delete_of_missing_sidecar_is_a_no_op() {
        let dir = tempdir().unwrap();
        assert!(delete(dir.path(), "claude").is_ok());
    }
}
