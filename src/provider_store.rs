//! The provider store (§4.5): one file per platform family, reads are
//! lock-free snapshots, writes are whole-list replacements under a
//! per-platform lock.
//!
//! Grounded on the teacher's `ArcSwap<Config>` / `ArcSwap<ProviderRegistry>`
//! hot-swap pattern (`server.rs`, `signals.rs`), generalized from an
//! in-memory-only registry to one backed by a JSON file per platform.

use crate::provider::{Platform, Provider};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Per-platform snapshot plus the write-side lock guarding `saveAll`.
struct PlatformSlot {
    snapshot: ArcSwap<Vec<Provider>>,
    write_lock: AsyncMutex<()>,
}

/// Persists, per platform, an ordered list of providers.
pub struct ProviderStore {
    dir: PathBuf,
    platforms: DashMap<String, Arc<PlatformSlot>>,
}

impl ProviderStore {
    /// Open (and lazily load) a store rooted at `dir` (conventionally
    /// `~/.code-switch/providers/`).
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            platforms: DashMap::new(),
        }
    }

    fn path_for(&self, platform: &Platform) -> PathBuf {
        // `custom:id` would otherwise embed a path separator-unsafe
        // colon; store it as `custom_id.json`.
        let file_stem = platform.key().replace(':', "_");
        self.dir.join(format!("{file_stem}.json"))
    }

    fn slot_for(&self, platform: &Platform) -> Arc<PlatformSlot> {
        self.platforms
            .entry(platform.key())
            .or_insert_with(|| {
                let loaded = read_file(&self.path_for(platform)).unwrap_or_default();
                Arc::new(PlatformSlot {
                    snapshot: ArcSwap::from_pointee(loaded),
                    write_lock: AsyncMutex::new(()),
                })
            })
            .clone()
    }

    /// A lock-free snapshot of the current provider list for `platform`.
    pub fn load(&self, platform: &Platform) -> Arc<Vec<Provider>> {
        self.slot_for(platform).snapshot.load_full()
    }

    /// Replace the entire list for `platform`, de-duplicating by id
    /// (last write for a given id wins, insertion order of first
    /// occurrence preserved) and persisting atomically before
    /// publishing the new snapshot.
    pub async fn save(&self, platform: &Platform, providers: Vec<Provider>) -> Result<()> {
        let slot = self.slot_for(platform);
        let _guard = slot.write_lock.lock().await;

        let deduped = dedup_by_id(providers);
        let path = self.path_for(platform);
        crate::atomic_file::write_json(&path, &deduped)
            .with_context(|| format!("failed to persist provider list for {platform}"))?;

        slot.snapshot.store(Arc::new(deduped));
        Ok(())
    }

    /// All platform keys with a non-empty stored list, including
    /// `custom:*` families discovered on disk.
    pub fn known_platforms(&self) -> Vec<Platform> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();

        for entry in self.platforms.iter() {
            if seen.insert(entry.key().clone()) {
                out.push(entry.key().parse().expect("Platform::from_str is infallible"));
            }
        }

        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let Some(stem) = entry.path().file_stem().map(|s| s.to_string_lossy().to_string())
                else {
                    continue;
                };
                let key = if let Some(id) = stem.strip_prefix("custom_") {
                    format!("custom:{id}")
                } else {
                    stem
                };
                if seen.insert(key.clone()) {
                    out.push(key.parse().expect("Platform::from_str is infallible"));
                }
            }
        }

        out
    }
}

/// Keep insertion order of each id's first occurrence, but the value
/// from its last occurrence (§4.5 "de-duplicating by id on save").
fn dedup_by_id(providers: Vec<Provider>) -> Vec<Provider> {
    let mut order: Vec<u64> = Vec::with_capacity(providers.len());
    let mut by_id: HashMap<u64, Provider> = HashMap::new();
    for p in providers {
        if !by_id.contains_key(&p.id) {
            order.push(p.id);
        }
        by_id.insert(p.id, p);
    }
    order.into_iter().map(|id| by_id.remove(&id).unwrap()).collect()
}

fn read_file(path: &Path) -> Result<Vec<Provider>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let providers: Vec<Provider> = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse provider file {:?}", path))?;
    Ok(providers)
}
