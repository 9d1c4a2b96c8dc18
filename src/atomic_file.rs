//! Atomic write / backup helpers used everywhere a user-visible file is
//! rewritten: the provider store, the CLI-config mutator, and the
//! proxy-state sidecar.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Write `contents` to `path` via temp-file + fsync + rename, so a
/// concurrent reader (or a crash mid-write) never observes a partial
/// file.
pub fn write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {:?}", parent))?;
    }

    let tmp_path = tmp_path_for(path);
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to open temp file {:?}", tmp_path))?;
        tmp.write_all(contents)
            .with_context(|| format!("failed to write temp file {:?}", tmp_path))?;
        tmp.sync_all()
            .with_context(|| format!("failed to fsync temp file {:?}", tmp_path))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {:?} to {:?}", tmp_path, path))?;

    Ok(())
}

/// Write `value` as pretty JSON, atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    write(path, &contents)
}

/// Write `text` atomically (text-file wrapper over `write`).
pub fn write_text(path: &Path, text: &str) -> Result<()> {
    write(path, text.as_bytes())
}

/// Copy `path` to a sibling backup file whose name is guaranteed not to
/// collide with an existing backup (`O_EXCL` plus a nanosecond suffix),
/// returning the backup's path. No-op (returns `Ok(None)`) if `path`
/// does not exist.
pub fn backup(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    let backup_name = format!("{file_name}.bak.{nanos}");
    let backup_path = path.with_file_name(backup_name);

    let contents = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let mut backup_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&backup_path)
        .with_context(|| format!("failed to create backup file {:?}", backup_path))?;
    backup_file.write_all(&contents)?;
    backup_file.sync_all()?;

    Ok(Some(backup_path))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{file_name}.tmp.{nanos}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_creates_parent_dirs_and_is_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn write_never_leaves_a_visible_temp_file_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.txt");
        write(&path, b"content").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["file.txt".to_string()]);
    }

    #[test]
    fn backup_of_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(backup(&path).unwrap().is_none());
    }

    #[test]
    fn backup_preserves_original_contents_under_a_new_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, b"model = \"gpt-5\"\n").unwrap();

        let backup_path = backup(&path).unwrap().unwrap();
        assert_ne!(backup_path, path);
        assert_eq!(fs::read(&backup_path).unwrap(), b"model = \"gpt-5\"\n");
        // Original is untouched.
        assert_eq!(fs::read(&path).unwrap(), b"model = \"gpt-5\"\n");
    }

    #[test]
    fn write_json_round_trips() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Doc {
            a: u32,
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json(&path, &Doc { a: 7 }).unwrap();
        let read_back: Doc = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(read_back, Doc { a: 7 });
    }
}
