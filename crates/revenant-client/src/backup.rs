use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use revenant_core::backup::{manifest_hash_of, seal_backup};
use revenant_core::{BackupBlob, BackupDraft, BackupRecord, Bytes32, IdentityKeys};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Where the next backup attaches to the agent's hash chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainPosition {
    pub backup_seq: u64,
    pub header_hash: Bytes32,
}

impl ChainPosition {
    #[must_use]
    pub fn latest(records: &[BackupRecord]) -> Option<Self> {
        records
            .iter()
            .filter(|record| record.tx_id.is_some())
            .max_by_key(|record| record.backup_seq)
            .map(|record| Self { backup_seq: record.backup_seq, header_hash: record.header_hash })
    }
}

/// Read every regular file under `dir`, keyed by its `/`-separated relative path.
///
/// # Errors
/// Returns an error when the directory cannot be walked or a file cannot be read.
pub fn collect_files(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    walk(dir, dir, &mut files)?;
    if files.is_empty() {
        return Err(anyhow!("no files to back up in {}", dir.display()));
    }
    Ok(files)
}

fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, files)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} escapes {}", path.display(), root.display()))?;
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let content =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            files.insert(name, content);
        }
    }
    Ok(())
}

/// Encrypt and sign `files` as the successor of `previous`.
///
/// # Errors
/// Propagates encryption and signing failures.
pub fn seal_next(
    keys: &IdentityKeys,
    files: &BTreeMap<String, Vec<u8>>,
    previous: Option<ChainPosition>,
    manifest_version: u64,
    now: OffsetDateTime,
) -> Result<BackupBlob> {
    let timestamp_ms = i64::try_from(now.unix_timestamp_nanos() / 1_000_000)
        .context("timestamp out of range")?;
    let draft = BackupDraft {
        backup_id: BackupDraft::new_backup_id(),
        backup_seq: previous.map_or(1, |position| position.backup_seq + 1),
        timestamp_ms,
        manifest_hash: manifest_hash_of(files)?,
        manifest_version,
        prev_backup_hash: previous.map(|position| position.header_hash),
    };
    Ok(seal_backup(&keys.agent, &keys.public_identity(), draft, files)?)
}

#[cfg(test)]
mod tests {
    use revenant_core::derive_keys;
    use tempfile::TempDir;
    use time::Duration;

    use super::*;

    #[test]
    fn files_are_collected_with_relative_names() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("MEMORY.md"), b"core")?;
        fs::create_dir_all(dir.path().join("journal"))?;
        fs::write(dir.path().join("journal").join("day1.md"), b"hello")?;

        let files = collect_files(dir.path())?;
        assert_eq!(files.keys().cloned().collect::<Vec<_>>(), vec!["MEMORY.md", "journal/day1.md"]);
        assert!(collect_files(TempDir::new()?.path()).is_err());
        Ok(())
    }

    #[test]
    fn successor_links_to_previous_header() -> Result<()> {
        let keys = derive_keys(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon about",
        )?;
        let files = BTreeMap::from([("a.txt".to_string(), b"a".to_vec())]);
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(20_000);
        let first = seal_next(&keys, &files, None, 1, now)?;
        assert_eq!(first.header.backup_seq, 1);
        assert_eq!(first.header.prev_backup_hash, None);

        let position =
            ChainPosition { backup_seq: 1, header_hash: first.header.header_hash()? };
        let second = seal_next(&keys, &files, Some(position), 1, now)?;
        assert_eq!(second.header.backup_seq, 2);
        assert_eq!(second.header.prev_backup_hash, Some(position.header_hash));
        assert_eq!(second.header.manifest_hash, first.header.manifest_hash);
        second.verify(keys.agent_id())?;
        Ok(())
    }
}
