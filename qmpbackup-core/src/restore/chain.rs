//! Classifies the files in a device's backup directory into a
//! validated, ordered chain rooted at one FULL.

use crate::error::CoreError;
use qmpbackup_common::{ChainEntry, ChainEntryKind};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// `{LEVEL}-{epoch}-{basename}.qcow2` target file naming.
static TARGET_FILE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(FULL|INC|COPY)-(\d+)-(.+)\.qcow2$").unwrap());

/// Parse one filename against the `{LEVEL}-{epoch}-{basename}.qcow2`
/// schema. Returns `None` for anything that doesn't match (stray
/// files, `image` symlinks, directories).
fn classify(path: &Path) -> Option<ChainEntry> {
    let name = path.file_name()?.to_str()?;
    let captures = TARGET_FILE_REGEX.captures(name)?;
    let kind = match &captures[1] {
        "FULL" => ChainEntryKind::Full,
        "INC" => ChainEntryKind::Inc,
        "COPY" => ChainEntryKind::Copy,
        _ => return None,
    };
    let epoch = captures[2].parse::<i64>().ok()?;
    Some(ChainEntry {
        path: path.to_path_buf(),
        kind,
        epoch,
        disk_basename: captures[3].to_string(),
    })
}

/// List `dir`, reject any `.partial` file, and classify the rest into
/// a chain sorted by `epoch` with the FULL first.
pub async fn load(dir: &Path) -> Result<Vec<ChainEntry>, CoreError> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CoreError::filesystem(dir, e))?;

    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| CoreError::filesystem(dir, e))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".partial") {
            return Err(CoreError::Chain(format!(
                "partial file {} present, refusing to restore from this chain",
                path.display()
            )));
        }
        if let Some(chain_entry) = classify(&path) {
            entries.push(chain_entry);
        }
    }

    let full_count = entries.iter().filter(|e| e.kind == ChainEntryKind::Full).count();
    if full_count == 0 {
        return Err(CoreError::Chain(format!("no FULL backup found in {}", dir.display())));
    }
    if full_count > 1 {
        return Err(CoreError::Chain(format!(
            "{} FULL backups found in {}, expected exactly one",
            full_count,
            dir.display()
        )));
    }

    entries.sort_by_key(|e| e.epoch);
    Ok(entries)
}

/// Drop every entry whose epoch is strictly greater than the entry
/// named `until` (inclusive truncation).
pub fn truncate_until(entries: Vec<ChainEntry>, until: &str) -> Result<Vec<ChainEntry>, CoreError> {
    let cutoff = entries
        .iter()
        .find(|e| e.path.file_name().map(|n| n.to_string_lossy() == until).unwrap_or(false))
        .map(|e| e.epoch)
        .ok_or_else(|| CoreError::Chain(format!("--until names unknown entry '{until}'")))?;
    Ok(entries.into_iter().filter(|e| e.epoch <= cutoff).collect())
}

/// Keep only entries whose filename contains `needle`, plus the FULL
/// (the root is never filtered out), then check the survivors still
/// form a contiguous chain.
pub fn apply_filter(entries: Vec<ChainEntry>, needle: &str) -> Result<Vec<ChainEntry>, CoreError> {
    let filtered: Vec<ChainEntry> = entries
        .into_iter()
        .filter(|e| e.kind == ChainEntryKind::Full || file_name(e).contains(needle))
        .collect();
    check_continuity(&filtered)?;
    Ok(filtered)
}

fn file_name(entry: &ChainEntry) -> String {
    entry.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// With no filter applied, the chain is every classified entry in
/// epoch order; this is just a continuity assertion over the full set.
pub fn check_continuity(entries: &[ChainEntry]) -> Result<(), CoreError> {
    if entries.first().map(|e| e.kind != ChainEntryKind::Full).unwrap_or(true) {
        return Err(CoreError::Chain("chain is not rooted at a FULL backup".to_string()));
    }
    let mut last_epoch = entries[0].epoch;
    for entry in &entries[1..] {
        if entry.epoch <= last_epoch {
            return Err(CoreError::Chain(format!(
                "chain entries are not strictly increasing in epoch ({} <= {})",
                entry.epoch, last_epoch
            )));
        }
        last_epoch = entry.epoch;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_all_three_kinds() {
        let full = classify(Path::new("/d/FULL-1700000000-disk1.qcow2")).unwrap();
        assert_eq!(full.kind, ChainEntryKind::Full);
        assert_eq!(full.epoch, 1700000000);
        assert_eq!(full.disk_basename, "disk1");

        let inc = classify(Path::new("/d/INC-1700000100-disk1.qcow2")).unwrap();
        assert_eq!(inc.kind, ChainEntryKind::Inc);

        let copy = classify(Path::new("/d/COPY-1700000200-disk1.qcow2")).unwrap();
        assert_eq!(copy.kind, ChainEntryKind::Copy);
    }

    #[test]
    fn unrecognized_files_are_ignored() {
        assert!(classify(Path::new("/d/image")).is_none());
        assert!(classify(Path::new("/d/uuid")).is_none());
        assert!(classify(Path::new("/d/FULL-1700000000-disk1.qcow2.partial")).is_none());
    }

    #[test]
    fn continuity_requires_full_root_and_increasing_epochs() {
        let entries = vec![
            ChainEntry { path: "FULL-1-d".into(), kind: ChainEntryKind::Full, epoch: 1, disk_basename: "d".into() },
            ChainEntry { path: "INC-2-d".into(), kind: ChainEntryKind::Inc, epoch: 2, disk_basename: "d".into() },
        ];
        assert!(check_continuity(&entries).is_ok());

        let broken = vec![
            ChainEntry { path: "INC-2-d".into(), kind: ChainEntryKind::Inc, epoch: 2, disk_basename: "d".into() },
        ];
        assert!(check_continuity(&broken).is_err());
    }

    #[test]
    fn filter_keeps_full_even_if_it_does_not_match_needle() {
        let entries = vec![
            ChainEntry { path: "FULL-1-d".into(), kind: ChainEntryKind::Full, epoch: 1, disk_basename: "d".into() },
            ChainEntry { path: "INC-2-nightly-d".into(), kind: ChainEntryKind::Inc, epoch: 2, disk_basename: "d".into() },
            ChainEntry { path: "INC-3-d".into(), kind: ChainEntryKind::Inc, epoch: 3, disk_basename: "d".into() },
        ];
        let filtered = apply_filter(entries, "nightly").unwrap();
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[1].epoch, 2);
    }

    #[tokio::test]
    async fn load_rejects_directory_with_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("INC-2-d.qcow2.partial"), b"").await.unwrap();
        let err = load(dir.path()).await.unwrap_err();
        assert!(matches!(err, CoreError::Chain(_)));
    }

    #[tokio::test]
    async fn load_rejects_chain_with_no_full() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("INC-2-d.qcow2"), b"").await.unwrap();
        let err = load(dir.path()).await.unwrap_err();
        assert!(matches!(err, CoreError::Chain(_)));
    }

    #[tokio::test]
    async fn load_rejects_chain_with_two_fulls() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("FULL-1-d.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("FULL-2-d.qcow2"), b"").await.unwrap();
        let err = load(dir.path()).await.unwrap_err();
        assert!(matches!(err, CoreError::Chain(_)));
    }

    #[tokio::test]
    async fn load_sorts_by_epoch_with_full_first() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("INC-3-d.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("FULL-1-d.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-2-d.qcow2"), b"").await.unwrap();
        let entries = load(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, ChainEntryKind::Full);
        assert_eq!(entries[1].epoch, 2);
        assert_eq!(entries[2].epoch, 3);
    }
}
