//! Target-directory layout: per-device subdirectories, the `uuid`
//! file, monthly folders, and `TargetFile` naming.

use crate::error::CoreError;
use chrono::{Datelike, TimeZone, Utc};
use qmpbackup_common::{BlockDevice, ResolvedLevel};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NamingOptions {
    pub no_subdir: bool,
    pub no_timestamp: bool,
    pub no_symlink: bool,
    pub monthly: bool,
}

/// The `YYYY-MM` directory `epoch` falls into, directly under `root`.
pub fn month_dir(root: &Path, epoch: i64) -> PathBuf {
    let dt = Utc.timestamp_opt(epoch, 0).single().unwrap_or_else(Utc::now);
    root.join(format!("{:04}-{:02}", dt.year(), dt.month()))
}

/// Directory a device's backup files live in, creating any
/// intermediate `YYYY-MM` directory under `--monthly`.
pub fn device_directory(root: &Path, device: &BlockDevice, naming: &NamingOptions, epoch: i64) -> PathBuf {
    let mut dir = if naming.monthly { month_dir(root, epoch) } else { root.to_path_buf() };
    if !naming.no_subdir {
        dir = dir.join(device.directory_name());
    }
    dir
}

/// Whether `epoch`'s `YYYY-MM` directory does not exist yet under
/// `root`. Meaningless (always `false`) when `--monthly` is off; the
/// `auto` level resolver only consults this when `naming.monthly` is
/// set.
pub async fn monthly_rollover(root: &Path, epoch: i64) -> bool {
    !tokio::fs::try_exists(month_dir(root, epoch)).await.unwrap_or(false)
}

/// `uuid` file path at the root of the backup directory. Always at
/// `root/uuid`, independent of `--monthly`/`--no-subdir`.
pub fn uuid_file_path(root: &Path) -> PathBuf {
    root.join("uuid")
}

/// Read the existing UUID, or `None` if no `uuid` file exists yet.
pub async fn read_uuid(root: &Path) -> Result<Option<Uuid>, CoreError> {
    let path = uuid_file_path(root);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            let uuid = Uuid::parse_str(contents.trim())
                .map_err(|e| CoreError::Chain(format!("malformed uuid file {}: {e}", path.display())))?;
            Ok(Some(uuid))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::filesystem(path, e)),
    }
}

/// Create the `uuid` file. Create-once, never rewritten.
pub async fn write_uuid(root: &Path, uuid: &Uuid) -> Result<(), CoreError> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| CoreError::filesystem(root, e))?;
    let path = uuid_file_path(root);
    tokio::fs::write(&path, uuid.to_string())
        .await
        .map_err(|e| CoreError::filesystem(path, e))
}

/// `{LEVEL}-{epoch}-{basename}` stem, before `.partial`/qcow2
/// extension are applied.
pub fn target_stem(level: ResolvedLevel, epoch: i64, basename: &str) -> String {
    format!("{}-{epoch}-{basename}", level.file_prefix())
}

pub fn partial_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.qcow2.partial"))
}

pub fn final_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.qcow2"))
}

/// Atomically drop `.partial`, only called after clean teardown with
/// no signal caught.
pub async fn finalize_rename(partial: &Path, final_path: &Path) -> Result<(), CoreError> {
    tokio::fs::rename(partial, final_path)
        .await
        .map_err(|e| CoreError::filesystem(partial, e))
}

/// `FULL-<basename>` symlink placed alongside full/copy targets when
/// `--no-timestamp` is set.
pub async fn place_symlink(dir: &Path, basename: &str, target: &Path) -> Result<(), CoreError> {
    let link_path = dir.join(format!("FULL-{basename}"));
    let _ = tokio::fs::remove_file(&link_path).await;
    #[cfg(unix)]
    {
        tokio::fs::symlink(target, &link_path)
            .await
            .map_err(|e| CoreError::filesystem(link_path, e))
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(CoreError::Configuration(
            "symlinks are only supported on unix targets".to_string(),
        ))
    }
}

/// Walks every subdirectory (per-device dirs, and any `YYYY-MM`
/// monthly dir) looking for a stray `.partial`. Since the per-device
/// directory name is only known after querying the hypervisor, this is
/// the check that runs first, before the monitor is ever contacted.
pub async fn reject_if_partial_present_recursive(root: &Path) -> Result<(), CoreError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CoreError::filesystem(&dir, e)),
        };
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CoreError::filesystem(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CoreError::filesystem(entry.path(), e))?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if entry.file_name().to_string_lossy().ends_with(".partial") {
                return Err(CoreError::Chain(format!(
                    "partial file {} present, refusing to proceed",
                    entry.path().display()
                )));
            }
        }
    }
    Ok(())
}

/// Does `dir` already contain a `FULL-*.qcow2` (not `.partial`) for
/// this device? Used by the `level=inc` pre-run gate.
pub async fn has_full_backup(dir: &Path) -> Result<bool, CoreError> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CoreError::filesystem(dir, e)),
    };
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| CoreError::filesystem(dir, e))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("FULL-") && !name.ends_with(".partial") {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_stem_matches_schema() {
        let stem = target_stem(ResolvedLevel::Full, 1700000000, "disk1");
        assert_eq!(stem, "FULL-1700000000-disk1");
    }

    #[tokio::test]
    async fn uuid_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_uuid(dir.path()).await.unwrap().is_none());
        let uuid = Uuid::new_v4();
        write_uuid(dir.path(), &uuid).await.unwrap();
        assert_eq!(read_uuid(dir.path()).await.unwrap(), Some(uuid));
    }

    #[tokio::test]
    async fn recursive_scan_finds_partial_in_device_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("disk2");
        tokio::fs::create_dir_all(&sub).await.unwrap();
        tokio::fs::write(sub.join("FULL-bar.qcow2.partial"), b"").await.unwrap();
        let err = reject_if_partial_present_recursive(dir.path()).await.unwrap_err();
        assert!(matches!(err, CoreError::Chain(_)));
    }

    #[tokio::test]
    async fn missing_directory_has_no_partial_and_no_full() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(reject_if_partial_present_recursive(&missing).await.is_ok());
        assert!(!has_full_backup(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn monthly_rollover_detects_a_month_with_no_directory_yet() {
        let dir = tempfile::tempdir().unwrap();
        let epoch = 1_700_000_000; // 2023-11
        assert!(monthly_rollover(dir.path(), epoch).await);

        tokio::fs::create_dir_all(month_dir(dir.path(), epoch)).await.unwrap();
        assert!(!monthly_rollover(dir.path(), epoch).await);
    }
}
