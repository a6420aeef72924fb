//! Offline reconstruction of a device's backup chain into a single
//! bootable image, by one of four modes. Never touches the monitor;
//! everything here drives the external image tool against files
//! already on disk.

pub mod chain;

use crate::error::CoreError;
use crate::tool::ImageToolDriver;
use qmpbackup_common::ChainEntry;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Rebase,
    Commit,
    Merge,
    Snapshotrebase,
}

#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub dir: PathBuf,
    pub mode: RestoreMode,
    pub until: Option<String>,
    pub filter: Option<String>,
    pub rate_limit: Option<u64>,
    pub target_file: Option<PathBuf>,
    pub skip_check: bool,
    pub dry_run: bool,
    pub image_tool_binary: String,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub mode: RestoreMode,
    pub entries_processed: usize,
    pub bootable_tip: PathBuf,
}

pub async fn run(config: RestoreConfig) -> Result<RestoreReport, CoreError> {
    if config.mode == RestoreMode::Merge && config.target_file.is_none() {
        return Err(CoreError::Configuration(
            "merge mode requires --targetfile".to_string(),
        ));
    }

    let mut entries = chain::load(&config.dir).await?;
    if let Some(until) = &config.until {
        entries = chain::truncate_until(entries, until)?;
    }
    if let Some(needle) = &config.filter {
        entries = chain::apply_filter(entries, needle)?;
    } else {
        chain::check_continuity(&entries)?;
    }

    let tool = ImageToolDriver::new(config.image_tool_binary.clone());

    if !config.skip_check {
        for entry in &entries {
            if config.dry_run {
                info!(path = %entry.path.display(), "would check image consistency");
            } else if !tool.check(&entry.path).await? {
                return Err(CoreError::Chain(format!(
                    "consistency check failed for {}",
                    entry.path.display()
                )));
            }
        }
    }

    match config.mode {
        RestoreMode::Rebase => rebase_in_place(&tool, &config, &entries).await,
        RestoreMode::Commit => commit_chain(&tool, &config, &entries).await,
        RestoreMode::Merge => merge_into_new_file(&tool, &config, &entries).await,
        RestoreMode::Snapshotrebase => snapshot_rebase(&tool, &config, &entries).await,
    }
}

/// Rewrite each INC's backing-file pointer onto its predecessor, in
/// order. The FULL never gets rebased, it has no backing file.
async fn rebase_pass(tool: &ImageToolDriver, entries: &[ChainEntry], dry_run: bool) -> Result<(), CoreError> {
    for window in entries.windows(2) {
        let (predecessor, current) = (&window[0], &window[1]);
        if dry_run {
            info!(
                path = %current.path.display(),
                backing = %predecessor.path.display(),
                "would rebase onto predecessor"
            );
        } else {
            tool.rebase(&current.path, &predecessor.path, true).await?;
        }
    }
    Ok(())
}

async fn rebase_in_place(
    tool: &ImageToolDriver,
    config: &RestoreConfig,
    entries: &[ChainEntry],
) -> Result<RestoreReport, CoreError> {
    rebase_pass(tool, entries, config.dry_run).await?;
    let tip = entries.last().expect("chain always has at least the FULL").path.clone();
    if !config.dry_run {
        let parent = config.dir.parent().unwrap_or(&config.dir);
        place_image_symlink(parent, &tip).await?;
    } else {
        info!(target = %tip.display(), "would place image symlink");
    }
    Ok(RestoreReport {
        mode: RestoreMode::Rebase,
        entries_processed: entries.len(),
        bootable_tip: tip,
    })
}

async fn commit_chain(
    tool: &ImageToolDriver,
    config: &RestoreConfig,
    entries: &[ChainEntry],
) -> Result<RestoreReport, CoreError> {
    rebase_pass(tool, entries, config.dry_run).await?;
    let full = entries.first().expect("chain always has a FULL").path.clone();

    // Commit tip-to-FULL: `qemu-img commit` folds a file into its
    // immediate backing file only, and committing an increment deletes
    // it, which would orphan the next increment's backing pointer if
    // this ran oldest-first.
    for entry in entries.iter().skip(1).rev() {
        if config.dry_run {
            info!(
                path = %entry.path.display(),
                rate_limit = ?config.rate_limit,
                "would commit into predecessor"
            );
        } else {
            tool.commit(&entry.path, config.rate_limit).await?;
            tokio::fs::remove_file(&entry.path)
                .await
                .map_err(|e| CoreError::filesystem(&entry.path, e))?;
        }
    }

    Ok(RestoreReport {
        mode: RestoreMode::Commit,
        entries_processed: entries.len(),
        bootable_tip: full,
    })
}

/// Commit variant that never touches the original chain: the FULL is
/// copied to `--targetfile` and every increment is staged into a
/// scratch directory before rebase+commit runs against the copies.
async fn merge_into_new_file(
    tool: &ImageToolDriver,
    config: &RestoreConfig,
    entries: &[ChainEntry],
) -> Result<RestoreReport, CoreError> {
    let target = config.target_file.clone().expect("validated by run()");

    if config.dry_run {
        info!(from = %entries[0].path.display(), to = %target.display(), "would copy FULL to target file");
        for inc in entries.iter().skip(1) {
            info!(path = %inc.path.display(), "would stage increment copy for merge");
        }
        return Ok(RestoreReport {
            mode: RestoreMode::Merge,
            entries_processed: entries.len(),
            bootable_tip: target,
        });
    }

    tokio::fs::copy(&entries[0].path, &target)
        .await
        .map_err(|e| CoreError::filesystem(&target, e))?;

    let staging = tempfile::tempdir().map_err(|e| CoreError::filesystem(&config.dir, e))?;
    let mut staged_paths = vec![target.clone()];
    for inc in entries.iter().skip(1) {
        let name = inc.path.file_name().expect("classified entries always have a file name");
        let staged_path = staging.path().join(name);
        tokio::fs::copy(&inc.path, &staged_path)
            .await
            .map_err(|e| CoreError::filesystem(&staged_path, e))?;
        staged_paths.push(staged_path);
    }

    for window in staged_paths.windows(2) {
        tool.rebase(&window[1], &window[0], true).await?;
    }
    for staged in staged_paths.iter().skip(1).rev() {
        tool.commit(staged, config.rate_limit).await?;
    }

    Ok(RestoreReport {
        mode: RestoreMode::Merge,
        entries_processed: entries.len(),
        bootable_tip: target,
    })
}

async fn snapshot_rebase(
    tool: &ImageToolDriver,
    config: &RestoreConfig,
    entries: &[ChainEntry],
) -> Result<RestoreReport, CoreError> {
    rebase_pass(tool, entries, config.dry_run).await?;
    let full = entries.first().expect("chain always has a FULL").path.clone();

    if config.dry_run {
        info!(path = %full.display(), name = "FULL-BACKUP", "would create snapshot");
    } else {
        tool.snapshot_create(&full, "FULL-BACKUP").await?;
    }

    // Tip-to-FULL, same as `commit_chain`: `qemu-img commit` folds a
    // file into its immediate backing file only, and deletes the file
    // committed, so committing oldest-first would orphan the next
    // increment's backing pointer.
    for entry in entries.iter().skip(1).rev() {
        let snapshot_name = entry
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&entry.disk_basename)
            .to_string();

        if config.dry_run {
            info!(path = %full.display(), name = %snapshot_name, "would create snapshot before commit");
            info!(path = %entry.path.display(), rate_limit = ?config.rate_limit, "would commit into predecessor");
        } else {
            tool.snapshot_create(&full, &snapshot_name).await?;
            tool.commit(&entry.path, config.rate_limit).await?;
            tokio::fs::remove_file(&entry.path)
                .await
                .map_err(|e| CoreError::filesystem(&entry.path, e))?;
        }
    }

    Ok(RestoreReport {
        mode: RestoreMode::Snapshotrebase,
        entries_processed: entries.len(),
        bootable_tip: full,
    })
}

async fn place_image_symlink(parent: &Path, target: &Path) -> Result<(), CoreError> {
    let link_path = parent.join("image");
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

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(dir: PathBuf, mode: RestoreMode) -> RestoreConfig {
        RestoreConfig {
            dir,
            mode,
            until: None,
            filter: None,
            rate_limit: None,
            target_file: None,
            skip_check: true,
            dry_run: true,
            image_tool_binary: "qemu-img".to_string(),
        }
    }

    #[tokio::test]
    async fn merge_without_targetfile_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = base_config(dir.path().to_path_buf(), RestoreMode::Merge);
        let err = run(config).await.unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn dry_run_rebase_reports_bootable_tip_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("FULL-1-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-2-disk1.qcow2"), b"").await.unwrap();

        let config = base_config(dir.path().to_path_buf(), RestoreMode::Rebase);
        let report = run(config).await.unwrap();

        assert_eq!(report.entries_processed, 2);
        assert_eq!(report.bootable_tip, dir.path().join("INC-2-disk1.qcow2"));
        assert!(!dir.path().join("image").exists());
    }

    #[tokio::test]
    async fn filter_excludes_unmatched_increments_from_the_report() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("FULL-1-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-2-nightly-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-3-disk1.qcow2"), b"").await.unwrap();

        let mut config = base_config(dir.path().to_path_buf(), RestoreMode::Rebase);
        config.filter = Some("nightly".to_string());
        let report = run(config).await.unwrap();

        assert_eq!(report.entries_processed, 2);
        assert_eq!(report.bootable_tip, dir.path().join("INC-2-nightly-disk1.qcow2"));
    }

    #[tokio::test]
    async fn until_truncates_chain_inclusively() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("FULL-1-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-2-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-3-disk1.qcow2"), b"").await.unwrap();

        let mut config = base_config(dir.path().to_path_buf(), RestoreMode::Rebase);
        config.until = Some("INC-2-disk1.qcow2".to_string());
        let report = run(config).await.unwrap();

        assert_eq!(report.entries_processed, 2);
        assert_eq!(report.bootable_tip, dir.path().join("INC-2-disk1.qcow2"));
    }
}
