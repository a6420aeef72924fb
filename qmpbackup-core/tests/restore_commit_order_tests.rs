//! `commit`-family restore modes fold data tip-to-FULL. These tests
//! stand in a fake "image tool" binary that only logs its argv, since
//! exercising real `qemu-img` semantics would need actual qcow2 files.
//!
//! Relies on a `/bin/sh` shebang script, so unix-only.
#![cfg(unix)]

use qmpbackup_core::restore::{run, RestoreConfig, RestoreMode};
use std::path::PathBuf;

fn write_fake_tool(dir: &std::path::Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("fake-qemu-img");
    std::fs::write(&script, "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/calls.log\"\nexit 0\n").unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

fn commit_targets(dir: &std::path::Path) -> Vec<String> {
    let log = std::fs::read_to_string(dir.join("calls.log")).unwrap_or_default();
    log.lines()
        .filter(|line| line.starts_with("commit "))
        .map(|line| line.rsplit(' ').next().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn commit_folds_increments_tip_to_full() {
    let dir = tempfile::tempdir().unwrap();
    let full = dir.path().join("FULL-1-disk1.qcow2");
    let inc1 = dir.path().join("INC-2-disk1.qcow2");
    let inc2 = dir.path().join("INC-3-disk1.qcow2");
    tokio::fs::write(&full, b"").await.unwrap();
    tokio::fs::write(&inc1, b"").await.unwrap();
    tokio::fs::write(&inc2, b"").await.unwrap();

    let tool = write_fake_tool(dir.path());
    let config = RestoreConfig {
        dir: dir.path().to_path_buf(),
        mode: RestoreMode::Commit,
        until: None,
        filter: None,
        rate_limit: None,
        target_file: None,
        skip_check: true,
        dry_run: false,
        image_tool_binary: tool.to_string_lossy().to_string(),
    };

    let report = run(config).await.unwrap();
    assert_eq!(report.bootable_tip, full);

    let committed = commit_targets(dir.path());
    assert_eq!(
        committed,
        vec![inc2.to_string_lossy().to_string(), inc1.to_string_lossy().to_string()]
    );

    // The increment files are invalidated by commit and removed; only
    // the collapsed FULL remains.
    assert!(!inc1.exists());
    assert!(!inc2.exists());
    assert!(full.exists());
}

#[tokio::test]
async fn snapshotrebase_also_commits_tip_to_full() {
    let dir = tempfile::tempdir().unwrap();
    let full = dir.path().join("FULL-1-disk1.qcow2");
    let inc1 = dir.path().join("INC-2-disk1.qcow2");
    let inc2 = dir.path().join("INC-3-disk1.qcow2");
    tokio::fs::write(&full, b"").await.unwrap();
    tokio::fs::write(&inc1, b"").await.unwrap();
    tokio::fs::write(&inc2, b"").await.unwrap();

    let tool = write_fake_tool(dir.path());
    let config = RestoreConfig {
        dir: dir.path().to_path_buf(),
        mode: RestoreMode::Snapshotrebase,
        until: None,
        filter: None,
        rate_limit: None,
        target_file: None,
        skip_check: true,
        dry_run: false,
        image_tool_binary: tool.to_string_lossy().to_string(),
    };

    run(config).await.unwrap();

    let committed = commit_targets(dir.path());
    assert_eq!(
        committed,
        vec![inc2.to_string_lossy().to_string(), inc1.to_string_lossy().to_string()]
    );
}
