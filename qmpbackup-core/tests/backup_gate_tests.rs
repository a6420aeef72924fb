//! Pre-run gate behavior: every one of these must reject before
//! `backup::run` ever dials the monitor socket, so each test points
//! `monitor_socket` at a path nothing listens on and asserts the
//! failure is the gate's own error, not a transport error.

use qmpbackup_core::backup::{run, BackupRunConfig};
use qmpbackup_core::cancel::CancellationToken;
use qmpbackup_core::device::DeviceFilter;
use qmpbackup_core::layout::NamingOptions;
use qmpbackup_core::CoreError;
use qmpbackup_common::{AioMode, BackupLevel};
use std::path::PathBuf;
use std::time::Duration;

fn base_config(target_root: PathBuf) -> BackupRunConfig {
    BackupRunConfig {
        level: BackupLevel::Full,
        monitor_socket: PathBuf::from("/nonexistent/qmpbackup-test.sock"),
        agent_socket: None,
        target_root,
        filter: DeviceFilter::None,
        include_raw: false,
        quiesce: false,
        compress: false,
        speed: 0,
        uuid_override: None,
        aio: AioMode::Threads,
        cache_disable: false,
        naming: NamingOptions {
            no_subdir: false,
            no_timestamp: false,
            no_symlink: false,
            monthly: false,
        },
        image_tool_binary: "qemu-img".to_string(),
        progress_interval: Duration::from_secs(5),
        job_timeout: Duration::from_secs(3600),
        remove_delay: Duration::ZERO,
    }
}

#[tokio::test]
async fn include_raw_with_copy_level_is_rejected_before_monitor_connect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.level = BackupLevel::Copy;
    config.include_raw = true;

    let err = run(config, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
}

#[tokio::test]
async fn stray_partial_anywhere_under_target_blocks_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let disk_dir = dir.path().join("disk2");
    tokio::fs::create_dir_all(&disk_dir).await.unwrap();
    tokio::fs::write(disk_dir.join("FULL-bar.qcow2.partial"), b"").await.unwrap();

    let config = base_config(dir.path().to_path_buf());
    let err = run(config, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CoreError::Chain(_)));
}

#[tokio::test]
async fn inc_with_no_existing_chain_is_rejected_before_monitor_connect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path().to_path_buf());
    config.level = BackupLevel::Inc;

    let err = run(config, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
}
