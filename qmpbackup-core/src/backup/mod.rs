//! Backup orchestrator: the pre-run gates, topology construction, the
//! single atomic job-start transaction, completion tracking, and the
//! fixed best-effort teardown sequence.

pub mod progress;
pub mod topology;

use crate::cancel::CancellationToken;
use crate::device::{select_devices, DeviceFilter, SelectionOptions};
use crate::error::CoreError;
use crate::guest_agent::GuestAgentClient;
use crate::layout::{
    device_directory, final_path, finalize_rename, has_full_backup, monthly_rollover, partial_path, place_symlink,
    read_uuid, reject_if_partial_present_recursive, target_stem, write_uuid, NamingOptions,
};
use crate::monitor::commands::{BlockdevBackupParams, TransactionAction};
use crate::monitor::{Commands, MonitorClient};
use crate::tool::ImageToolDriver;
use qmpbackup_common::{bitmap_name, copy_bitmap_name, AioMode, BackupLevel, BlockDevice, ImageFormat, ResolvedLevel, INTERNAL_NODE_PREFIX};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use topology::{cbw_filter_blockdev_add, fleece_blockdev_add, restore_original_reopen, snapshot_access_blockdev_add, splice_cbw_reopen, target_blockdev_add, NodeNames};
use tracing::{info, warn};
use uuid::Uuid;

/// Everything a run needs to decide what to back up and how.
#[derive(Debug, Clone)]
pub struct BackupRunConfig {
    pub level: BackupLevel,
    pub monitor_socket: PathBuf,
    pub agent_socket: Option<PathBuf>,
    pub target_root: PathBuf,
    pub filter: DeviceFilter,
    pub include_raw: bool,
    pub quiesce: bool,
    pub compress: bool,
    pub speed: u64,
    pub uuid_override: Option<Uuid>,
    pub aio: AioMode,
    pub cache_disable: bool,
    pub naming: NamingOptions,
    pub image_tool_binary: String,
    pub progress_interval: Duration,
    pub job_timeout: Duration,
    /// Final suspension point: how long to sleep after a successful
    /// rename before the run returns, giving a caller that polls the
    /// target directory (e.g. a retention sweep) a settling window.
    pub remove_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceOutcome {
    pub device: String,
    pub node: String,
    pub target: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackupRunReport {
    pub uuid: Uuid,
    pub epoch: i64,
    pub resolved_level: ResolvedLevel,
    pub devices: Vec<DeviceOutcome>,
}

/// Per-device working state, built up as topology is constructed and
/// consulted again, in reverse, by teardown. Every `*_created` flag
/// guards one teardown step so a run that fails halfway only tears
/// down what it actually built.
struct DevicePlan {
    device: BlockDevice,
    names: NodeNames,
    dir: PathBuf,
    partial: PathBuf,
    final_file: PathBuf,
    fleece_path: PathBuf,
    bitmap_name: String,
    job_id: String,
    original_reopen_options: Value,
    fleece_created: bool,
    cbw_created: bool,
    snapshot_access_created: bool,
    target_created: bool,
    spliced: bool,
}

/// Run one backup of `config.level` against every device the filter
/// selects. On success, every `.partial` target has been renamed to
/// its final name and teardown has already run; on any failure,
/// teardown has already run and the error describes the first cause.
pub async fn run(config: BackupRunConfig, cancel: CancellationToken) -> Result<BackupRunReport, CoreError> {
    if matches!(config.level, BackupLevel::Copy) && config.include_raw {
        return Err(CoreError::Configuration(
            "--include-raw is not allowed with --level copy".to_string(),
        ));
    }

    reject_if_partial_present_recursive(&config.target_root).await?;

    let epoch = chrono::Utc::now().timestamp();
    let existing_uuid = read_uuid(&config.target_root).await?;
    let rolled_over = config.naming.monthly && monthly_rollover(&config.target_root, epoch).await;

    let resolved_level = resolve_level(config.level, existing_uuid.is_some() && !rolled_over);

    let uuid = match resolved_level {
        ResolvedLevel::Full => {
            let uuid = existing_uuid.unwrap_or_else(|| config.uuid_override.unwrap_or_else(Uuid::new_v4));
            if existing_uuid.is_none() {
                write_uuid(&config.target_root, &uuid).await?;
            }
            uuid
        }
        ResolvedLevel::Inc => existing_uuid.ok_or_else(|| {
            CoreError::Configuration("level=inc requested but no prior full backup chain exists".to_string())
        })?,
        ResolvedLevel::Copy => config.uuid_override.unwrap_or_else(Uuid::new_v4),
    };

    info!(level = %resolved_level.file_prefix(), %uuid, epoch, "starting backup run");

    let client = MonitorClient::connect(&config.monitor_socket).await?;
    let commands = Commands::new(&client);
    let guest_agent = config.agent_socket.as_deref().map(GuestAgentClient::new);

    let mut frozen = false;
    if config.quiesce {
        if let Some(agent) = &guest_agent {
            frozen = agent.freeze().await;
        }
    }

    let mut plans: Vec<DevicePlan> = Vec::new();
    let run_result = run_inner(&config, &client, &commands, resolved_level, uuid, epoch, &cancel, &mut plans).await;

    let signal_caught = cancel.is_cancelled();
    if let Some(agent) = &guest_agent {
        agent.thaw().await;
    }
    let _ = frozen; // only gates whether freeze was attempted, not whether thaw runs

    let finalize = run_result.is_ok() && !signal_caught;
    finish_run(&config, &commands, resolved_level, &plans, finalize).await?;
    client.close().await;

    run_result?;
    if signal_caught {
        return Err(CoreError::SignalCaught);
    }

    if !config.remove_delay.is_zero() {
        tokio::time::sleep(config.remove_delay).await;
    }

    let devices = plans
        .iter()
        .map(|p| DeviceOutcome {
            device: p.device.device.clone(),
            node: p.device.node.clone(),
            target: p.final_file.clone(),
        })
        .collect();
    Ok(BackupRunReport { uuid, epoch, resolved_level, devices })
}

/// `auto` collapses to `full` the first time a chain starts (no
/// `uuid` file yet) and to `inc` every time after.
fn resolve_level(requested: BackupLevel, has_existing_uuid: bool) -> ResolvedLevel {
    match requested {
        BackupLevel::Full => ResolvedLevel::Full,
        BackupLevel::Inc => ResolvedLevel::Inc,
        BackupLevel::Copy => ResolvedLevel::Copy,
        BackupLevel::Auto => {
            if has_existing_uuid {
                ResolvedLevel::Inc
            } else {
                ResolvedLevel::Full
            }
        }
    }
}

/// Device selection, pre-run gates, topology construction, and the
/// transactional job start. Teardown always runs afterwards in the
/// caller regardless of how this returns.
async fn run_inner(
    config: &BackupRunConfig,
    client: &MonitorClient,
    commands: &Commands<'_>,
    resolved_level: ResolvedLevel,
    uuid: Uuid,
    epoch: i64,
    cancel: &CancellationToken,
    plans: &mut Vec<DevicePlan>,
) -> Result<(), CoreError> {
    let raw = commands.query_block().await?;
    let opts = SelectionOptions {
        filter: config.filter.clone(),
        include_raw: config.include_raw,
        uuid,
    };
    let devices = select_devices(raw, &opts)?;

    if config.compress {
        if let Some(raw_device) = devices.iter().find(|d| d.format == ImageFormat::Raw) {
            return Err(CoreError::Configuration(format!(
                "--compress cannot be combined with a raw target ({})",
                raw_device.device
            )));
        }
    }

    let tool = ImageToolDriver::new(config.image_tool_binary.clone());
    plans.reserve(devices.len());

    for device in &devices {
        let dir = device_directory(&config.target_root, device, &config.naming, epoch);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::filesystem(&dir, e))?;

        match resolved_level {
            ResolvedLevel::Inc => {
                if !has_full_backup(&dir).await? {
                    return Err(CoreError::Configuration(format!(
                        "device {} has no prior full backup in {}",
                        device.device,
                        dir.display()
                    )));
                }
                let bitmap = device.bitmap_for_uuid(&uuid).ok_or_else(|| {
                    CoreError::Configuration(format!(
                        "device {} has no recording bitmap for chain {uuid}",
                        device.device
                    ))
                })?;
                if !bitmap.recording || bitmap.busy {
                    return Err(CoreError::Configuration(format!(
                        "device {} bitmap is not in a usable state (recording={}, busy={})",
                        device.device, bitmap.recording, bitmap.busy
                    )));
                }
            }
            ResolvedLevel::Full | ResolvedLevel::Copy => {}
        }

        let basename = device.directory_name().to_string();
        let stem = target_stem(resolved_level, epoch, &basename);
        let partial = partial_path(&dir, &stem);
        let final_file = final_path(&dir, &stem);
        let fleece_path = dir.join(format!("{stem}.fleece.qcow2"));

        let names = NodeNames::for_device(&device.node);
        let bitmap = match resolved_level {
            ResolvedLevel::Copy => copy_bitmap_name(&device.node),
            ResolvedLevel::Full | ResolvedLevel::Inc => bitmap_name(&device.node, &uuid.to_string()),
        };
        let job_id = format!("{INTERNAL_NODE_PREFIX}job-{}", device.node);

        let original_reopen_options = json!({
            "driver": device.format.to_string(),
            "file": { "driver": "file", "filename": device.filename },
        });

        plans.push(DevicePlan {
            device: device.clone(),
            names,
            dir,
            partial,
            final_file,
            fleece_path,
            bitmap_name: bitmap,
            job_id,
            original_reopen_options,
            fleece_created: false,
            cbw_created: false,
            snapshot_access_created: false,
            target_created: false,
            spliced: false,
        });
    }

    for plan in plans.iter_mut() {
        tool.create_qcow2(&plan.fleece_path, None, None).await?;
        plan.fleece_created = true;

        commands.blockdev_add(fleece_blockdev_add(&plan.names, &plan.fleece_path)).await?;
        commands.blockdev_add(cbw_filter_blockdev_add(&plan.names)).await?;
        plan.cbw_created = true;

        commands.blockdev_add(snapshot_access_blockdev_add(&plan.names)).await?;
        plan.snapshot_access_created = true;

        let backing = if resolved_level == ResolvedLevel::Inc {
            latest_chain_file(&plan.dir).await?
        } else {
            None
        };
        commands
            .blockdev_add(target_blockdev_add(
                &plan.names,
                &plan.partial,
                backing.as_deref(),
                config.aio,
                config.cache_disable,
            ))
            .await?;
        plan.target_created = true;

        commands.blockdev_reopen(splice_cbw_reopen(&plan.device.node, &plan.names)).await?;
        plan.spliced = true;
    }

    let mut actions = Vec::new();
    for plan in plans.iter() {
        let profile = resolved_level.profile();
        if !profile.reuses_existing_bitmap {
            actions.push(TransactionAction::block_dirty_bitmap_add(
                &plan.device.node,
                &plan.bitmap_name,
                profile.persistent_bitmap,
            ));
        }
        actions.push(TransactionAction::blockdev_backup(BlockdevBackupParams {
            device: plan.names.snapshot_access.clone(),
            target: plan.names.target.clone(),
            sync: profile.sync_mode,
            bitmap: Some(plan.bitmap_name.clone()),
            bitmap_mode: if profile.clear_bitmap_on_success { Some("on-success") } else { None },
            job_id: plan.job_id.clone(),
            compress: config.compress,
            speed: config.speed,
            auto_finalize: false,
            auto_dismiss: false,
        }));
    }
    commands.transaction(actions).await?;

    let progress_handle = progress::spawn(client.clone(), config.progress_interval, cancel.clone());

    // On a caught signal, force-cancel every in-flight job whose device
    // name carries the reserved prefix before teardown runs.
    let cancel_watcher = {
        let client = client.clone();
        let cancel = cancel.clone();
        let job_ids: Vec<String> = plans.iter().map(|p| p.job_id.clone()).collect();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let commands = Commands::new(&client);
            for job_id in &job_ids {
                if let Err(e) = commands.block_job_cancel(job_id, true).await {
                    warn!(%job_id, error = %e, "failed to cancel in-flight backup job after signal");
                }
            }
        })
    };

    let mut awaiters = Vec::with_capacity(plans.len());
    for plan in plans.iter() {
        let client = client.clone();
        let job_id = plan.job_id.clone();
        let device_name = plan.device.device.clone();
        let cancel = cancel.clone();
        let timeout = config.job_timeout;
        awaiters.push(tokio::spawn(async move {
            let commands = Commands::new(&client);
            await_job_completion(&client, &commands, &job_id, &device_name, timeout, &cancel).await
        }));
    }

    let mut first_error = None;
    for awaiter in awaiters {
        match awaiter.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_error.get_or_insert(e),
            Err(_) => first_error.get_or_insert(CoreError::Transport("job awaiter task panicked".to_string())),
        };
    }
    progress_handle.abort();
    cancel_watcher.abort();

    if let Some(e) = first_error {
        return Err(e);
    }

    Ok(())
}

/// Race a job's lifecycle events against cancellation: finalize once
/// it parks in `pending`, then wait for the terminal event.
async fn await_job_completion(
    client: &MonitorClient,
    commands: &Commands<'_>,
    job_id: &str,
    device_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), CoreError> {
    // Subscribed once, outside the loop: a fresh subscription per
    // iteration would open a window between `job_finalize` returning
    // and the re-subscribe where a terminal event fires and is lost,
    // since a broadcast receiver never replays messages sent before it
    // existed. Every event this job can produce is read off the same
    // receiver and classified in one place, rather than racing one
    // subscription per event name, since a single receiver can't be
    // borrowed mutably by more than one in-flight future at a time.
    let mut events = client.subscribe_events();
    loop {
        let next_event = async {
            loop {
                match events.recv().await {
                    Ok(ev) => return Ok(ev),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CoreError::Transport("event channel closed".to_string()))
                    }
                }
            }
        };

        let ev = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::SignalCaught),
            res = tokio::time::timeout(timeout, next_event) => {
                res.map_err(|_| CoreError::Transport("timed out waiting for job event".to_string()))??
            }
        };

        let matches_job = ev.data.get("id").and_then(Value::as_str) == Some(job_id)
            || ev.data.get("device").and_then(Value::as_str) == Some(job_id);
        if !matches_job {
            continue;
        }

        match ev.event.as_str() {
            "JOB_STATUS_CHANGE" if ev.data.get("status").and_then(Value::as_str) == Some("pending") => {
                commands.job_finalize(job_id).await?;
            }
            "BLOCK_JOB_COMPLETED" => return Ok(()),
            "BLOCK_JOB_CANCELLED" => {
                return Err(CoreError::JobFailed {
                    device: device_name.to_string(),
                    reason: "job cancelled".to_string(),
                });
            }
            "BLOCK_JOB_ERROR" => {
                let reason = ev.data.get("msg").and_then(Value::as_str).unwrap_or("unknown error").to_string();
                return Err(CoreError::JobFailed { device: device_name.to_string(), reason });
            }
            _ => continue,
        }
    }
}

/// Latest non-`.partial` target file in `dir`, by embedded epoch, used
/// as the backing file for the next incremental.
async fn latest_chain_file(dir: &std::path::Path) -> Result<Option<PathBuf>, CoreError> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoreError::filesystem(dir, e)),
    };
    let mut best: Option<(i64, PathBuf)> = None;
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| CoreError::filesystem(dir, e))? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".qcow2") {
            continue;
        }
        let Some(epoch) = name.split('-').nth(1).and_then(|s| s.parse::<i64>().ok()) else {
            continue;
        };
        if best.as_ref().map(|(e, _)| epoch > *e).unwrap_or(true) {
            best = Some((epoch, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Tear down everything the run built, in the fixed order, continuing
/// past individual failures, then finalize the target files when
/// `finalize` is set. Runs exactly once regardless of whether
/// `run_inner` succeeded; a `.partial` left behind by a failed or
/// interrupted run is left in place deliberately, as the sentinel the
/// next run's pre-flight check looks for.
async fn finish_run(
    config: &BackupRunConfig,
    commands: &Commands<'_>,
    resolved_level: ResolvedLevel,
    plans: &[DevicePlan],
    finalize: bool,
) -> Result<(), CoreError> {
    for plan in plans {
        if plan.snapshot_access_created {
            if let Err(e) = commands.blockdev_del(&plan.names.snapshot_access).await {
                warn!(device = %plan.device.device, error = %e, "teardown: failed to remove snapshot-access node");
            }
        }
    }

    for plan in plans {
        if plan.spliced {
            if let Err(e) = commands
                .blockdev_reopen(restore_original_reopen(&plan.device.node, plan.original_reopen_options.clone()))
                .await
            {
                warn!(device = %plan.device.device, error = %e, "teardown: failed to restore original top node");
            }
        }
    }

    for plan in plans {
        if plan.cbw_created {
            if let Err(e) = commands.blockdev_del(&plan.names.cbw).await {
                warn!(device = %plan.device.device, error = %e, "teardown: failed to remove CBW filter node");
            }
        }
    }

    for plan in plans {
        if plan.target_created {
            if let Err(e) = commands.blockdev_del(&plan.names.target).await {
                warn!(device = %plan.device.device, error = %e, "teardown: failed to remove target blockdev");
            }
        }
    }

    for plan in plans {
        if plan.fleece_created {
            if let Err(e) = commands.blockdev_del(&plan.names.fleece).await {
                warn!(device = %plan.device.device, error = %e, "teardown: failed to remove fleece blockdev");
            }
            if let Err(e) = tokio::fs::remove_file(&plan.fleece_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(device = %plan.device.device, error = %e, "teardown: failed to unlink fleece image");
                }
            }
        }
    }

    if resolved_level == ResolvedLevel::Copy {
        for plan in plans {
            if let Err(e) = commands.block_dirty_bitmap_remove(&plan.device.node, &plan.bitmap_name).await {
                warn!(device = %plan.device.device, error = %e, "teardown: failed to remove copy bitmap");
            }
        }
    }

    if !finalize {
        return Ok(());
    }

    for plan in plans {
        finalize_rename(&plan.partial, &plan.final_file).await?;
        if !config.naming.no_symlink && matches!(resolved_level, ResolvedLevel::Full | ResolvedLevel::Copy) {
            place_symlink(&plan.dir, &plan.device.directory_name().to_string(), &plan.final_file).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_resolves_full_on_first_run_and_inc_after() {
        assert_eq!(resolve_level(BackupLevel::Auto, false), ResolvedLevel::Full);
        assert_eq!(resolve_level(BackupLevel::Auto, true), ResolvedLevel::Inc);
    }

    #[test]
    fn explicit_levels_pass_through_unchanged() {
        assert_eq!(resolve_level(BackupLevel::Full, true), ResolvedLevel::Full);
        assert_eq!(resolve_level(BackupLevel::Inc, false), ResolvedLevel::Inc);
        assert_eq!(resolve_level(BackupLevel::Copy, true), ResolvedLevel::Copy);
    }

    #[tokio::test]
    async fn latest_chain_file_picks_highest_epoch() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("FULL-100-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-200-disk1.qcow2"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("INC-150-disk1.qcow2.partial"), b"").await.unwrap();
        let latest = latest_chain_file(dir.path()).await.unwrap().unwrap();
        assert_eq!(latest.file_name().unwrap(), "INC-200-disk1.qcow2");
    }

    #[tokio::test]
    async fn latest_chain_file_is_none_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(latest_chain_file(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn monthly_rollover_forces_auto_back_to_full_even_with_an_existing_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        write_uuid(dir.path(), &uuid).await.unwrap();

        let epoch = 1_700_000_000; // 2023-11, no YYYY-MM directory created yet
        let rolled_over = monthly_rollover(dir.path(), epoch).await;
        assert!(rolled_over);
        assert_eq!(resolve_level(BackupLevel::Auto, true && !rolled_over), ResolvedLevel::Full);

        tokio::fs::create_dir_all(crate::layout::month_dir(dir.path(), epoch)).await.unwrap();
        let rolled_over = monthly_rollover(dir.path(), epoch).await;
        assert!(!rolled_over);
        assert_eq!(resolve_level(BackupLevel::Auto, true && !rolled_over), ResolvedLevel::Inc);
    }
}
