//! Background progress tracker. Purely observational — cancelling or
//! losing this task never affects correctness of the backup itself.

use crate::cancel::CancellationToken;
use crate::monitor::MonitorClient;
use std::time::Duration;
use tracing::info;

/// Poll `query-block-jobs` every `interval` and log per-job
/// throughput, until `cancel` fires. Spawned as a detached background
/// task by the orchestrator and aborted (not awaited) at job
/// completion.
pub fn spawn(client: MonitorClient, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let commands = crate::monitor::Commands::new(&client);
        let mut last_offsets: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let jobs = match commands.query_block_jobs().await {
                Ok(jobs) => jobs,
                Err(_) => return, // monitor gone; orchestrator owns reporting that failure
            };

            for job in jobs {
                let previous = last_offsets.insert(job.device.clone(), job.offset);
                let delta = previous.map(|p| job.offset.saturating_sub(p)).unwrap_or(0);
                let throughput_mb_s = (delta as f64 / interval.as_secs_f64()) / (1024.0 * 1024.0);
                let pct = if job.len > 0 {
                    (job.offset as f64 / job.len as f64) * 100.0
                } else {
                    0.0
                };
                info!(
                    device = %job.device,
                    progress_pct = format!("{pct:.1}"),
                    throughput_mb_s = format!("{throughput_mb_s:.2}"),
                    "backup job progress"
                );
            }
        }
    })
}
