//! `cleanup --remove-bitmap [--uuid STR]`: deletes the persistent
//! bitmaps this tool created, scoped to one chain UUID when given,
//! otherwise every `qmpbackup-*` bitmap on every device.

use crate::error::CoreError;
use crate::monitor::{Commands, MonitorClient};
use qmpbackup_common::INTERNAL_NODE_PREFIX;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub removed: Vec<(String, String)>,
}

/// Unlike [`crate::device::select_devices`], this walks the raw
/// `query-block` reply directly: cleanup must succeed even when no
/// device is backup-eligible (inserted-empty, read-only, internal
/// nodes still carry leftover bitmaps worth clearing).
pub async fn remove_bitmaps(socket_path: &Path, uuid: Option<Uuid>) -> Result<CleanupReport, CoreError> {
    let client = MonitorClient::connect(socket_path).await?;
    let commands = Commands::new(&client);

    let raw = commands.query_block().await?;

    let mut removed = Vec::new();
    for entry in raw {
        let Some(inserted) = entry.inserted else { continue };
        for bitmap in &inserted.dirty_bitmaps {
            if !bitmap.name.starts_with(INTERNAL_NODE_PREFIX) {
                continue;
            }
            if let Some(uuid) = uuid {
                if !bitmap.name.ends_with(&uuid.to_string()) {
                    continue;
                }
            }
            match commands.block_dirty_bitmap_remove(&inserted.node_name, &bitmap.name).await {
                Ok(()) => {
                    info!(node = %inserted.node_name, bitmap = %bitmap.name, "removed bitmap");
                    removed.push((inserted.node_name.clone(), bitmap.name.clone()));
                }
                Err(e) => {
                    warn!(node = %inserted.node_name, bitmap = %bitmap.name, error = %e, "failed to remove bitmap");
                }
            }
        }
    }

    client.close().await;
    Ok(CleanupReport { removed })
}
