//! `info --show {blockdev,bitmaps}`: read-only reporting over a live
//! monitor connection. Never mutates hypervisor state.

use crate::error::CoreError;
use crate::monitor::{Commands, MonitorClient};
use qmpbackup_common::BlockDevice;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoShow {
    Blockdev,
    Bitmaps,
}

#[derive(Debug, Clone)]
pub enum InfoReport {
    Blockdev(Value),
    Bitmaps(Vec<BlockDevice>),
}

/// Connect to `socket_path`, query what `show` asks for, and
/// disconnect. Device selection uses the same filter-free, include-raw
/// pass as a backup run so every bitmap the hypervisor knows about is
/// visible, not just backup-eligible ones.
pub async fn run(socket_path: &Path, show: InfoShow) -> Result<InfoReport, CoreError> {
    let client = MonitorClient::connect(socket_path).await?;
    let commands = Commands::new(&client);

    let report = match show {
        InfoShow::Blockdev => InfoReport::Blockdev(commands.query_named_block_nodes().await?),
        InfoShow::Bitmaps => {
            let raw = commands.query_block().await?;
            InfoReport::Bitmaps(crate::device::raw_to_candidates(raw, uuid::Uuid::nil()))
        }
    };

    client.close().await;
    Ok(report)
}
