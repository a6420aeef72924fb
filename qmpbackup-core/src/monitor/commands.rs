//! Typed wrappers over the monitor verbs the orchestrator relies on.
//! Everything the facade needs from `query-block` is deserialized here
//! and handed to `crate::device` for filtering.

use super::transport::MonitorClient;
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Raw `query-block` entry (one per bus-attached drive, inserted or
/// not).
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlockInfo {
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub qdev: Option<String>,
    #[serde(default)]
    pub removable: bool,
    #[serde(default)]
    pub inserted: Option<RawInsertedImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawInsertedImage {
    #[serde(rename = "node-name", default)]
    pub node_name: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub drv: String,
    #[serde(default)]
    pub image: Option<RawImageInfo>,
    #[serde(rename = "ro", default)]
    pub read_only: bool,
    #[serde(rename = "dirty-bitmaps", default)]
    pub dirty_bitmaps: Vec<RawBitmap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawImageInfo {
    #[serde(rename = "virtual-size", default)]
    pub virtual_size: u64,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBitmap {
    pub name: String,
    #[serde(default)]
    pub recording: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub granularity: u64,
}

/// Raw `query-block-jobs` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlockJob {
    pub device: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub len: u64,
    pub offset: u64,
    #[serde(default)]
    pub speed: u64,
    pub busy: bool,
    pub paused: bool,
}

/// One action inside a QMP `transaction`.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionAction {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
}

impl TransactionAction {
    pub fn block_dirty_bitmap_add(node: &str, name: &str, persistent: bool) -> Self {
        Self {
            kind: "block-dirty-bitmap-add".to_string(),
            data: json!({ "node": node, "name": name, "persistent": persistent }),
        }
    }

    pub fn block_dirty_bitmap_clear(node: &str, name: &str) -> Self {
        Self {
            kind: "block-dirty-bitmap-clear".to_string(),
            data: json!({ "node": node, "name": name }),
        }
    }

    pub fn block_dirty_bitmap_remove(node: &str, name: &str) -> Self {
        Self {
            kind: "block-dirty-bitmap-remove".to_string(),
            data: json!({ "node": node, "name": name }),
        }
    }

    pub fn blockdev_backup(params: BlockdevBackupParams) -> Self {
        Self {
            kind: "blockdev-backup".to_string(),
            data: serde_json::to_value(params).expect("BlockdevBackupParams always serializes"),
        }
    }
}

/// Parameters for `blockdev-backup`.
#[derive(Debug, Clone, Serialize)]
pub struct BlockdevBackupParams {
    pub device: String,
    pub target: String,
    pub sync: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<String>,
    #[serde(rename = "bitmap-mode", skip_serializing_if = "Option::is_none")]
    pub bitmap_mode: Option<&'static str>,
    pub job_id: String,
    pub compress: bool,
    pub speed: u64,
    #[serde(rename = "auto-finalize")]
    pub auto_finalize: bool,
    #[serde(rename = "auto-dismiss")]
    pub auto_dismiss: bool,
}

/// Typed monitor command facade.
pub struct Commands<'a> {
    client: &'a MonitorClient,
}

impl<'a> Commands<'a> {
    pub fn new(client: &'a MonitorClient) -> Self {
        Self { client }
    }

    pub async fn query_block(&self) -> Result<Vec<RawBlockInfo>, CoreError> {
        let value = self.client.send_raw("query-block", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn query_block_jobs(&self) -> Result<Vec<RawBlockJob>, CoreError> {
        let value = self.client.send_raw("query-block-jobs", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn query_version(&self) -> Result<Value, CoreError> {
        self.client.send_raw("query-version", None).await
    }

    /// Full named block-node graph, used by `info --show blockdev` to
    /// print the topology without reconstructing it from `query-block`
    /// alone.
    pub async fn query_named_block_nodes(&self) -> Result<Value, CoreError> {
        self.client.send_raw("query-named-block-nodes", None).await
    }

    pub async fn query_name(&self) -> Result<Option<String>, CoreError> {
        let value = self.client.send_raw("query-name", None).await?;
        Ok(value.get("name").and_then(|v| v.as_str()).map(str::to_string))
    }

    pub async fn query_status(&self) -> Result<Value, CoreError> {
        self.client.send_raw("query-status", None).await
    }

    pub async fn block_dirty_bitmap_add(
        &self,
        node: &str,
        name: &str,
        persistent: bool,
    ) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-dirty-bitmap-add",
                Some(json!({ "node": node, "name": name, "persistent": persistent })),
            )
            .await?;
        Ok(())
    }

    pub async fn block_dirty_bitmap_remove(&self, node: &str, name: &str) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-dirty-bitmap-remove",
                Some(json!({ "node": node, "name": name })),
            )
            .await?;
        Ok(())
    }

    pub async fn block_dirty_bitmap_clear(&self, node: &str, name: &str) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-dirty-bitmap-clear",
                Some(json!({ "node": node, "name": name })),
            )
            .await?;
        Ok(())
    }

    pub async fn block_dirty_bitmap_disable(&self, node: &str, name: &str) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-dirty-bitmap-disable",
                Some(json!({ "node": node, "name": name })),
            )
            .await?;
        Ok(())
    }

    pub async fn block_dirty_bitmap_enable(&self, node: &str, name: &str) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-dirty-bitmap-enable",
                Some(json!({ "node": node, "name": name })),
            )
            .await?;
        Ok(())
    }

    pub async fn blockdev_add(&self, options: Value) -> Result<(), CoreError> {
        self.client.send_raw("blockdev-add", Some(options)).await?;
        Ok(())
    }

    pub async fn blockdev_del(&self, node_name: &str) -> Result<(), CoreError> {
        self.client
            .send_raw("blockdev-del", Some(json!({ "node-name": node_name })))
            .await?;
        Ok(())
    }

    /// Atomically replace the top node of `device` with `new_node`.
    pub async fn blockdev_reopen(&self, options: Vec<Value>) -> Result<(), CoreError> {
        self.client
            .send_raw("blockdev-reopen", Some(json!({ "options": options })))
            .await?;
        Ok(())
    }

    pub async fn blockdev_backup(&self, params: BlockdevBackupParams) -> Result<(), CoreError> {
        let value = serde_json::to_value(params)?;
        self.client.send_raw("blockdev-backup", Some(value)).await?;
        Ok(())
    }

    pub async fn block_job_cancel(&self, device: &str, force: bool) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-job-cancel",
                Some(json!({ "device": device, "force": force })),
            )
            .await?;
        Ok(())
    }

    pub async fn block_job_set_speed(&self, device: &str, speed: u64) -> Result<(), CoreError> {
        self.client
            .send_raw(
                "block-job-set-speed",
                Some(json!({ "device": device, "speed": speed })),
            )
            .await?;
        Ok(())
    }

    /// Move a job out of its `pending` phase once `auto-finalize=false`
    /// has let it park there.
    pub async fn job_finalize(&self, job_id: &str) -> Result<(), CoreError> {
        self.client
            .send_raw("job-finalize", Some(json!({ "id": job_id })))
            .await?;
        Ok(())
    }

    /// Dismiss a `concluded` job so it drops out of `query-jobs`.
    pub async fn job_dismiss(&self, job_id: &str) -> Result<(), CoreError> {
        self.client
            .send_raw("job-dismiss", Some(json!({ "id": job_id })))
            .await?;
        Ok(())
    }

    /// Run a mixed sequence of atomic verbs as one `transaction`.
    /// Aborts atomically on any single failure.
    pub async fn transaction(&self, actions: Vec<TransactionAction>) -> Result<(), CoreError> {
        let value = json!({ "actions": actions });
        self.client.send_raw("transaction", Some(value)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_block_with_bitmaps() {
        let raw = serde_json::json!([{
            "device": "drive0",
            "qdev": "/machine/peripheral/drive0/virtio-backend",
            "removable": false,
            "inserted": {
                "node-name": "node0",
                "file": "/var/lib/vms/disk.qcow2",
                "drv": "qcow2",
                "ro": false,
                "image": { "virtual-size": 1073741824u64, "format": "qcow2" },
                "dirty-bitmaps": [
                    { "name": "qmpbackup-drive0-abc", "recording": true, "persistent": true, "busy": false, "granularity": 65536 }
                ]
            }
        }]);
        let parsed: Vec<RawBlockInfo> = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.len(), 1);
        let inserted = parsed[0].inserted.as_ref().unwrap();
        assert_eq!(inserted.dirty_bitmaps.len(), 1);
        assert_eq!(inserted.dirty_bitmaps[0].name, "qmpbackup-drive0-abc");
    }

    #[test]
    fn transaction_action_serializes_type_and_data() {
        let action = TransactionAction::block_dirty_bitmap_add("node0", "bm0", true);
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "block-dirty-bitmap-add");
        assert_eq!(value["data"]["node"], "node0");
        assert_eq!(value["data"]["persistent"], true);
    }
}
