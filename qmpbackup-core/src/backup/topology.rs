//! Builds the in-memory "image fleecing" topology:
//!
//! ```text
//!   guest ──► [CBW filter] ──► original disk node
//!                     │
//!                     └──► fleece (qcow2, temporary)
//!                                  │
//!                                  └──► snapshot-access node ──► [backup job source]
//!                                                                       │
//!                                                                       ▼
//!                                                                  target image
//! ```
//!
//! Node names are deterministic and always carry the
//! `qmpbackup_common::INTERNAL_NODE_PREFIX` sentinel so the device
//! selector never picks them back up on a later run.

use qmpbackup_common::AioMode;
use serde_json::{json, Value};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct NodeNames {
    pub original: String,
    pub fleece: String,
    pub cbw: String,
    pub snapshot_access: String,
    pub target: String,
}

impl NodeNames {
    pub fn for_device(original_node: &str) -> Self {
        Self {
            original: original_node.to_string(),
            fleece: format!("qmpbackup-fleece-{original_node}"),
            cbw: format!("qmpbackup-cbw-{original_node}"),
            snapshot_access: format!("qmpbackup-snap-{original_node}"),
            target: format!("qmpbackup-target-{original_node}"),
        }
    }
}

/// `blockdev-add` options for the fleece qcow2 (already created on
/// disk by the image-tool driver before this call).
pub fn fleece_blockdev_add(names: &NodeNames, fleece_path: &Path) -> Value {
    json!({
        "node-name": names.fleece,
        "driver": "qcow2",
        "file": {
            "driver": "file",
            "filename": fleece_path.to_string_lossy(),
        },
    })
}

/// `blockdev-add` options for the copy-before-write filter, sitting
/// in front of the original node and shunting pre-overwrite blocks
/// into the fleece image.
pub fn cbw_filter_blockdev_add(names: &NodeNames) -> Value {
    json!({
        "node-name": names.cbw,
        "driver": "copy-before-write",
        "file": names.original,
        "target": names.fleece,
    })
}

/// `blockdev-add` options for the read-only snapshot-access node
/// presenting base-plus-fleece as one point-in-time view.
pub fn snapshot_access_blockdev_add(names: &NodeNames) -> Value {
    json!({
        "node-name": names.snapshot_access,
        "driver": "snapshot-access",
        "file": names.cbw,
    })
}

/// `blockdev-add` options for the target image backing the backup
/// job. `FULL`/`copy` targets have no backing file; `INC` targets
/// carry a backing-file pointer so the chain reconstructs later, even
/// though only the delta is written.
pub fn target_blockdev_add(
    names: &NodeNames,
    target_path: &Path,
    backing_file: Option<&Path>,
    aio: AioMode,
    cache_disable: bool,
) -> Value {
    let mut file = json!({
        "driver": "file",
        "filename": target_path.to_string_lossy(),
        "aio": aio.to_string(),
    });
    if cache_disable {
        file["cache"] = json!({ "direct": true, "no-flush": false });
    }
    let mut options = json!({
        "node-name": names.target,
        "driver": "qcow2",
        "file": file,
    });
    if let Some(backing) = backing_file {
        options["backing"] = json!(backing.to_string_lossy());
    }
    options
}

/// `blockdev-reopen` options replacing the device's current top node
/// with the CBW filter, the only way to redirect in-flight guest I/O
/// without racing the guest.
pub fn splice_cbw_reopen(qdev_top_node: &str, names: &NodeNames) -> Vec<Value> {
    vec![json!({
        "node-name": qdev_top_node,
        "driver": "cbw-passthrough",
        "file": names.cbw,
    })]
}

/// `blockdev-reopen` options undoing the splice, restoring the
/// original top node (teardown step 3).
pub fn restore_original_reopen(qdev_top_node: &str, original_driver_options: Value) -> Vec<Value> {
    let mut options = original_driver_options;
    options["node-name"] = json!(qdev_top_node);
    vec![options]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_carry_internal_prefix() {
        let names = NodeNames::for_device("node0");
        assert!(names.fleece.starts_with(qmpbackup_common::INTERNAL_NODE_PREFIX));
        assert!(names.cbw.starts_with(qmpbackup_common::INTERNAL_NODE_PREFIX));
        assert!(names.snapshot_access.starts_with(qmpbackup_common::INTERNAL_NODE_PREFIX));
        assert!(names.target.starts_with(qmpbackup_common::INTERNAL_NODE_PREFIX));
    }

    #[test]
    fn target_blockdev_add_sets_backing_only_for_incrementals() {
        let names = NodeNames::for_device("node0");
        let full = target_blockdev_add(&names, Path::new("/t/FULL-1-d.qcow2"), None, AioMode::Threads, false);
        assert!(full.get("backing").is_none());

        let inc = target_blockdev_add(
            &names,
            Path::new("/t/INC-2-d.qcow2"),
            Some(Path::new("/t/FULL-1-d.qcow2")),
            AioMode::IoUring,
            true,
        );
        assert_eq!(inc["backing"], "/t/FULL-1-d.qcow2");
        assert_eq!(inc["file"]["aio"], "io_uring");
    }
}
