//! Turns raw `query-block` output into the filtered, backup-eligible
//! device list.

use crate::error::CoreError;
use crate::monitor::commands::RawBlockInfo;
use qmpbackup_common::{BitmapInfo, BlockDevice, ImageFormat, INTERNAL_NODE_PREFIX};
use std::collections::HashSet;

/// Either a whitelist (`include`) or a blacklist (`exclude`) of
/// device/node identifiers; never both.
#[derive(Debug, Clone)]
pub enum DeviceFilter {
    None,
    Include(HashSet<String>),
    Exclude(HashSet<String>),
}

pub struct SelectionOptions {
    pub filter: DeviceFilter,
    pub include_raw: bool,
    pub uuid: uuid::Uuid,
}

/// Rule 1 only: drop inserted-empty devices and internal sentinel
/// nodes, translate the rest into `BlockDevice`s. Shared by
/// `select_devices` (which goes on to apply include/exclude/raw/empty)
/// and by read-only reporting paths (`info --show bitmaps`, cleanup)
/// that want every real device regardless of backup eligibility.
pub fn raw_to_candidates(raw: Vec<RawBlockInfo>, uuid: uuid::Uuid) -> Vec<BlockDevice> {
    let mut candidates = Vec::new();
    for entry in raw {
        let Some(inserted) = entry.inserted else {
            continue; // rule 1: inserted-empty
        };
        if inserted.node_name.starts_with(INTERNAL_NODE_PREFIX) {
            continue; // rule 1: internal fleece/cbw/target nodes
        }
        if inserted.read_only && entry.removable {
            continue; // rule 1: read-only ISOs
        }

        let format = inserted
            .image
            .as_ref()
            .map(|i| ImageFormat::from_monitor_str(&i.format))
            .unwrap_or(ImageFormat::Other);

        let bitmaps: Vec<BitmapInfo> = inserted
            .dirty_bitmaps
            .iter()
            .map(|b| BitmapInfo {
                name: b.name.clone(),
                recording: b.recording,
                persistent: b.persistent,
                granularity: b.granularity,
                busy: b.busy,
            })
            .collect();

        let uuid_suffix = uuid.to_string();
        let has_bitmap = bitmaps
            .iter()
            .any(|b| b.name == qmpbackup_common::bitmap_name(&inserted.node_name, &uuid_suffix));

        candidates.push(BlockDevice {
            node: inserted.node_name.clone(),
            device: entry.device.clone(),
            filename: inserted.file.clone(),
            format,
            virtual_size: inserted.image.as_ref().map(|i| i.virtual_size).unwrap_or(0),
            has_full_backup: false,
            has_bitmap,
            bitmaps,
            qdev: entry.qdev.clone(),
        });
    }
    candidates
}

/// Apply the selection rules in order and return the sorted, eligible device
/// list, or a configuration error naming the offending identifier.
pub fn select_devices(
    raw: Vec<RawBlockInfo>,
    opts: &SelectionOptions,
) -> Result<Vec<BlockDevice>, CoreError> {
    if let DeviceFilter::Include(names) = &opts.filter {
        // Validated below once we know the survivor set; here we only
        // guard against an empty include list, which can never match.
        if names.is_empty() {
            return Err(CoreError::Configuration(
                "--include given with an empty device list".to_string(),
            ));
        }
    }

    let candidates: Vec<BlockDevice> = raw_to_candidates(raw, opts.uuid)
        .into_iter()
        .filter(|d| opts.include_raw || d.format != ImageFormat::Raw) // rule 3
        .collect();

    let selected = match &opts.filter {
        DeviceFilter::None => candidates,
        DeviceFilter::Include(names) => {
            for name in names {
                let exists = candidates
                    .iter()
                    .any(|d| &d.device == name || &d.node == name);
                if !exists {
                    return Err(CoreError::Configuration(format!(
                        "--include names unknown device '{name}'"
                    )));
                }
            }
            candidates
                .into_iter()
                .filter(|d| names.contains(&d.device) || names.contains(&d.node))
                .collect()
        }
        DeviceFilter::Exclude(names) => candidates
            .into_iter()
            .filter(|d| !names.contains(&d.device) && !names.contains(&d.node))
            .collect(),
    };

    if selected.is_empty() {
        return Err(CoreError::Configuration(
            "no backup-eligible devices remain after filtering".to_string(),
        ));
    }

    let mut selected = selected;
    selected.sort_by(|a, b| a.node.cmp(&b.node));
    Ok(selected)
}

/// Reject `include` and `exclude` given together, before the monitor
/// is even contacted.
pub fn parse_filter(
    include: Option<&str>,
    exclude: Option<&str>,
) -> Result<DeviceFilter, CoreError> {
    match (include, exclude) {
        (Some(_), Some(_)) => Err(CoreError::Configuration(
            "--include and --exclude are mutually exclusive".to_string(),
        )),
        (Some(list), None) => Ok(DeviceFilter::Include(split_csv(list))),
        (None, Some(list)) => Ok(DeviceFilter::Exclude(split_csv(list))),
        (None, None) => Ok(DeviceFilter::None),
    }
}

fn split_csv(s: &str) -> HashSet<String> {
    s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::commands::{RawBitmap, RawImageInfo, RawInsertedImage};

    fn device(node: &str, dev: &str, fmt: &str, raw_bitmap_uuid: Option<&str>) -> RawBlockInfo {
        RawBlockInfo {
            device: dev.to_string(),
            qdev: None,
            removable: false,
            inserted: Some(RawInsertedImage {
                node_name: node.to_string(),
                file: format!("/vms/{node}.img"),
                drv: fmt.to_string(),
                image: Some(RawImageInfo { virtual_size: 1024, format: fmt.to_string() }),
                read_only: false,
                dirty_bitmaps: raw_bitmap_uuid
                    .map(|u| {
                        vec![RawBitmap {
                            name: qmpbackup_common::bitmap_name(node, u),
                            recording: true,
                            persistent: true,
                            busy: false,
                            granularity: 65536,
                        }]
                    })
                    .unwrap_or_default(),
            }),
        }
    }

    #[test]
    fn include_and_exclude_together_is_rejected() {
        let err = parse_filter(Some("disk1"), Some("disk2")).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn unknown_include_name_is_rejected() {
        let uuid = uuid::Uuid::new_v4();
        let raw = vec![device("node0", "disk1", "qcow2", None)];
        let opts = SelectionOptions {
            filter: DeviceFilter::Include(["disk2".to_string()].into_iter().collect()),
            include_raw: false,
            uuid,
        };
        let err = select_devices(raw, &opts).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn raw_devices_dropped_unless_opted_in() {
        let uuid = uuid::Uuid::new_v4();
        let raw = vec![
            device("node0", "disk1", "raw", None),
            device("node1", "disk2", "qcow2", None),
        ];
        let opts = SelectionOptions { filter: DeviceFilter::None, include_raw: false, uuid };
        let selected = select_devices(raw, &opts).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].node, "node1");
    }

    #[test]
    fn bitmap_matched_by_uuid_suffix() {
        let uuid = uuid::Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let raw = vec![device("node0", "disk1", "qcow2", Some(&uuid.to_string()))];
        let opts = SelectionOptions { filter: DeviceFilter::None, include_raw: false, uuid };
        let selected = select_devices(raw, &opts).unwrap();
        assert!(selected[0].has_bitmap);
    }

    #[test]
    fn internal_nodes_are_never_selected() {
        let uuid = uuid::Uuid::new_v4();
        let raw = vec![device("qmpbackup-fleece-disk1", "disk1", "qcow2", None)];
        let opts = SelectionOptions { filter: DeviceFilter::None, include_raw: false, uuid };
        let err = select_devices(raw, &opts).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn empty_result_after_filtering_is_rejected() {
        let uuid = uuid::Uuid::new_v4();
        let raw = vec![device("node0", "disk1", "qcow2", None)];
        let opts = SelectionOptions {
            filter: DeviceFilter::Exclude(["disk1".to_string()].into_iter().collect()),
            include_raw: false,
            uuid,
        };
        let err = select_devices(raw, &opts).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }
}
