//! Shared presentation-layer plumbing for the backup and restore
//! binaries: logging setup only. All business logic lives in
//! `qmpbackup-core`.

pub mod logging;
