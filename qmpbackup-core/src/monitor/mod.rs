//! Monitor transport and typed command facade.

pub mod commands;
pub mod transport;

pub use commands::{BlockdevBackupParams, Commands, RawBlockInfo, RawBlockJob, TransactionAction};
pub use transport::{MonitorClient, MonitorEvent};
