mod file;
mod mysql;

pub use file::FileSource;
pub use mysql::{parse_xtrabackup_log, snapshot_config, BackupPlan, MysqlSource, XtrabackupLog};

use crate::backup::BackupStream;
use crate::config::RetentionPolicy;
use crate::destination::Destination;
use crate::error::Result;
use crate::status::{BackupKind, ConfigSnapshot, RunType, StatusDocument};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Timestamp format embedded in artifact names.
pub const NAME_TIMESTAMP: &str = "%Y-%m-%d_%H_%M_%S";

pub fn name_timestamp(at: DateTime<Utc>) -> String {
    at.format(NAME_TIMESTAMP).to_string()
}

/// What a source learned about the data it captured, known once its stream
/// has been fully consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMetadata {
    pub kind: BackupKind,
    pub parent: Option<String>,
    pub binlog_file: Option<String>,
    pub binlog_position: Option<u64>,
    pub lsn: Option<u64>,
    pub config: Vec<ConfigSnapshot>,
    pub wsrep_provider_version: Option<String>,
}

/// One backup unit.
#[async_trait]
pub trait Source: Send {
    /// Artifact base name, before any modifier suffix.
    fn name(&self) -> &str;

    async fn get_stream(&mut self) -> Result<BackupStream>;

    /// Called after the artifact has been saved. Sources that do not keep
    /// records in the status document return `None`.
    async fn finish(&mut self) -> Result<Option<CaptureMetadata>>;

    /// Deletes expired artifacts of `run_type` from `dst`. Sources that
    /// keep records get the current status document and return it pruned.
    async fn apply_retention_policy(
        &self,
        dst: &dyn Destination,
        policy: &RetentionPolicy,
        run_type: RunType,
        status: Option<StatusDocument>,
    ) -> Result<Option<StatusDocument>>;
}
