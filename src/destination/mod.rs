mod ssh;
mod store;

pub use ssh::SshDestination;
pub use store::ObjectStoreDestination;

use crate::backup::{BackupStream, RunScope};
use crate::config::{AppConfig, DestinationKind};
use crate::error::{BackupError, Result};
use crate::status::{RunType, StatusDocument};
use async_trait::async_trait;

/// Durable store for backup artifacts and the status document.
///
/// Artifact names are relative to the destination root and use `/` as
/// separator, e.g. `db01/daily/mysql/mysql-2024-01-01_00_00_00.xbstream.gz`.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Streams an artifact to the destination. `Ok` means the artifact is
    /// durably stored; any error means it must not be recorded.
    async fn save(&self, stream: BackupStream, name: &str) -> Result<()>;

    /// Reads the status document, empty when none has been written yet.
    async fn status(&self) -> Result<StatusDocument>;

    /// Replaces the status document.
    async fn write_status(&self, status: &StatusDocument) -> Result<()>;

    /// Artifacts below `prefix`, sorted.
    async fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    /// Artifacts laid out as `<prefix>/<host>/<run_type>/...`, sorted.
    async fn find_files(&self, prefix: &str, run_type: RunType) -> Result<Vec<String>>;

    async fn delete(&self, name: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Builds the configured destination. Blocking transfers it starts are
/// bound to `scope`.
pub fn create_destination(config: &AppConfig, scope: &RunScope) -> Result<Box<dyn Destination>> {
    let section = config.destination()?;
    let hostname = config.hostname();
    let missing = |name: &str| {
        BackupError::Config(format!(
            "backup_destination is {} but the [{}] section is missing",
            section.backup_destination, name
        ))
    };

    match section.backup_destination {
        DestinationKind::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| missing("s3"))?;
            Ok(Box::new(ObjectStoreDestination::s3(s3, &hostname)?))
        }
        DestinationKind::Local => {
            let local = config.local.as_ref().ok_or_else(|| missing("local"))?;
            Ok(Box::new(ObjectStoreDestination::local(&local.path, &hostname)?))
        }
        DestinationKind::Ssh => {
            let ssh = config.ssh.as_ref().ok_or_else(|| missing("ssh"))?;
            Ok(Box::new(
                SshDestination::new(ssh.clone(), &hostname).with_scope(scope.clone()),
            ))
        }
    }
}

/// Whether `relative` (a name below a listing prefix) sits in the
/// `<host>/<run_type>/` part of the layout.
fn in_run_type(relative: &str, run_type: RunType) -> bool {
    let mut parts = relative.trim_start_matches('/').split('/');
    parts.next().is_some() && parts.next() == Some(run_type.as_str()) && parts.next().is_some()
}

fn join(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}/{}", prefix, name),
    }
}
