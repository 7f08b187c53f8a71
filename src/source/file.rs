use super::{name_timestamp, CaptureMetadata, Source, NAME_TIMESTAMP};
use crate::backup::{BackupStream, Process};
use crate::config::RetentionPolicy;
use crate::destination::Destination;
use crate::error::{BackupError, Result};
use crate::status::{RunType, StatusDocument};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info};

/// A local directory captured as a tar stream.
pub struct FileSource {
    path: PathBuf,
    dir: String,
    prefix: String,
    name: String,
}

/// `/var/www/` becomes `_var_www`.
fn sanitize(path: &Path) -> String {
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches('/');
    let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
    trimmed.replace('/', "_")
}

impl FileSource {
    pub fn new(path: &Path, run_type: RunType, hostname: &str) -> Self {
        let dir = format!("{}/{}/files", hostname, run_type);
        let prefix = format!("{}/{}", dir, sanitize(path));
        let name = format!("{}-{}.tar", prefix, name_timestamp(Utc::now()));
        Self {
            path: path.to_path_buf(),
            dir,
            prefix,
            name,
        }
    }

    /// Whether `name` is one of this directory's artifacts, as opposed to
    /// one of a directory whose sanitized name merely shares the prefix.
    fn is_copy(&self, name: &str) -> bool {
        let Some(rest) = name.strip_prefix(&self.prefix).and_then(|r| r.strip_prefix('-')) else {
            return false;
        };
        let stamp_len = name_timestamp(Utc::now()).len();
        rest.get(..stamp_len)
            .map(|stamp| NaiveDateTime::parse_from_str(stamp, NAME_TIMESTAMP).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_stream(&mut self) -> Result<BackupStream> {
        if !self.path.is_dir() {
            return Err(BackupError::Capture(format!(
                "{} is not a directory",
                self.path.display()
            )));
        }
        let mut cmd = Command::new("tar");
        cmd.arg("cf").arg("-").arg(&self.path);
        let process = Process::spawn(cmd)
            .map_err(|e| BackupError::Capture(format!("Cannot start tar: {}", e)))?;
        Ok(Box::new(process.into_stream(None)?))
    }

    async fn finish(&mut self) -> Result<Option<CaptureMetadata>> {
        Ok(None)
    }

    async fn apply_retention_policy(
        &self,
        dst: &dyn Destination,
        policy: &RetentionPolicy,
        run_type: RunType,
        status: Option<StatusDocument>,
    ) -> Result<Option<StatusDocument>> {
        let keep = policy.copies(run_type);
        let copies: Vec<String> = dst
            .list_files(&self.dir)
            .await?
            .into_iter()
            .filter(|name| self.is_copy(name))
            .collect();
        debug!(
            "{} has {} {} copies, keeping {}",
            self.path.display(),
            copies.len(),
            run_type,
            keep
        );

        let expired = copies.len().saturating_sub(keep);
        for name in &copies[..expired] {
            info!("Deleting expired copy {}", name);
            if let Err(e) = dst.delete(name).await {
                error!("Failed to delete {}: {}", name, e);
            }
        }
        Ok(status)
    }
}
