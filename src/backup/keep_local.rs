use super::artifact::{ArtifactName, Codec};
use super::modifier::{CallbackContext, StreamModifier};
use super::stream::{BackupStream, TeeReader};
use crate::destination::{Destination, ObjectStoreDestination};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tracing::{debug, info, warn};

/// Keeps a copy of the artifact on local disk while it streams past.
///
/// The copy is written as `<name>.part` and only renamed to its final name
/// once the artifact has been saved to the destination.
pub struct KeepLocal {
    root: PathBuf,
    hostname: String,
    file: Option<File>,
    part: Option<PathBuf>,
    target: Option<PathBuf>,
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

impl KeepLocal {
    pub fn new(root: PathBuf, hostname: &str) -> Self {
        Self {
            root,
            hostname: hostname.to_string(),
            file: None,
            part: None,
            target: None,
        }
    }
}

#[async_trait]
impl StreamModifier for KeepLocal {
    fn name(&self) -> &'static str {
        "keep_local"
    }

    fn codec(&self) -> Option<Codec> {
        None
    }

    async fn prepare(&mut self, name: &ArtifactName) -> Result<()> {
        let target = self.root.join(name.to_string());
        let part = part_path(&target);
        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BackupError::Modifier(format!("Cannot create {}: {}", parent.display(), e))
            })?;
        }
        let file = File::create(&part).await.map_err(|e| {
            BackupError::Modifier(format!("Cannot create {}: {}", part.display(), e))
        })?;
        debug!("Keeping a local copy in {}", part.display());

        self.file = Some(file);
        self.part = Some(part);
        self.target = Some(target);
        Ok(())
    }

    fn apply(&mut self, stream: BackupStream) -> Result<BackupStream> {
        let file = self
            .file
            .take()
            .ok_or_else(|| BackupError::Modifier("local copy was not prepared".to_string()))?;
        Ok(Box::new(TeeReader::new(stream, file)))
    }

    async fn callback(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        if let (Some(part), Some(target)) = (self.part.take(), self.target.as_ref()) {
            tokio::fs::rename(&part, target).await?;
            info!("Local copy of {} kept in {}", ctx.artifact, target.display());
        }

        if let Some(status) = ctx.status {
            let local = ObjectStoreDestination::local(&self.root, &self.hostname)?;
            local.write_status(status).await?;
        }
        Ok(())
    }
}

impl Drop for KeepLocal {
    fn drop(&mut self) {
        if let Some(part) = self.part.take() {
            if let Err(e) = std::fs::remove_file(&part) {
                warn!("Failed to remove {}: {}", part.display(), e);
            }
        }
    }
}
