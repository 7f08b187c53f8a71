use super::artifact::{ArtifactName, Codec};
use super::compression::Gzip;
use super::gpg::Gpg;
use super::keep_local::KeepLocal;
use super::stream::BackupStream;
use crate::config::AppConfig;
use crate::destination::Destination;
use crate::error::Result;
use crate::status::StatusDocument;
use async_trait::async_trait;
use tracing::{debug, error, warn};

/// What a deferred callback gets to see once the artifact is saved.
pub struct CallbackContext<'a> {
    pub destination: &'a dyn Destination,
    pub artifact: &'a ArtifactName,
    pub status: Option<&'a StatusDocument>,
}

/// One stage between a source and a destination.
#[async_trait]
pub trait StreamModifier: Send {
    fn name(&self) -> &'static str;

    /// A required stage that cannot be set up fails the whole run; any
    /// other stage is skipped.
    fn required(&self) -> bool {
        false
    }

    /// Suffix this stage leaves in the artifact name, if any.
    fn codec(&self) -> Option<Codec>;

    /// Acquires whatever the stage needs. `name` is the artifact name as
    /// produced by the stages before this one.
    async fn prepare(&mut self, _name: &ArtifactName) -> Result<()> {
        Ok(())
    }

    fn apply(&mut self, stream: BackupStream) -> Result<BackupStream>;

    /// Runs after the artifact has been saved and the status persisted.
    async fn callback(&mut self, _ctx: &CallbackContext<'_>) -> Result<()> {
        Ok(())
    }
}

type Stage = fn(&AppConfig, &str) -> Option<Box<dyn StreamModifier>>;

/// Stages in application order. Each returns `None` when not configured.
const STAGES: [Stage; 3] = [gzip_stage, keep_local_stage, gpg_stage];

fn gzip_stage(_: &AppConfig, _: &str) -> Option<Box<dyn StreamModifier>> {
    Some(Box::new(Gzip::new()))
}

fn keep_local_stage(config: &AppConfig, hostname: &str) -> Option<Box<dyn StreamModifier>> {
    match config.destination.as_ref().and_then(|d| d.keep_local_path.as_ref()) {
        Some(path) => Some(Box::new(KeepLocal::new(path.clone(), hostname))),
        None => {
            debug!("keep_local_path is not present in the config file");
            None
        }
    }
}

fn gpg_stage(config: &AppConfig, _: &str) -> Option<Box<dyn StreamModifier>> {
    match &config.gpg {
        Some(gpg) => Some(Box::new(Gpg::new(gpg))),
        None => {
            debug!("No [gpg] section, backups will not be encrypted");
            None
        }
    }
}

/// Ordered modifiers for one artifact.
pub struct ModifierChain {
    stages: Vec<Box<dyn StreamModifier>>,
}

impl ModifierChain {
    pub fn new(stages: Vec<Box<dyn StreamModifier>>) -> Self {
        Self { stages }
    }

    pub fn from_config(config: &AppConfig, hostname: &str) -> Self {
        Self::new(
            STAGES
                .iter()
                .filter_map(|stage| stage(config, hostname))
                .collect(),
        )
    }

    /// Threads `stream` through every stage, extending `name` with each
    /// applied stage's suffix. Optional stages that fail to set up are
    /// dropped from the chain with a warning.
    pub async fn apply(&mut self, mut stream: BackupStream, name: &mut ArtifactName) -> Result<BackupStream> {
        let mut applied = Vec::with_capacity(self.stages.len());

        for mut stage in self.stages.drain(..) {
            if let Err(e) = stage.prepare(name).await {
                if stage.required() {
                    error!("Cannot set up {} stage: {}", stage.name(), e);
                    return Err(e);
                }
                warn!("{}", e);
                warn!("Will skip {} stage for {}", stage.name(), name);
                continue;
            }
            stream = stage.apply(stream)?;
            if let Some(codec) = stage.codec() {
                name.push(codec);
            }
            debug!("Applied {} stage, artifact is now {}", stage.name(), name);
            applied.push(stage);
        }

        self.stages = applied;
        Ok(stream)
    }

    /// Runs deferred callbacks in application order. Failures are logged.
    pub async fn run_callbacks(&mut self, ctx: &CallbackContext<'_>) {
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.callback(ctx).await {
                error!("{} callback for {} failed: {}", stage.name(), ctx.artifact, e);
            }
        }
    }

    #[cfg(test)]
    fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}
