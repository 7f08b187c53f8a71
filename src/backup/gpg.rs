use super::artifact::{ArtifactName, Codec};
use super::modifier::StreamModifier;
use super::stream::{BackupStream, Process};
use crate::config::GpgConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// Encrypts the stream for one recipient by piping it through `gpg`.
pub struct Gpg {
    binary: String,
    recipient: String,
    keyring: PathBuf,
    secret_keyring: Option<PathBuf>,
    process: Option<Process>,
}

impl Gpg {
    pub fn new(config: &GpgConfig) -> Self {
        Self {
            binary: "gpg".to_string(),
            recipient: config.recipient.clone(),
            keyring: config.keyring.clone(),
            secret_keyring: config.secret_keyring.clone(),
            process: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-default-keyring")
            .arg("--trust-model")
            .arg("always")
            .arg("--keyring")
            .arg(&self.keyring);
        if let Some(secret) = &self.secret_keyring {
            cmd.arg("--secret-keyring").arg(secret);
        }
        cmd.arg("--recipient")
            .arg(&self.recipient)
            .arg("--encrypt")
            .arg("--yes")
            .arg("--batch");
        cmd
    }
}

#[async_trait]
impl StreamModifier for Gpg {
    fn name(&self) -> &'static str {
        "gpg"
    }

    fn codec(&self) -> Option<Codec> {
        Some(Codec::Gpg)
    }

    async fn prepare(&mut self, name: &ArtifactName) -> Result<()> {
        if self.recipient.trim().is_empty() {
            return Err(BackupError::Modifier(
                "gpg recipient is empty, will skip encryption".to_string(),
            ));
        }
        if tokio::fs::metadata(&self.keyring).await.is_err() {
            return Err(BackupError::Modifier(format!(
                "Keyring {} doesn't exist, will skip encryption",
                self.keyring.display()
            )));
        }

        debug!("Encrypting {} for {}", name, self.recipient);
        let process = Process::spawn_filter(self.command()).map_err(|e| {
            BackupError::Modifier(format!("Cannot start {}: {}, will skip encryption", self.binary, e))
        })?;
        self.process = Some(process);
        Ok(())
    }

    fn apply(&mut self, stream: BackupStream) -> Result<BackupStream> {
        let process = self
            .process
            .take()
            .ok_or_else(|| BackupError::Modifier("gpg was not prepared".to_string()))?;
        Ok(Box::new(process.into_stream(Some(stream))?))
    }
}
