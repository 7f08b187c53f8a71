use super::{name_timestamp, CaptureMetadata, Source};
use crate::backup::{BackupStream, CheckedStream, Process, ProcessLog};
use crate::config::{DumpMethod, MysqlConfig, RetentionPolicy};
use crate::database::{create_driver, BinlogPosition, DatabaseDriver};
use crate::destination::Destination;
use crate::error::{BackupError, Result};
use crate::status::{plan_expiry, BackupKind, ConfigSnapshot, RunType, StatusDocument};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const DUMP_BUFFER: usize = 256 * 1024;

/// Full or incremental, decided from what the status document already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub kind: BackupKind,
    pub parent: Option<String>,
    pub incremental_lsn: Option<u64>,
}

impl BackupPlan {
    pub fn full() -> Self {
        Self {
            kind: BackupKind::Full,
            parent: None,
            incremental_lsn: None,
        }
    }

    /// Runs at or above the `full_backup` cadence are always full. Finer runs
    /// are incremental against the newest full copy of the `full_backup`
    /// bucket, or full when there is none to build on.
    pub fn decide(run_type: RunType, full_backup: RunType, status: &StatusDocument) -> Self {
        if run_type >= full_backup {
            debug!("{} runs take full copies (full_backup = {})", run_type, full_backup);
            return Self::full();
        }
        match status.latest_full(full_backup) {
            None => {
                info!("No full {} copy yet, taking a full backup", full_backup);
                Self::full()
            }
            Some((name, record)) => match record.lsn {
                Some(lsn) => Self {
                    kind: BackupKind::Incremental,
                    parent: Some(name.to_string()),
                    incremental_lsn: Some(lsn),
                },
                None => {
                    warn!("{} has no LSN, taking a full backup", name);
                    Self::full()
                }
            },
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.kind == BackupKind::Incremental
    }
}

/// Coordinates reported by xtrabackup on stderr.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct XtrabackupLog {
    pub lsn: Option<u64>,
    pub binlog: Option<BinlogPosition>,
}

/// Value following `key`, either quoted or up to the next comma.
fn value_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line[line.find(key)? + key.len()..].trim_start();
    match rest.strip_prefix('\'') {
        Some(quoted) => quoted.split('\'').next(),
        None => rest.split([',', ' ']).next(),
    }
}

pub fn parse_xtrabackup_log(text: &str) -> XtrabackupLog {
    let mut parsed = XtrabackupLog::default();
    for line in text.lines() {
        if let Some(lsn) = value_after(line, "The latest check point (for incremental):") {
            parsed.lsn = lsn.parse().ok();
        } else if let Some(at) = line.find("MySQL binlog position:") {
            let coordinates = &line[at + "MySQL binlog position:".len()..];
            let file = value_after(coordinates, "filename");
            let position = value_after(coordinates, "position").and_then(|p| p.parse().ok());
            if let (Some(file), Some(position)) = (file, position) {
                parsed.binlog = Some(BinlogPosition {
                    file: file.to_string(),
                    position,
                });
            }
        }
    }
    parsed
}

/// Reads MySQL option files, following `!include` and `!includedir`.
/// Unreadable files are logged and left out.
pub fn snapshot_config(paths: &[PathBuf]) -> Vec<ConfigSnapshot> {
    let mut seen = HashSet::new();
    let mut snapshot = Vec::new();
    for path in paths {
        collect_config(path, &mut seen, &mut snapshot);
    }
    snapshot
}

fn collect_config(path: &Path, seen: &mut HashSet<PathBuf>, snapshot: &mut Vec<ConfigSnapshot>) {
    if !seen.insert(path.to_path_buf()) {
        return;
    }
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            return;
        }
    };
    let text = String::from_utf8_lossy(&content).into_owned();
    snapshot.push(ConfigSnapshot {
        path: path.display().to_string(),
        content,
    });

    for line in text.lines().map(str::trim) {
        if let Some(dir) = line.strip_prefix("!includedir") {
            let dir = Path::new(dir.trim());
            match std::fs::read_dir(dir) {
                Ok(entries) => {
                    let mut files: Vec<PathBuf> = entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.extension().is_some_and(|ext| ext == "cnf"))
                        .collect();
                    files.sort();
                    for file in files {
                        collect_config(&file, seen, snapshot);
                    }
                }
                Err(e) => warn!("Cannot read {}: {}", dir.display(), e),
            }
        } else if let Some(file) = line.strip_prefix("!include") {
            collect_config(Path::new(file.trim()), seen, snapshot);
        }
    }
}

enum Capture {
    Physical(ProcessLog),
    Logical(Option<BinlogPosition>),
}

/// The local MySQL instance, captured with xtrabackup or an SQL dump.
pub struct MysqlSource {
    config: MysqlConfig,
    plan: BackupPlan,
    name: String,
    capture: Option<Capture>,
}

impl MysqlSource {
    pub fn new(config: &MysqlConfig, run_type: RunType, hostname: &str, status: &StatusDocument) -> Self {
        let mut plan = BackupPlan::decide(run_type, config.full_backup, status);
        if config.method == DumpMethod::Logical && plan.is_incremental() {
            info!("SQL dumps cannot be incremental, taking a full backup");
            plan = BackupPlan::full();
        }
        let extension = match config.method {
            DumpMethod::Physical => "xbstream",
            DumpMethod::Logical => "sql",
        };
        let name = format!(
            "{}/{}/mysql/mysql-{}.{}",
            hostname,
            run_type,
            name_timestamp(Utc::now()),
            extension
        );
        Self {
            config: config.clone(),
            plan,
            name,
            capture: None,
        }
    }

    #[cfg(test)]
    fn plan(&self) -> &BackupPlan {
        &self.plan
    }

    fn xtrabackup_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.xtrabackup_binary);
        cmd.arg(format!(
            "--defaults-file={}",
            self.config.mysql_defaults_file.display()
        ))
        .arg("--stream=xbstream")
        .arg("--backup")
        .arg(format!("--target-dir={}", std::env::temp_dir().display()));
        if let Some(lsn) = self.plan.incremental_lsn {
            cmd.arg(format!("--incremental-lsn={}", lsn));
        }
        cmd
    }

    fn physical_stream(&mut self) -> Result<BackupStream> {
        let process = Process::spawn(self.xtrabackup_command()).map_err(|e| {
            BackupError::Capture(format!(
                "Cannot start {}: {}",
                self.config.xtrabackup_binary, e
            ))
        })?;
        self.capture = Some(Capture::Physical(process.log()));
        Ok(Box::new(process.into_stream(None)?))
    }

    async fn logical_stream(&mut self) -> Result<BackupStream> {
        let driver = create_driver(&self.config)?;
        let position = match driver.binlog_position().await {
            Ok(position) => position,
            Err(e) => {
                warn!("Cannot read binary log position: {}", e);
                None
            }
        };
        self.capture = Some(Capture::Logical(position));

        let (reader, mut writer) = tokio::io::duplex(DUMP_BUFFER);
        let dump = tokio::spawn(async move {
            driver.dump_all(&mut writer).await?;
            writer.shutdown().await?;
            Ok::<(), BackupError>(())
        });
        let exit = async move {
            match dump.await {
                Ok(result) => result.map_err(|e| io::Error::other(e.to_string())),
                Err(e) => Err(io::Error::other(format!("dump task failed: {}", e))),
            }
        }
        .boxed();
        Ok(Box::new(CheckedStream::new(reader, exit)))
    }

    async fn wsrep_provider_version(&self) -> Option<String> {
        let driver = match create_driver(&self.config) {
            Ok(driver) => driver,
            Err(e) => {
                warn!("Cannot check Galera membership: {}", e);
                return None;
            }
        };
        match driver.wsrep_provider_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!("Cannot check Galera membership: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Source for MysqlSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_stream(&mut self) -> Result<BackupStream> {
        info!(
            "Taking {} {} backup {}",
            self.plan.kind,
            match self.config.method {
                DumpMethod::Physical => "physical",
                DumpMethod::Logical => "logical",
            },
            self.name
        );
        match self.config.method {
            DumpMethod::Physical => self.physical_stream(),
            DumpMethod::Logical => self.logical_stream().await,
        }
    }

    async fn finish(&mut self) -> Result<Option<CaptureMetadata>> {
        let capture = self
            .capture
            .take()
            .ok_or_else(|| BackupError::Capture(format!("{} was never captured", self.name)))?;

        let (lsn, binlog) = match capture {
            Capture::Physical(log) => {
                let parsed = parse_xtrabackup_log(&log.text());
                if parsed.lsn.is_none() {
                    warn!("xtrabackup did not report an LSN for {}", self.name);
                }
                (parsed.lsn, parsed.binlog)
            }
            Capture::Logical(position) => (None, position),
        };

        Ok(Some(CaptureMetadata {
            kind: self.plan.kind,
            parent: self.plan.parent.clone(),
            binlog_file: binlog.as_ref().map(|b| b.file.clone()),
            binlog_position: binlog.as_ref().map(|b| b.position),
            lsn,
            config: snapshot_config(&self.config.config_files),
            wsrep_provider_version: self.wsrep_provider_version().await,
        }))
    }

    async fn apply_retention_policy(
        &self,
        dst: &dyn Destination,
        policy: &RetentionPolicy,
        run_type: RunType,
        status: Option<StatusDocument>,
    ) -> Result<Option<StatusDocument>> {
        let Some(mut status) = status else {
            return Ok(None);
        };

        for group in plan_expiry(&status, run_type, policy) {
            debug!("Expiring lineage {:?}", group);
            for name in &group {
                if !status.children(name).is_empty() {
                    warn!("{} still has dependent backups, keeping it", name);
                    break;
                }
                if let Err(e) = dst.delete(name).await {
                    error!("Failed to delete {}: {}", name, e);
                    break;
                }
                info!("Deleted expired copy {}", name);
                status.remove(name);
            }
        }
        Ok(Some(status))
    }
}
