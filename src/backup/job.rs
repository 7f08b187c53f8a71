use super::artifact::ArtifactName;
use super::guard::RunScope;
use super::modifier::{CallbackContext, ModifierChain};
use crate::config::{AppConfig, RetentionPolicy};
use crate::destination::{create_destination, Destination};
use crate::error::Result;
use crate::source::{CaptureMetadata, FileSource, MysqlSource, Source};
use crate::status::{BackupKind, BackupRecord, RunType, StatusDocument};
use chrono::{DateTime, Utc};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Steps of one source's trip to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    SourceReady,
    Streaming,
    Saved,
    StatusPersisted,
    RetentionApplied,
    CallbacksRun,
    Done,
    Failed,
}

#[derive(Debug)]
pub struct BackupResult {
    pub artifact: String,
    pub kind: Option<BackupKind>,
    pub duration_secs: u64,
}

struct Run {
    source: String,
    state: RunState,
}

impl Run {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!("{}: {:?} -> {:?}", self.source, self.state, next);
        self.state = next;
    }
}

fn build_record(
    meta: CaptureMetadata,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
) -> BackupRecord {
    BackupRecord {
        binlog_file: meta.binlog_file,
        binlog_position: meta.binlog_position,
        lsn: meta.lsn,
        kind: meta.kind,
        backup_started: started,
        backup_finished: finished.max(started),
        config: meta.config,
        parent: meta.parent,
        wsrep_provider_version: meta.wsrep_provider_version,
    }
}

/// Captures `source`, threads it through `chain`, saves it to `dst`, records
/// it in the status document when the source keeps records, applies the
/// source's retention policy and finally runs the modifiers' callbacks.
///
/// `status` is the document read at the start of the run, if the caller
/// already has it.
pub async fn stream_to_destination(
    source: &mut dyn Source,
    chain: &mut ModifierChain,
    dst: &dyn Destination,
    policy: &RetentionPolicy,
    run_type: RunType,
    status: Option<StatusDocument>,
) -> Result<BackupResult> {
    let mut run = Run::new(source.name());
    match drive(&mut run, source, chain, dst, policy, run_type, status).await {
        Ok(result) => {
            run.advance(RunState::Done);
            Ok(result)
        }
        Err(e) => {
            error!("{} failed after {:?}: {}", run.source, run.state, e);
            run.advance(RunState::Failed);
            Err(e)
        }
    }
}

async fn drive(
    run: &mut Run,
    source: &mut dyn Source,
    chain: &mut ModifierChain,
    dst: &dyn Destination,
    policy: &RetentionPolicy,
    run_type: RunType,
    status: Option<StatusDocument>,
) -> Result<BackupResult> {
    let clock = Instant::now();
    let started = Utc::now();
    let stream = source.get_stream().await?;
    run.advance(RunState::SourceReady);

    let mut name = ArtifactName::new(source.name());
    let stream = chain.apply(stream, &mut name).await?;
    let artifact = name.to_string();
    run.advance(RunState::Streaming);

    if let Err(e) = dst.save(stream, &artifact).await {
        error!("Failed to save backup copy {}: {}", artifact, e);
        return Err(e);
    }
    run.advance(RunState::Saved);
    info!("Saved {} to {}", artifact, dst.name());

    let mut kind = None;
    let mut status = match source.finish().await? {
        Some(meta) => {
            let mut doc = match status {
                Some(doc) => doc,
                None => dst.status().await?,
            };
            kind = Some(meta.kind);
            let record = build_record(meta, started, Utc::now());
            info!("Backup of {} took {} seconds", artifact, record.duration_secs());
            doc.upsert(run_type, &artifact, record)?;
            doc.validate()?;
            dst.write_status(&doc).await?;
            run.advance(RunState::StatusPersisted);
            Some(doc)
        }
        None => status,
    };

    match source
        .apply_retention_policy(dst, policy, run_type, status.clone())
        .await
    {
        Ok(pruned) => {
            if pruned != status {
                if let Some(doc) = &pruned {
                    dst.write_status(doc).await?;
                }
                status = pruned;
            }
        }
        Err(e) => error!("Retention policy for {} failed: {}", run.source, e),
    }
    run.advance(RunState::RetentionApplied);

    chain
        .run_callbacks(&CallbackContext {
            destination: dst,
            artifact: &name,
            status: status.as_ref(),
        })
        .await;
    run.advance(RunState::CallbacksRun);

    Ok(BackupResult {
        artifact,
        kind,
        duration_secs: clock.elapsed().as_secs(),
    })
}

/// Backs up every configured directory. A failed directory does not stop
/// the others; the first error is returned.
pub async fn backup_files(run_type: RunType, config: &AppConfig, dst: &dyn Destination) -> Result<()> {
    let hostname = config.hostname();
    let mut first_error = None;

    for dir in &config.source.backup_dirs {
        debug!("copying {}", dir.display());
        let mut src = FileSource::new(dir, run_type, &hostname);
        let mut chain = ModifierChain::from_config(config, &hostname);
        match stream_to_destination(&mut src, &mut chain, dst, &config.retention, run_type, None).await {
            Ok(result) => info!(
                "Backed up {} as {} in {}s",
                dir.display(),
                result.artifact,
                result.duration_secs
            ),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Backs up the local MySQL instance when `backup_mysql` is set.
pub async fn backup_mysql(run_type: RunType, config: &AppConfig, dst: &dyn Destination) -> Result<()> {
    if !config.source.backup_mysql {
        debug!("Not backing up MySQL");
        return Ok(());
    }
    let mysql = config.mysql()?;
    let hostname = config.hostname();

    let status = dst.status().await?;
    let mut src = MysqlSource::new(mysql, run_type, &hostname, &status);
    let mut chain = ModifierChain::from_config(config, &hostname);
    let result =
        stream_to_destination(&mut src, &mut chain, dst, &config.retention, run_type, Some(status)).await?;
    info!(
        "MySQL {} backup {} took {}s",
        result.kind.unwrap_or(BackupKind::Full),
        result.artifact,
        result.duration_secs
    );
    Ok(())
}

/// Raises the soft open-files limit to the hard one.
fn set_open_files_limit() {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, hard)) if soft < hard => match setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
            Ok(()) => debug!("Setting max files limit to {}", hard),
            Err(e) => warn!("Cannot raise open files limit from {}: {}", soft, e),
        },
        Ok((soft, _)) => debug!("Max files limit is {}", soft),
        Err(e) => warn!("Cannot read open files limit: {}", e),
    }
}

/// Runs the file and MySQL backups for `run_type`. Both are attempted even
/// if the first one fails.
pub async fn backup_everything(run_type: RunType, config: &AppConfig, scope: &RunScope) -> Result<()> {
    set_open_files_limit();
    let dst = create_destination(config, scope)?;
    let started = Instant::now();

    let files = backup_files(run_type, config, dst.as_ref()).await;
    if let Err(e) = &files {
        error!("File backup failed: {}", e);
    }
    let mysql = backup_mysql(run_type, config, dst.as_ref()).await;
    if let Err(e) = &mysql {
        error!("MySQL backup failed: {}", e);
    }

    info!("{} backup finished in {}s", run_type, started.elapsed().as_secs());
    files.and(mysql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::artifact::Codec;
    use crate::backup::compression::Gzip;
    use crate::backup::guard::RunGuard;
    use crate::backup::modifier::StreamModifier;
    use crate::backup::BackupStream;
    use crate::destination::ObjectStoreDestination;
    use crate::error::BackupError;
    use crate::source::BackupPlan;
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FakeSource {
        name: String,
        meta: Option<CaptureMetadata>,
        retention_calls: Arc<AtomicUsize>,
        stall: bool,
        held: Option<tokio::io::DuplexStream>,
    }

    impl FakeSource {
        fn database(name: &str, plan: BackupPlan) -> Self {
            Self {
                name: name.to_string(),
                meta: Some(CaptureMetadata {
                    kind: plan.kind,
                    parent: plan.parent,
                    binlog_file: Some("mysql-bin.000001".to_string()),
                    binlog_position: Some(154),
                    lsn: Some(19747438),
                    config: vec![],
                    wsrep_provider_version: None,
                }),
                retention_calls: Arc::new(AtomicUsize::new(0)),
                stall: false,
                held: None,
            }
        }

        fn files(name: &str) -> Self {
            Self {
                name: name.to_string(),
                meta: None,
                retention_calls: Arc::new(AtomicUsize::new(0)),
                stall: false,
                held: None,
            }
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_stream(&mut self) -> Result<BackupStream> {
            if self.stall {
                // writer stays open, so the capture never ends
                let (reader, writer) = tokio::io::duplex(64);
                self.held = Some(writer);
                return Ok(Box::new(reader));
            }
            Ok(Box::new(Cursor::new(b"captured bytes".to_vec())))
        }

        async fn finish(&mut self) -> Result<Option<CaptureMetadata>> {
            Ok(self.meta.take())
        }

        async fn apply_retention_policy(
            &self,
            _dst: &dyn Destination,
            _policy: &RetentionPolicy,
            _run_type: RunType,
            status: Option<StatusDocument>,
        ) -> Result<Option<StatusDocument>> {
            self.retention_calls.fetch_add(1, Ordering::SeqCst);
            Ok(status)
        }
    }

    /// Destination whose saves always fail; counts status writes.
    struct BrokenDestination {
        status_writes: AtomicUsize,
    }

    #[async_trait]
    impl Destination for BrokenDestination {
        async fn save(&self, _stream: BackupStream, name: &str) -> Result<()> {
            Err(BackupError::Destination(format!("cannot upload {}", name)))
        }

        async fn status(&self) -> Result<StatusDocument> {
            Ok(StatusDocument::new())
        }

        async fn write_status(&self, _status: &StatusDocument) -> Result<()> {
            self.status_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list_files(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn find_files(&self, _prefix: &str, _run_type: RunType) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn delete(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    /// Records what the status document held when its callback ran.
    struct Witness {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StreamModifier for Witness {
        fn name(&self) -> &'static str {
            "witness"
        }

        fn codec(&self) -> Option<Codec> {
            None
        }

        fn apply(&mut self, stream: BackupStream) -> Result<BackupStream> {
            Ok(stream)
        }

        async fn callback(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
            let persisted = ctx.destination.status().await?;
            let mut seen = self.seen.lock().unwrap();
            seen.push(ctx.artifact.to_string());
            seen.extend(persisted.iter().map(|(_, name, _)| name.to_string()));
            Ok(())
        }
    }

    fn memory() -> ObjectStoreDestination {
        ObjectStoreDestination::new(Arc::new(InMemory::new()), "", "db01", "memory")
    }

    fn gzip_chain() -> ModifierChain {
        ModifierChain::new(vec![Box::new(Gzip::new())])
    }

    #[tokio::test]
    async fn test_daily_full_then_hourly_incremental() {
        let dst = memory();
        let policy = RetentionPolicy::default();

        let status = dst.status().await.unwrap();
        let plan = BackupPlan::decide(RunType::Daily, RunType::Daily, &status);
        let mut daily = FakeSource::database("db01/daily/mysql/mysql-2024-01-01_00_00_00.xbstream", plan);
        let result = stream_to_destination(&mut daily, &mut gzip_chain(), &dst, &policy, RunType::Daily, Some(status))
            .await
            .unwrap();
        let daily_name = result.artifact;
        assert_eq!(daily_name, "db01/daily/mysql/mysql-2024-01-01_00_00_00.xbstream.gz");

        let status = dst.status().await.unwrap();
        assert_eq!(status.len(), 1);
        let record = status.get(RunType::Daily, &daily_name).unwrap();
        assert_eq!(record.kind, BackupKind::Full);
        assert!(record.parent.is_none());
        assert!(record.backup_finished >= record.backup_started);

        let plan = BackupPlan::decide(RunType::Hourly, RunType::Daily, &status);
        let mut hourly = FakeSource::database("db01/hourly/mysql/mysql-2024-01-01_01_00_00.xbstream", plan);
        let result = stream_to_destination(&mut hourly, &mut gzip_chain(), &dst, &policy, RunType::Hourly, Some(status))
            .await
            .unwrap();
        assert_eq!(result.kind, Some(BackupKind::Incremental));

        let status = dst.status().await.unwrap();
        let record = status.get(RunType::Hourly, &result.artifact).unwrap();
        assert_eq!(record.kind, BackupKind::Incremental);
        assert_eq!(record.parent.as_deref(), Some(daily_name.as_str()));
        status.validate().unwrap();
    }

    #[tokio::test]
    async fn test_failed_save_leaves_status_alone() {
        let dst = BrokenDestination {
            status_writes: AtomicUsize::new(0),
        };
        let mut src = FakeSource::database("db01/daily/mysql/m.xbstream", BackupPlan::full());
        let calls = src.retention_calls.clone();
        let result = stream_to_destination(
            &mut src,
            &mut gzip_chain(),
            &dst,
            &RetentionPolicy::default(),
            RunType::Daily,
            Some(StatusDocument::new()),
        )
        .await;

        assert!(matches!(result, Err(BackupError::Destination(_))));
        assert_eq!(dst.status_writes.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callbacks_run_after_status_is_persisted() {
        let dst = memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ModifierChain::new(vec![
            Box::new(Gzip::new()),
            Box::new(Witness { seen: seen.clone() }),
        ]);
        let mut src = FakeSource::database("db01/daily/mysql/m.xbstream", BackupPlan::full());
        let calls = src.retention_calls.clone();

        stream_to_destination(&mut src, &mut chain, &dst, &RetentionPolicy::default(), RunType::Daily, None)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "db01/daily/mysql/m.xbstream.gz".to_string(),
                "db01/daily/mysql/m.xbstream.gz".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_file_backup_does_not_touch_status() {
        let dst = memory();
        let mut src = FakeSource::files("db01/hourly/files/_etc-2024-01-01_00_00_00.tar");
        let result = stream_to_destination(
            &mut src,
            &mut gzip_chain(),
            &dst,
            &RetentionPolicy::default(),
            RunType::Hourly,
            None,
        )
        .await
        .unwrap();

        assert!(result.kind.is_none());
        assert_eq!(
            dst.list_files("db01").await.unwrap(),
            vec!["db01/hourly/files/_etc-2024-01-01_00_00_00.tar.gz".to_string()]
        );
    }

    #[tokio::test]
    async fn test_mysql_disabled_is_skipped() {
        let dst = BrokenDestination {
            status_writes: AtomicUsize::new(0),
        };
        backup_mysql(RunType::Daily, &AppConfig::default(), &dst)
            .await
            .unwrap();
        assert_eq!(dst.status_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deadline_mid_capture_leaves_status_alone() {
        let dst = memory();
        let mut src = FakeSource::database("db01/daily/mysql/m.xbstream", BackupPlan::full());
        src.stall = true;
        let calls = src.retention_calls.clone();

        let dir = tempfile::tempdir().unwrap();
        let guard = RunGuard::new(&dir.path().join("lock"), RunType::Daily, Duration::from_millis(300));
        let result = guard
            .run(stream_to_destination(
                &mut src,
                &mut gzip_chain(),
                &dst,
                &RetentionPolicy::default(),
                RunType::Daily,
                None,
            ))
            .await;

        assert!(matches!(result, Err(BackupError::DeadlineExceeded(_))));
        assert!(dst.status().await.unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
