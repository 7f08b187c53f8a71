use super::{in_run_type, join, Destination};
use crate::backup::BackupStream;
use crate::config::S3Config;
use crate::error::{BackupError, Result};
use crate::status::{RunType, StatusDocument};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;
const MAX_INFLIGHT_PARTS: usize = 4;

/// Destination backed by an object store: S3, a local directory, or an
/// in-memory store in tests.
pub struct ObjectStoreDestination {
    store: Arc<dyn ObjectStore>,
    root: String,
    status_name: String,
    kind: &'static str,
}

impl ObjectStoreDestination {
    pub fn new(store: Arc<dyn ObjectStore>, root: &str, hostname: &str, kind: &'static str) -> Self {
        Self {
            store,
            root: root.trim_matches('/').to_string(),
            status_name: format!("{}/status", hostname),
            kind,
        }
    }

    pub fn s3(config: &S3Config, hostname: &str) -> Result<Self> {
        let store = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.default_region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .build()?;
        let root = config.prefix.as_deref().unwrap_or_default();
        Ok(Self::new(Arc::new(store), root, hostname, "s3"))
    }

    pub fn local(path: &Path, hostname: &str) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let store = LocalFileSystem::new_with_prefix(path)?;
        Ok(Self::new(Arc::new(store), "", hostname, "local"))
    }

    fn location(&self, name: &str) -> ObjectPath {
        ObjectPath::from(join(&self.root, name).as_str())
    }

    fn relative(&self, location: &ObjectPath) -> String {
        let full = location.as_ref();
        if self.root.is_empty() {
            return full.to_string();
        }
        full.strip_prefix(&self.root)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full.to_string())
    }

    async fn list_relative(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = self.location(prefix);
        debug!("Listing {}:{}", self.kind, prefix_path);
        let objects: Vec<ObjectMeta> = self.store.list(Some(&prefix_path)).try_collect().await?;
        let mut names: Vec<String> = objects.iter().map(|o| self.relative(&o.location)).collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Destination for ObjectStoreDestination {
    async fn save(&self, mut stream: BackupStream, name: &str) -> Result<()> {
        let location = self.location(name);
        info!("Saving {}:{}", self.kind, location);

        let upload = self.store.put_multipart(&location).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut buffer = vec![0u8; READ_CHUNK];
        let mut total: u64 = 0;

        loop {
            let bytes_read = match stream.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    if let Err(abort_err) = writer.abort().await {
                        warn!("Failed to abort upload of {}: {}", location, abort_err);
                    }
                    return Err(BackupError::Destination(format!(
                        "reading backup stream for {}: {}",
                        name, e
                    )));
                }
            };
            if bytes_read == 0 {
                break;
            }
            writer.wait_for_capacity(MAX_INFLIGHT_PARTS).await?;
            writer.write(&buffer[..bytes_read]);
            total += bytes_read as u64;
        }

        writer.finish().await?;
        debug!("Saved {} bytes to {}", total, location);
        Ok(())
    }

    async fn status(&self) -> Result<StatusDocument> {
        match self.store.get(&self.location(&self.status_name)).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                StatusDocument::from_json(&bytes)
            }
            Err(object_store::Error::NotFound { .. }) => {
                debug!("No status document yet at {}", self.status_name);
                Ok(StatusDocument::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_status(&self, status: &StatusDocument) -> Result<()> {
        let payload = PutPayload::from(status.to_json()?);
        self.store
            .put(&self.location(&self.status_name), payload)
            .await?;
        debug!("Status document written to {}", self.status_name);
        Ok(())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_relative(prefix).await
    }

    async fn find_files(&self, prefix: &str, run_type: RunType) -> Result<Vec<String>> {
        let base = prefix.trim_matches('/');
        let names = self.list_relative(base).await?;
        Ok(names
            .into_iter()
            .filter(|name| {
                let below = name.strip_prefix(base).unwrap_or(name);
                in_run_type(below, run_type)
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let location = self.location(name);
        debug!("Deleting {}:{}", self.kind, location);
        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                warn!("{} was already gone", location);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{BackupKind, BackupRecord};
    use chrono::Utc;
    use object_store::memory::InMemory;
    use std::io::Cursor;

    fn memory(root: &str) -> (Arc<InMemory>, ObjectStoreDestination) {
        let store = Arc::new(InMemory::new());
        let dst = ObjectStoreDestination::new(store.clone(), root, "db01", "memory");
        (store, dst)
    }

    fn stream(data: &[u8]) -> BackupStream {
        Box::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_save_streams_under_root() {
        let (store, dst) = memory("/backups/");
        let data = vec![7u8; 3 * READ_CHUNK + 11];
        dst.save(stream(&data), "db01/daily/files/_etc-1.tar.gz")
            .await
            .unwrap();

        let stored = store
            .get(&ObjectPath::from("backups/db01/daily/files/_etc-1.tar.gz"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_save_reports_stream_failure() {
        struct Broken;
        impl tokio::io::AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("capture died")))
            }
        }

        let (_, dst) = memory("");
        let err = dst.save(Box::new(Broken), "x/daily/a").await.unwrap_err();
        assert!(matches!(err, BackupError::Destination(_)));
        assert!(dst.list_files("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_files_sorted() {
        let (_, dst) = memory("bucket");
        for name in [
            "prefix/db01/weekly/files/b.gz",
            "prefix/db01/weekly/files/a.gz",
            "prefix/db01/daily/files/c.gz",
        ] {
            dst.save(stream(b"x"), name).await.unwrap();
        }

        let found = dst.find_files("/prefix", RunType::Weekly).await.unwrap();
        assert_eq!(
            found,
            vec![
                "prefix/db01/weekly/files/a.gz".to_string(),
                "prefix/db01/weekly/files/b.gz".to_string(),
            ]
        );
        assert!(dst.find_files("prefix", RunType::Yearly).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_roundtrip() {
        let (_, dst) = memory("");
        assert!(dst.status().await.unwrap().is_empty());

        let mut doc = StatusDocument::new();
        let now = Utc::now();
        doc.upsert(
            RunType::Daily,
            "db01/daily/mysql/mysql-1.xbstream",
            BackupRecord {
                binlog_file: None,
                binlog_position: None,
                lsn: Some(10),
                kind: BackupKind::Full,
                backup_started: now,
                backup_finished: now,
                config: vec![],
                parent: None,
                wsrep_provider_version: None,
            },
        )
        .unwrap();
        dst.write_status(&doc).await.unwrap();

        let read = dst.status().await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(
            read.get(RunType::Daily, "db01/daily/mysql/mysql-1.xbstream")
                .unwrap()
                .lsn,
            Some(10)
        );
        assert_eq!(dst.list_files("db01").await.unwrap(), vec!["db01/status".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let (_, dst) = memory("");
        dst.save(stream(b"x"), "db01/hourly/files/a").await.unwrap();
        dst.delete("db01/hourly/files/a").await.unwrap();
        dst.delete("db01/hourly/files/a").await.unwrap();
        assert!(dst.list_files("db01").await.unwrap().is_empty());
    }
}
