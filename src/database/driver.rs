use crate::error::Result;
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tracing::info;

pub type DumpWriter<'a> = &'a mut (dyn AsyncWrite + Send + Unpin);

/// Replication coordinates reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;
    /// Current binary log coordinates, `None` when binary logging is off.
    async fn binlog_position(&self) -> Result<Option<BinlogPosition>>;
    /// Galera provider version, `None` when the server is not a cluster member.
    async fn wsrep_provider_version(&self) -> Result<Option<String>>;
    async fn dump_database(&self, db_name: &str, writer: DumpWriter<'_>) -> Result<()>;
    fn engine_name(&self) -> &'static str;

    /// Dumps every user database, one after another, into `writer`.
    async fn dump_all(&self, writer: DumpWriter<'_>) -> Result<()> {
        let databases = self.list_databases().await?;
        info!(
            "Dumping {} {} databases",
            databases.len(),
            self.engine_name()
        );
        for db in &databases {
            self.dump_database(db, &mut *writer).await?;
        }
        Ok(())
    }
}
