use super::driver::{BinlogPosition, DatabaseDriver, DumpWriter};
use crate::config::MysqlConfig;
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const INSERT_BATCH: usize = 100;

pub struct MysqlDriver {
    pool: Pool,
}

impl MysqlDriver {
    pub fn new(config: &MysqlConfig) -> Result<Self> {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port)
            .user(Some(&config.username))
            .pass(Some(&config.password))
            .into();

        debug!("MySQL connection to {}:{}", config.host, config.port);
        Ok(Self {
            pool: Pool::new(opts),
        })
    }

    async fn get_conn(&self) -> Result<Conn> {
        self.pool.get_conn().await.map_err(BackupError::from)
    }

    fn escape_string(s: &str) -> String {
        s.replace('\\', "\\\\")
            .replace('\'', "\\'")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\0', "\\0")
    }

    fn format_value(value: Option<Value>) -> String {
        match value {
            Some(Value::NULL) | None => "NULL".to_string(),
            Some(Value::Bytes(bytes)) => match String::from_utf8(bytes) {
                Ok(s) => format!("'{}'", Self::escape_string(&s)),
                Err(e) => format!("X'{}'", hex::encode(e.as_bytes())),
            },
            Some(Value::Int(n)) => n.to_string(),
            Some(Value::UInt(n)) => n.to_string(),
            Some(Value::Float(n)) => n.to_string(),
            Some(Value::Double(n)) => n.to_string(),
            Some(Value::Date(y, m, d, h, mi, s, us)) => {
                format!("'{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}'", y, m, d, h, mi, s, us)
            }
            Some(Value::Time(neg, d, h, m, s, us)) => {
                let sign = if neg { "-" } else { "" };
                format!("'{}{}:{:02}:{:02}.{:06}'", sign, d * 24 + h as u32, m, s, us)
            }
        }
    }

    async fn get_create_table(&self, conn: &mut Conn, db_name: &str, table: &str) -> Result<String> {
        let query = format!("SHOW CREATE TABLE `{}`.`{}`", db_name, table);
        let row: Option<Row> = conn.query_first(&query).await?;

        row.and_then(|row| row.get_opt::<String, _>(1)?.ok()).ok_or_else(|| {
            BackupError::Database(format!(
                "Could not get CREATE TABLE for {}.{}",
                db_name, table
            ))
        })
    }

    async fn get_tables(&self, conn: &mut Conn, db_name: &str) -> Result<Vec<String>> {
        let query = format!("SHOW TABLES FROM `{}`", db_name);
        let tables: Vec<String> = conn.query(query).await?;
        Ok(tables)
    }

    async fn dump_table_data(
        &self,
        conn: &mut Conn,
        db_name: &str,
        table: &str,
        writer: DumpWriter<'_>,
    ) -> Result<()> {
        let columns_query = format!(
            "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' ORDER BY ORDINAL_POSITION",
            Self::escape_string(db_name),
            Self::escape_string(table)
        );
        let columns: Vec<String> = conn.query(columns_query).await?;
        if columns.is_empty() {
            return Ok(());
        }

        let column_list = columns
            .iter()
            .map(|c| format!("`{}`", c))
            .collect::<Vec<_>>()
            .join(", ");

        // at most one batch is held in memory
        let select_query = format!("SELECT * FROM `{}`.`{}`", db_name, table);
        let mut result = conn.query_iter(select_query).await?;
        let mut batch = Vec::with_capacity(INSERT_BATCH);
        while let Some(row) = result.next().await? {
            batch.push(Self::format_row(&row, columns.len()));
            if batch.len() == INSERT_BATCH {
                let insert = Self::insert_statement(table, &column_list, &batch);
                writer.write_all(insert.as_bytes()).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            let insert = Self::insert_statement(table, &column_list, &batch);
            writer.write_all(insert.as_bytes()).await?;
        }

        Ok(())
    }

    fn format_row(row: &Row, width: usize) -> String {
        let vals: Vec<String> = (0..width)
            .map(|i| Self::format_value(row.get_opt::<Value, _>(i).and_then(|v| v.ok())))
            .collect();
        format!("({})", vals.join(", "))
    }

    fn insert_statement(table: &str, column_list: &str, values: &[String]) -> String {
        format!(
            "INSERT INTO `{}` ({}) VALUES\n{};\n\n",
            table,
            column_list,
            values.join(",\n")
        )
    }
}

#[async_trait]
impl DatabaseDriver for MysqlDriver {
    async fn list_databases(&self) -> Result<Vec<String>> {
        debug!("Listing MySQL databases");
        let mut conn = self.get_conn().await?;
        let databases: Vec<String> = conn.query("SHOW DATABASES").await?;
        let filtered: Vec<String> = databases
            .into_iter()
            .filter(|db| !matches!(db.as_str(), "information_schema" | "performance_schema" | "mysql" | "sys"))
            .collect();

        debug!("Found {} user databases", filtered.len());
        Ok(filtered)
    }

    async fn binlog_position(&self) -> Result<Option<BinlogPosition>> {
        let mut conn = self.get_conn().await?;
        let row: Option<Row> = conn.query_first("SHOW MASTER STATUS").await?;
        Ok(row.and_then(|row| {
            Some(BinlogPosition {
                file: row.get_opt::<String, _>(0)?.ok()?,
                position: row.get_opt::<u64, _>(1)?.ok()?,
            })
        }))
    }

    async fn wsrep_provider_version(&self) -> Result<Option<String>> {
        let mut conn = self.get_conn().await?;
        let row: Option<(String, String)> = conn
            .query_first("SHOW GLOBAL VARIABLES LIKE 'wsrep_provider_version'")
            .await?;
        Ok(row.map(|(_, version)| version).filter(|v| !v.is_empty()))
    }

    async fn dump_database(&self, db_name: &str, writer: DumpWriter<'_>) -> Result<()> {
        info!("Starting dump of database: {}", db_name);
        let mut conn = self.get_conn().await?;
        let header = format!(
            "-- MySQL dump generated by tlm-backup\n\
             -- Database: {db}\n\
             -- Generated at: {at}\n\n\
             CREATE DATABASE IF NOT EXISTS `{db}`;\n\
             USE `{db}`;\n\
             SET FOREIGN_KEY_CHECKS=0;\n\
             SET SQL_MODE='NO_AUTO_VALUE_ON_ZERO';\n\n",
            db = db_name,
            at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        writer.write_all(header.as_bytes()).await?;

        let tables = self.get_tables(&mut conn, db_name).await?;
        info!("Found {} tables in database {}", tables.len(), db_name);

        for table in &tables {
            debug!("Dumping table: {}", table);
            let table_header = format!(
                "\n-- Table: {}\n-- ----------------------------------------\n\n\
                 DROP TABLE IF EXISTS `{}`;\n\n",
                table, table
            );
            writer.write_all(table_header.as_bytes()).await?;
            let create_stmt = self.get_create_table(&mut conn, db_name, table).await?;
            writer.write_all(create_stmt.as_bytes()).await?;
            writer.write_all(b";\n\n").await?;
            self.dump_table_data(&mut conn, db_name, table, &mut *writer).await?;
        }

        writer.write_all(b"\nSET FOREIGN_KEY_CHECKS=1;\n").await?;
        info!("Completed dump of database: {}", db_name);
        Ok(())
    }

    fn engine_name(&self) -> &'static str {
        "MySQL"
    }
}
