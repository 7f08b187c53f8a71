use crate::status::RunType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub backup_dirs: Vec<PathBuf>,
    pub backup_mysql: bool,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    S3,
    Ssh,
    Local,
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestinationKind::S3 => write!(f, "s3"),
            DestinationKind::Ssh => write!(f, "ssh"),
            DestinationKind::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub backup_destination: DestinationKind,
    #[serde(default)]
    pub keep_local_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default = "default_region")]
    pub default_region: String,
    /// Bucket-relative path prepended to every object.
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub backup_host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_key")]
    pub ssh_key: PathBuf,
    pub backup_dir: String,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_key() -> PathBuf {
    PathBuf::from("/root/.ssh/id_rsa")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DumpMethod {
    /// `xtrabackup` stream, supports incremental copies.
    Physical,
    /// In-process SQL dump, full copies only.
    Logical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub mysql_defaults_file: PathBuf,
    pub full_backup: RunType,
    pub method: DumpMethod,
    pub xtrabackup_binary: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub config_files: Vec<PathBuf>,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            mysql_defaults_file: PathBuf::from("/root/.my.cnf"),
            full_backup: RunType::Daily,
            method: DumpMethod::Physical,
            xtrabackup_binary: "xtrabackup".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            config_files: vec![PathBuf::from("/etc/my.cnf")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpgConfig {
    pub recipient: String,
    pub keyring: PathBuf,
    #[serde(default)]
    pub secret_keyring: Option<PathBuf>,
}

/// Number of copies kept per run type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionPolicy {
    pub hourly_copies: usize,
    pub daily_copies: usize,
    pub weekly_copies: usize,
    pub monthly_copies: usize,
    pub yearly_copies: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hourly_copies: 24,
            daily_copies: 7,
            weekly_copies: 4,
            monthly_copies: 12,
            yearly_copies: 3,
        }
    }
}

impl RetentionPolicy {
    pub fn copies(&self, run_type: RunType) -> usize {
        match run_type {
            RunType::Hourly => self.hourly_copies,
            RunType::Daily => self.daily_copies,
            RunType::Weekly => self.weekly_copies,
            RunType::Monthly => self.monthly_copies,
            RunType::Yearly => self.yearly_copies,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    pub run_hourly: bool,
    pub run_daily: bool,
    pub run_weekly: bool,
    pub run_monthly: bool,
    pub run_yearly: bool,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            run_hourly: true,
            run_daily: true,
            run_weekly: true,
            run_monthly: true,
            run_yearly: true,
        }
    }
}

impl IntervalsConfig {
    pub fn enabled(&self, run_type: RunType) -> bool {
        match run_type {
            RunType::Hourly => self.run_hourly,
            RunType::Daily => self.run_daily,
            RunType::Weekly => self.run_weekly,
            RunType::Monthly => self.run_monthly,
            RunType::Yearly => self.run_yearly,
        }
    }
}

/// Per-run-type deadline overrides, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub hourly: Option<u64>,
    pub daily: Option<u64>,
    pub weekly: Option<u64>,
    pub monthly: Option<u64>,
    pub yearly: Option<u64>,
}

impl TimeoutsConfig {
    pub fn deadline(&self, run_type: RunType) -> Duration {
        let configured = match run_type {
            RunType::Hourly => self.hourly,
            RunType::Daily => self.daily,
            RunType::Weekly => self.weekly,
            RunType::Monthly => self.monthly,
            RunType::Yearly => self.yearly,
        };
        configured
            .map(Duration::from_secs)
            .unwrap_or_else(|| run_type.default_timeout())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: Option<DestinationConfig>,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub mysql: Option<MysqlConfig>,
    #[serde(default)]
    pub gpg: Option<GpgConfig>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/run/tlm-backup.lock")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lock_file: default_lock_file(),
            source: SourceConfig::default(),
            destination: None,
            s3: None,
            ssh: None,
            local: None,
            mysql: None,
            gpg: None,
            retention: RetentionPolicy::default(),
            intervals: IntervalsConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}
