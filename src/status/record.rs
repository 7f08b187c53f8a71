use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl std::fmt::Display for BackupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// A source configuration file captured at backup time.
///
/// Serialized as a single-entry object `{"<path>": "<base64 content>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub path: String,
    pub content: Vec<u8>,
}

impl Serialize for ConfigSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.path, &STANDARD.encode(&self.content))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ConfigSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(D::Error::custom(format!(
                "config entry must hold exactly one file, found {}",
                map.len()
            )));
        }
        let (path, encoded) = map
            .into_iter()
            .next()
            .ok_or_else(|| D::Error::custom("empty config entry"))?;
        let content = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("bad base64 for {}: {}", path, e)))?;
        Ok(Self { path, content })
    }
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Unix timestamps written as whole seconds and read back from either
/// integer or fractional seconds.
mod unix_seconds {
    use chrono::{DateTime, Utc};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        chrono::serde::ts_seconds::serialize(at, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        deserializer.deserialize_any(SecondsVisitor)
    }

    struct SecondsVisitor;

    impl<'de> Visitor<'de> for SecondsVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a unix timestamp in seconds")
        }

        fn visit_i64<E: de::Error>(self, secs: i64) -> Result<Self::Value, E> {
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| E::custom(format!("timestamp {} is out of range", secs)))
        }

        fn visit_u64<E: de::Error>(self, secs: u64) -> Result<Self::Value, E> {
            let secs = i64::try_from(secs)
                .map_err(|_| E::custom(format!("timestamp {} is out of range", secs)))?;
            self.visit_i64(secs)
        }

        fn visit_f64<E: de::Error>(self, secs: f64) -> Result<Self::Value, E> {
            if !secs.is_finite() {
                return Err(E::custom(format!("timestamp {} is not finite", secs)));
            }
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
                .ok_or_else(|| E::custom(format!("timestamp {} is out of range", secs)))
        }
    }
}

/// Metadata of one persisted backup, keyed by run type and artifact name
/// inside the [`StatusDocument`](super::StatusDocument).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    #[serde(rename = "binlog", default)]
    pub binlog_file: Option<String>,

    #[serde(rename = "position", default)]
    pub binlog_position: Option<u64>,

    #[serde(default)]
    pub lsn: Option<u64>,

    #[serde(rename = "type")]
    pub kind: BackupKind,

    #[serde(with = "unix_seconds", default = "unix_epoch")]
    pub backup_started: DateTime<Utc>,

    #[serde(with = "unix_seconds", default = "unix_epoch")]
    pub backup_finished: DateTime<Utc>,

    #[serde(default)]
    pub config: Vec<ConfigSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wsrep_provider_version: Option<String>,
}

impl BackupRecord {
    pub fn is_full(&self) -> bool {
        self.kind == BackupKind::Full
    }

    pub fn duration_secs(&self) -> i64 {
        (self.backup_finished - self.backup_started).num_seconds()
    }
}
