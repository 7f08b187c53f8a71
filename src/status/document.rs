use super::{BackupKind, BackupRecord, RunType};
use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub type Bucket = BTreeMap<String, BackupRecord>;

/// Destination-resident ledger of every backup, bucketed by run type.
///
/// The whole document is read, mutated and written back on every run; it
/// carries no version of its own, so writers must hold the run guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusDocument {
    buckets: BTreeMap<RunType, Bucket>,
}

impl Default for StatusDocument {
    fn default() -> Self {
        Self {
            buckets: RunType::ALL.into_iter().map(|r| (r, Bucket::new())).collect(),
        }
    }
}

impl StatusDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let mut doc: StatusDocument = serde_json::from_slice(bytes)?;
        for run_type in RunType::ALL {
            doc.buckets.entry(run_type).or_default();
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn bucket(&self, run_type: RunType) -> impl Iterator<Item = (&str, &BackupRecord)> {
        self.buckets
            .get(&run_type)
            .into_iter()
            .flat_map(|b| b.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn get(&self, run_type: RunType, name: &str) -> Option<&BackupRecord> {
        self.buckets.get(&run_type).and_then(|b| b.get(name))
    }

    /// Looks a record up by name in any bucket.
    pub fn find(&self, name: &str) -> Option<(RunType, &BackupRecord)> {
        self.buckets
            .iter()
            .find_map(|(run_type, bucket)| bucket.get(name).map(|r| (*run_type, r)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (RunType, &str, &BackupRecord)> {
        self.buckets
            .iter()
            .flat_map(|(r, b)| b.iter().map(move |(k, v)| (*r, k.as_str(), v)))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records of a bucket, oldest first.
    pub fn chronological(&self, run_type: RunType) -> Vec<(&str, &BackupRecord)> {
        let mut records: Vec<_> = self.bucket(run_type).collect();
        records.sort_by(|a, b| {
            a.1.backup_started
                .cmp(&b.1.backup_started)
                .then_with(|| a.0.cmp(b.0))
        });
        records
    }

    /// Most recent full backup in a bucket.
    pub fn latest_full(&self, run_type: RunType) -> Option<(&str, &BackupRecord)> {
        self.chronological(run_type)
            .into_iter()
            .rev()
            .find(|(_, r)| r.is_full())
    }

    /// Most recently finished backup across all run types.
    pub fn latest_backup(&self) -> Option<(RunType, &str)> {
        self.iter()
            .max_by(|a, b| {
                a.2.backup_finished
                    .cmp(&b.2.backup_finished)
                    .then_with(|| a.1.cmp(b.1))
            })
            .map(|(r, name, _)| (r, name))
    }

    /// Name of the full backup an artifact ultimately depends on.
    pub fn full_copy_of(&self, name: &str) -> Result<&str> {
        let mut current = name;
        let mut seen = HashSet::new();
        loop {
            let (_, record) = self
                .find(current)
                .ok_or_else(|| BackupError::Status(format!("no record for {}", current)))?;
            if record.is_full() {
                return Ok(self.key_of(current));
            }
            if !seen.insert(current) {
                return Err(BackupError::Status(format!("lineage cycle at {}", current)));
            }
            current = record.parent.as_deref().ok_or_else(|| {
                BackupError::Status(format!("incremental backup {} has no parent", current))
            })?;
        }
    }

    fn key_of(&self, name: &str) -> &str {
        self.buckets
            .values()
            .find_map(|b| b.get_key_value(name).map(|(k, _)| k.as_str()))
            .unwrap_or_default()
    }

    /// Names of records whose parent is `name`.
    pub fn children(&self, name: &str) -> Vec<(RunType, &str)> {
        self.iter()
            .filter(|(_, _, r)| r.parent.as_deref() == Some(name))
            .map(|(run_type, child, _)| (run_type, child))
            .collect()
    }

    /// Inserts or replaces the record for `(run_type, name)`.
    ///
    /// The record is checked against the document before it is stored.
    pub fn upsert(&mut self, run_type: RunType, name: &str, record: BackupRecord) -> Result<()> {
        if let Some((other, _)) = self.find(name) {
            if other != run_type {
                return Err(BackupError::Status(format!(
                    "{} is already recorded under {}",
                    name, other
                )));
            }
        }
        check_record(name, &record)?;
        if let Some(parent) = &record.parent {
            if parent == name {
                return Err(BackupError::Status(format!("{} is its own parent", name)));
            }
            self.full_copy_of(parent)?;
        }
        self.buckets
            .entry(run_type)
            .or_default()
            .insert(name.to_string(), record);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<BackupRecord> {
        self.buckets.values_mut().find_map(|b| b.remove(name))
    }

    /// Checks every record and every lineage chain in the document.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (_, name, record) in self.iter() {
            if !names.insert(name) {
                return Err(BackupError::Status(format!("{} appears in two buckets", name)));
            }
            check_record(name, record)?;
            if record.kind == BackupKind::Incremental {
                self.full_copy_of(name)?;
            }
        }
        Ok(())
    }
}

fn check_record(name: &str, record: &BackupRecord) -> Result<()> {
    if record.backup_finished < record.backup_started {
        return Err(BackupError::Status(format!(
            "{} finished before it started",
            name
        )));
    }
    match (record.kind, &record.parent) {
        (BackupKind::Incremental, None) => Err(BackupError::Status(format!(
            "incremental backup {} has no parent",
            name
        ))),
        (BackupKind::Full, Some(_)) => Err(BackupError::Status(format!(
            "full backup {} must not have a parent",
            name
        ))),
        _ => Ok(()),
    }
}
