//! The index stored next to every archive.

use crate::backup::compress::Compression;
use crate::backup::digest::Digest;
use crate::backup::encrypt::EncryptionMeta;
use crate::backup::source::SourceItem;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    #[default]
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Added,
    Modified,
    Unchanged,
    Removed,
}

impl ItemStatus {
    /// Whether the item's bytes are in this run's archive
    pub fn is_archived(&self) -> bool {
        matches!(self, ItemStatus::Added | ItemStatus::Modified)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub fingerprint: Digest,
    pub status: ItemStatus,
}

impl ManifestEntry {
    pub fn from_item(item: &SourceItem, status: ItemStatus) -> Self {
        Self {
            path: item.path().clone(),
            size: *item.size(),
            modified: *item.modified(),
            fingerprint: item.fingerprint().clone(),
            status,
        }
    }
}

/// Stored archive facts, filled in once the archive is written
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub key: String,
    pub size: u64,
    pub checksum: Digest,
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    /// The type actually performed, after any incremental-to-full fallback
    pub backup_type: BackupType,
    #[serde(default)]
    pub base_run_id: Option<Uuid>,
    #[serde(default)]
    pub base_archive_key: Option<String>,
    pub compression: Compression,
    #[serde(default)]
    pub encryption: Option<EncryptionMeta>,
    #[serde(default)]
    pub archive: Option<ArchiveRef>,
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new<S: Into<String>>(
        run_id: Uuid,
        job: S,
        started_at: DateTime<Utc>,
        compression: Compression,
    ) -> Self {
        Self {
            run_id,
            job: job.into(),
            started_at,
            backup_type: BackupType::Full,
            base_run_id: None,
            base_archive_key: None,
            compression,
            encryption: None,
            archive: None,
            entries: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: Option<&Manifest>) -> Self {
        match base {
            Some(base) => {
                self.backup_type = BackupType::Incremental;
                self.base_run_id = Some(base.run_id);
                self.base_archive_key = base.archive_key().map(str::to_string);
            }
            None => {
                self.backup_type = BackupType::Full;
                self.base_run_id = None;
                self.base_archive_key = None;
            }
        }
        self
    }

    pub fn archive_key(&self) -> Option<&str> {
        self.archive.as_ref().map(|a| a.key.as_str())
    }

    /// Entries whose bytes live in this run's archive, in archive order
    pub fn archived_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.status.is_archived())
    }

    /// Entries that exist in the source as of this run
    pub fn live_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.status != ItemStatus::Removed)
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Keeps entries in path order so lookups and restore walk the same order
    pub fn sort_entries(&mut self) {
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, status: ItemStatus) -> ManifestEntry {
        ManifestEntry {
            path: PathBuf::from(path),
            size: 1,
            modified: DateTime::<Utc>::UNIX_EPOCH,
            fingerprint: Digest::of_bytes(path),
            status,
        }
    }

    fn manifest() -> Manifest {
        let mut manifest = Manifest::new(Uuid::new_v4(), "job", Utc::now(), Compression::Gzip);
        manifest.entries = vec![
            entry("c", ItemStatus::Removed),
            entry("a", ItemStatus::Added),
            entry("b/x", ItemStatus::Unchanged),
            entry("b", ItemStatus::Modified),
        ];
        manifest.sort_entries();
        manifest
    }

    #[test]
    fn test_sorted_and_filters() {
        let manifest = manifest();
        assert_eq!(
            manifest.entries.iter().map(|e| e.path.clone()).collect::<Vec<_>>(),
            vec![
                PathBuf::from("a"),
                PathBuf::from("b"),
                PathBuf::from("b/x"),
                PathBuf::from("c")
            ]
        );
        assert_eq!(
            manifest.archived_entries().map(|e| e.path.clone()).collect::<Vec<_>>(),
            vec![PathBuf::from("a"), PathBuf::from("b")]
        );
        assert_eq!(manifest.live_entries().count(), 3);
        assert_eq!(manifest.count(ItemStatus::Removed), 1);
    }

    #[test]
    fn test_with_base() {
        let mut base = manifest();
        base.archive = Some(ArchiveRef {
            key: "job/base.tar.gz".into(),
            size: 10,
            checksum: Digest::of_bytes("x"),
        });
        let next = Manifest::new(Uuid::new_v4(), "job", Utc::now(), Compression::Gzip)
            .with_base(Some(&base));
        assert_eq!(next.backup_type, BackupType::Incremental);
        assert_eq!(next.base_run_id, Some(base.run_id));
        assert_eq!(next.base_archive_key.as_deref(), Some("job/base.tar.gz"));

        let full = next.with_base(None);
        assert_eq!(full.backup_type, BackupType::Full);
        assert!(full.base_run_id.is_none());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let manifest = manifest();
        let mut value = serde_json::to_value(&manifest).unwrap();
        value["added_in_a_later_version"] = serde_json::json!({"x": 1});
        let back: Manifest = serde_json::from_value(value).unwrap();
        assert_eq!(back, manifest);
    }
}
