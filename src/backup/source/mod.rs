pub mod files;
pub mod sqlite;

use crate::backup::digest::Digest;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDebugObjectAndFnName;
use crate::backup::source::files::{ExcludeMatcher, FilesSource};
use crate::backup::source::sqlite::SqliteSource;
use chrono::{DateTime, Utc};
use derive_more::From;
use dyn_iter::DynIter;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use validator::{Validate, ValidationErrors};

/// Where a job reads its data from
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SourceConfig {
    /// Directory trees and single files, filtered by exclude globs
    Files(FilesSource),
    /// SQLite databases, copied through the online backup API
    Sqlite(SqliteSource),
}

/// One file-like unit of a backup. Immutable once enumerated.
#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct SourceItem {
    /// Path inside the archive, always relative
    path: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
    fingerprint: Digest,
    #[getset(skip)]
    origin: ItemOrigin,
}

#[derive(Clone, Debug)]
enum ItemOrigin {
    Path(PathBuf),
    /// Kept alive for as long as any clone of the item exists
    Snapshot(Arc<TempPath>),
}

impl SourceItem {
    pub(crate) fn from_path(
        path: PathBuf,
        size: u64,
        modified: DateTime<Utc>,
        fingerprint: Digest,
        origin: PathBuf,
    ) -> Self {
        Self {
            path,
            size,
            modified,
            fingerprint,
            origin: ItemOrigin::Path(origin),
        }
    }

    pub(crate) fn from_snapshot(
        path: PathBuf,
        size: u64,
        modified: DateTime<Utc>,
        fingerprint: Digest,
        snapshot: TempPath,
    ) -> Self {
        Self {
            path,
            size,
            modified,
            fingerprint,
            origin: ItemOrigin::Snapshot(Arc::new(snapshot)),
        }
    }

    pub fn origin_path(&self) -> &Path {
        match &self.origin {
            ItemOrigin::Path(p) => p,
            ItemOrigin::Snapshot(p) => p,
        }
    }

    pub fn open(&self) -> std::io::Result<File> {
        File::open(self.origin_path())
    }
}

/// Produces a finite, deterministically ordered item sequence.
///
/// Root problems fail the whole call. Problems with single items are yielded
/// in place as `Err(SourceUnreadable)` so the caller can skip and count them.
pub trait ItemSource {
    fn items<'a>(&self) -> Result<DynIter<'a, Result<SourceItem>>>;
}

impl ItemSource for SourceConfig {
    fn items<'a>(&self) -> Result<DynIter<'a, Result<SourceItem>>> {
        match self {
            SourceConfig::Files(c) => c.items(),
            SourceConfig::Sqlite(c) => c.items(),
        }
        .add_debug_object_and_fn_name(self.clone(), "items")
    }
}

impl SourceConfig {
    pub fn exclude_matcher(&self) -> Result<ExcludeMatcher> {
        match self {
            SourceConfig::Files(c) => c.exclude_matcher(),
            SourceConfig::Sqlite(_) => Ok(ExcludeMatcher::empty()),
        }
    }
}

impl Validate for SourceConfig {
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        match self {
            SourceConfig::Files(c) => c.validate(),
            SourceConfig::Sqlite(c) => c.validate(),
        }
    }
}

pub(crate) fn modified_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_source_config_deserialize() {
        let yaml = "type: files\npaths: [/etc]\nexclude: ['*.swp']\n";
        let config: SourceConfig = serde_yml::from_str(yaml).unwrap();
        assert!(matches!(config, SourceConfig::Files(_)));

        let yaml = "type: sqlite\npaths: [/var/lib/app.db]\n";
        let config: SourceConfig = serde_yml::from_str(yaml).unwrap();
        assert!(matches!(config, SourceConfig::Sqlite(_)));

        let yaml = "type: ftp\npaths: [/]\n";
        assert!(serde_yml::from_str::<SourceConfig>(yaml).is_err());
    }

    #[test]
    fn test_items_through_config() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), "a").unwrap();
        let config: SourceConfig = FilesSource::builder()
            .paths(vec![temp_dir.path().to_path_buf()])
            .build()
            .into();

        let items: Vec<_> = config.items().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path(), Path::new("a.txt"));
        assert_eq!(items[0].size(), &1);
        assert_eq!(std::fs::read(items[0].origin_path()).unwrap(), b"a");
    }
}
