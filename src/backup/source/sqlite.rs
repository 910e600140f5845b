use crate::backup::digest::Digest;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::source::{modified_time, ItemSource, SourceItem};
use crate::backup::validate::validate_source_roots;
use bon::Builder;
use dyn_iter::{DynIter, IntoDynIterator};
use getset::Getters;
use rusqlite::{Connection, OpenFlags, MAIN_DB};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

/// SQLite databases snapshotted with the online backup API, so the copy is
/// consistent even while other processes write to the database.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SqliteSource {
    #[validate(custom(function = validate_source_roots))]
    #[builder(into)]
    paths: Vec<PathBuf>,
}

impl ItemSource for SqliteSource {
    fn items<'a>(&self) -> Result<DynIter<'a, Result<SourceItem>>> {
        let mut paths = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            if !path.is_file() {
                return Err(Error::source_unreadable(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "database file not found")
                        .into(),
                ));
            }
            let name = path.file_name().map(PathBuf::from).ok_or_else(|| {
                Error::InvalidConfig(format!("database path {path:?} has no file name"))
            })?;
            paths.push((name, path.clone()));
        }
        paths.sort();
        tracing::info!("Snapshotting {} sqlite database(s)", paths.len());

        Ok(paths
            .into_iter()
            .map(|(name, path)| {
                snapshot(&name, &path).map_err(|e| {
                    tracing::warn!("Cannot snapshot {:?}: {}", path, e);
                    Error::item_unreadable(path, name, e)
                })
            })
            .into_dyn_iter())
    }
}

fn snapshot(name: &Path, path: &Path) -> Result<SourceItem> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let modified = modified_time(&std::fs::metadata(path)?);

    let snapshot = tempfile::Builder::new()
        .prefix(".gong-sqlite-")
        .tempfile()?
        .into_temp_path();
    conn.backup(MAIN_DB, &snapshot, None)?;
    tracing::debug!("Snapshot of {:?} written to {:?}", path, snapshot);

    let (fingerprint, size) = Digest::of_reader(File::open(&snapshot)?)?;
    Ok(SourceItem::from_snapshot(
        name.to_path_buf(),
        size,
        modified,
        fingerprint,
        snapshot,
    ))
}
