pub mod local;
pub mod object_store;
pub mod retry;

use crate::backup::compress::Compression;
use crate::backup::destination::local::LocalDestination;
use crate::backup::destination::object_store::{GcsConfig, ObjectStoreDestination, S3Config};
use crate::backup::digest::Digest;
use crate::backup::encrypt::EncryptionMeta;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::manifest::BackupType;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDebugObjectAndFnName;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Debug;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

static TIME_FORMAT: &str = "%Y-%m-%dT%Hh%Mm%Ss%z";
static TAR_FILE_EXT: &str = "tar";
static ENCRYPTED_FILE_EXT: &str = "age";
static STAGING_SUFFIX: &str = ".partial";

/// Storage capability every backend provides.
///
/// `put` is atomic: the object is either fully readable under `key` or not
/// there at all. `delete` of a missing key succeeds. Transient failures come
/// back as `DestinationUnavailable`, permanent ones as `DestinationRejected`.
pub trait Destination: Debug + Send + Sync {
    /// Stores everything `reader` yields and returns the checksum of the stored bytes
    fn put(&self, key: &str, reader: &mut dyn Read) -> Result<Digest>;
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;
    /// Objects under the directory-like `prefix`, ordered by key
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Selected by the `type` field
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum DestinationConfig {
    Local { path: PathBuf },
    /// Any S3-compatible object store
    S3(S3Config),
    Gcs(GcsConfig),
    /// Process-local store, lost on exit
    Memory,
}

impl DestinationConfig {
    pub fn build(&self, call_timeout: Duration) -> Result<Arc<dyn Destination>> {
        match self {
            DestinationConfig::Local { path } => LocalDestination::new(path)
                .map(|d| Arc::new(d.with_timeout(call_timeout)) as Arc<dyn Destination>),
            DestinationConfig::S3(c) => ObjectStoreDestination::s3(c, call_timeout)
                .map(|d| Arc::new(d) as Arc<dyn Destination>),
            DestinationConfig::Gcs(c) => ObjectStoreDestination::gcs(c, call_timeout)
                .map(|d| Arc::new(d) as Arc<dyn Destination>),
            DestinationConfig::Memory => ObjectStoreDestination::memory(call_timeout)
                .map(|d| Arc::new(d) as Arc<dyn Destination>),
        }
        .add_debug_object_and_fn_name(self.clone(), "build")
    }
}

/// An archive as listed at the destination
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveObject {
    pub key: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub run_tag: String,
    pub backup_type: BackupType,
    pub compression: Compression,
    pub encrypted: bool,
    /// Known when the run's manifest is still around
    pub checksum: Option<Digest>,
    pub encryption: Option<EncryptionMeta>,
}

/// The parts an archive key is built from.
///
/// `<job>/<job>.<time>.<run>.<full|incremental>.tar[.gz|.lz4|.xz][.age]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveName {
    pub job: String,
    pub created: DateTime<Utc>,
    pub run_tag: String,
    pub backup_type: BackupType,
    pub compression: Compression,
    pub encrypted: bool,
}

pub fn run_tag(run_id: &Uuid) -> String {
    run_id.simple().to_string()[..8].to_string()
}

pub fn job_prefix(job: &str) -> String {
    format!("{job}/")
}

pub fn staging_key(key: &str) -> String {
    format!("{key}{STAGING_SUFFIX}")
}

impl ArchiveName {
    pub fn key(&self) -> String {
        let time = self
            .created
            .format(TIME_FORMAT)
            .to_string()
            .replace('+', "_");
        let exts = std::iter::once(TAR_FILE_EXT)
            .chain(self.compression.file_ext())
            .chain(self.encrypted.then_some(ENCRYPTED_FILE_EXT))
            .join(".");
        format!(
            "{}{}.{}.{}.{}.{}",
            job_prefix(&self.job),
            self.job,
            time,
            self.run_tag,
            self.backup_type,
            exts
        )
    }

    /// `None` for anything that is not a finished archive of `job`
    pub fn parse(job: &str, key: &str) -> Option<Self> {
        let file_name = key.strip_prefix(job_prefix(job).as_str())?;
        let rest = file_name.strip_prefix(format!("{job}.").as_str())?;
        let mut parts = rest.split('.');

        let time = parts.next()?.replace('_', "+");
        let created = DateTime::parse_from_str(&time, TIME_FORMAT).ok()?.to_utc();
        let run_tag = parts.next()?.to_string();
        let backup_type = match parts.next()? {
            "full" => BackupType::Full,
            "incremental" => BackupType::Incremental,
            _ => return None,
        };
        if parts.next()? != TAR_FILE_EXT {
            return None;
        }

        let mut compression = Compression::None;
        let mut encrypted = false;
        let mut next = parts.next();
        if let Some(c) = next.and_then(Compression::from_file_ext) {
            compression = c;
            next = parts.next();
        }
        if next == Some(ENCRYPTED_FILE_EXT) {
            encrypted = true;
            next = parts.next();
        }
        if next.is_some() {
            return None;
        }

        Some(Self {
            job: job.to_string(),
            created,
            run_tag,
            backup_type,
            compression,
            encrypted,
        })
    }
}

/// Finished archives of `job`, newest first. Staging objects are skipped.
pub fn list_archives(destination: &dyn Destination, job: &str) -> Result<Vec<ArchiveObject>> {
    let archives = destination
        .list(&job_prefix(job))?
        .into_iter()
        .filter_map(|o| {
            let name = ArchiveName::parse(job, &o.key);
            if name.is_none() {
                tracing::trace!("Ignoring foreign object {:?}", o.key);
            }
            name.map(|n| ArchiveObject {
                key: o.key,
                size: o.size,
                created: n.created,
                run_tag: n.run_tag,
                backup_type: n.backup_type,
                compression: n.compression,
                encrypted: n.encrypted,
                checksum: None,
                encryption: None,
            })
        })
        .sorted_by(|a, b| b.created.cmp(&a.created).then_with(|| b.key.cmp(&a.key)))
        .collect_vec();
    Ok(archives)
}
