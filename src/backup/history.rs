//! Run history and manifests persisted under the data directory.
//!
//! History is one JSON line per terminal run in `history/<job>.jsonl`.
//! Manifests live in `manifests/<job>/<run id>.json`. Readers ignore fields
//! they do not know.

use crate::backup::manifest::Manifest;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::run::JobRun;
use itertools::Itertools;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

static HISTORY_DIR: &str = "history";
static MANIFEST_DIR: &str = "manifests";

#[derive(Debug)]
pub struct RunHistory {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl RunHistory {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref().join(HISTORY_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            append_lock: Mutex::new(()),
        })
    }

    fn path_of(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{job}.jsonl"))
    }

    /// Writes the whole record with a single append
    pub fn append(&self, run: &JobRun) -> Result<()> {
        let mut line = serde_json::to_vec(run)?;
        line.push(b'\n');

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("history lock poisoned")))?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_of(&run.job))
            .and_then(|mut f| f.write_all(&line))
            .map_err(Error::from)
            .add_msg(format!("Appending run {} of {:?} to history failed", run.id, run.job))
    }

    /// Newest first
    pub fn list(&self, job: &str) -> Result<Vec<JobRun>> {
        let file = match File::open(self.path_of(job)) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobRun>(&line) {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!("Skipping unreadable history line {} of {:?}: {}", n + 1, job, e),
            }
        }
        runs.reverse();
        Ok(runs)
    }
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref().join(MANIFEST_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn job_dir(&self, job: &str) -> PathBuf {
        self.dir.join(job)
    }

    fn path_of(&self, job: &str, run_id: &Uuid) -> PathBuf {
        self.job_dir(job).join(format!("{run_id}.json"))
    }

    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let dir = self.job_dir(&manifest.job);
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::Builder::new().prefix(".manifest-").tempfile_in(&dir)?;
        serde_json::to_writer(&mut tmp, manifest)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.path_of(&manifest.job, &manifest.run_id))
            .map_err(|e| Error::from(e.error))?;
        tracing::debug!("Saved manifest of run {}", manifest.run_id);
        Ok(())
    }

    pub fn load(&self, job: &str, run_id: &Uuid) -> Result<Manifest> {
        let file = File::open(self.path_of(job, run_id))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// All manifests of `job`, newest first
    pub fn list(&self, job: &str) -> Result<Vec<Manifest>> {
        let entries = match std::fs::read_dir(self.job_dir(job)) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match File::open(&path)
                .map_err(Error::from)
                .and_then(|f| Ok(serde_json::from_reader::<_, Manifest>(BufReader::new(f))?))
            {
                Ok(m) => manifests.push(m),
                Err(e) => tracing::warn!("Skipping unreadable manifest {:?}: {}", path, e),
            }
        }
        Ok(manifests
            .into_iter()
            .sorted_by(|a, b| b.started_at.cmp(&a.started_at))
            .collect_vec())
    }

    pub fn find_by_key(&self, job: &str, key: &str) -> Result<Option<Manifest>> {
        Ok(self
            .list(job)?
            .into_iter()
            .find(|m| m.archive_key() == Some(key)))
    }

    /// Removing a missing manifest succeeds
    pub fn remove(&self, job: &str, run_id: &Uuid) -> Result<()> {
        match std::fs::remove_file(self.path_of(job, run_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
