//! Drives job runs end to end and serves the operations built on their
//! results: run history, archive listing, restore, prune and cancel.
//!
//! A run enumerates on its own thread and feeds a bounded queue that the
//! archiving side drains, so memory stays flat regardless of source size.
//! The archive is spooled under the data directory, uploaded to a staging
//! key, verified and only then renamed to its final key.

use crate::backup::backup_config::{BackupOptions, Config, JobConfig};
use crate::backup::destination::{
    list_archives as list_destination_archives, run_tag, staging_key, ArchiveName, ArchiveObject,
    Destination,
};
use crate::backup::compress::Compression;
use crate::backup::differ::SnapshotDiffer;
use crate::backup::digest::Digest;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::function_path;
use crate::backup::history::{ManifestStore, RunHistory};
use crate::backup::manifest::{ArchiveRef, BackupType, ItemStatus, Manifest, ManifestEntry};
use crate::backup::pipeline::{open_archive, ArchiveWriter, SpooledArchive};
use crate::backup::result_error::error::{Error, FailureKind};
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::retention::RetentionPlan;
use crate::backup::run::{JobRun, RunState};
use crate::backup::scheduler::locks::{CancelToken, JobLockGuard, JobLocks};
use crate::backup::source::{ItemSource, SourceConfig, SourceItem};
use crate::backup::verify::Verifier;
use chrono::{DateTime, TimeDelta, Utc};
use function_name::named;
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use walkdir::WalkDir;

static SPOOL_DIR: &str = "spool";
static SPOOL_PREFIX: &str = ".spool-";
static ITEM_QUEUE_BOUND: usize = 64;
static MAX_FAILURE_NOTES: u64 = 20;

/// Outcome of [`Engine::admit`]
#[derive(Debug)]
pub enum Admission {
    Admitted(JobLockGuard),
    Skipped(JobRun),
}

pub struct Engine {
    config: Config,
    destinations: HashMap<String, Arc<dyn Destination>>,
    history: RunHistory,
    manifests: ManifestStore,
    locks: JobLocks,
    spool_dir: PathBuf,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_destinations(config, HashMap::new())
    }

    /// Jobs missing from `destinations` get the backend their config names.
    pub fn with_destinations(
        config: Config,
        mut destinations: HashMap<String, Arc<dyn Destination>>,
    ) -> Result<Self> {
        let call_timeout = *config.global().call_timeout();
        for job in config.jobs() {
            if destinations.contains_key(job.name()) {
                continue;
            }
            let destination = job
                .destination()
                .build(call_timeout)
                .add_msg(format!("Cannot set up destination of job {:?}", job.name()))?;
            destinations.insert(job.name().clone(), destination);
        }

        let data_dir = config.global().data_dir().clone();
        let spool_dir = data_dir.join(SPOOL_DIR);
        std::fs::create_dir_all(&spool_dir)?;
        clear_stale_spools(&spool_dir);

        Ok(Self {
            history: RunHistory::open(&data_dir)?,
            manifests: ManifestStore::open(&data_dir)?,
            locks: JobLocks::default(),
            spool_dir,
            destinations,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn job(&self, name: &str) -> Result<(&JobConfig, &dyn Destination)> {
        let job = self.config.job(name)?;
        let destination = self
            .destinations
            .get(name)
            .ok_or_else(|| Error::JobNotFound(name.to_string()))?;
        Ok((job, destination.as_ref()))
    }

    pub fn run_job(&self, name: &str) -> Result<JobRun> {
        self.run_job_at(name, Utc::now())
    }

    /// Runs `name` to a terminal state and records the result.
    ///
    /// Only an unknown job is an `Err`; every run outcome, including a
    /// failure, comes back as the returned [`JobRun`].
    pub fn run_job_at(&self, name: &str, triggered_at: DateTime<Utc>) -> Result<JobRun> {
        match self.admit(name, triggered_at)? {
            Admission::Admitted(lock) => self.run_admitted(lock, triggered_at),
            Admission::Skipped(run) => Ok(run),
        }
    }

    /// Takes the job's lock for a trigger at `triggered_at`. A busy job turns
    /// the trigger into a recorded `Skipped` run right away.
    pub fn admit(&self, name: &str, triggered_at: DateTime<Utc>) -> Result<Admission> {
        self.job(name)?;
        if let Some(lock) = self.locks.try_acquire(name) {
            return Ok(Admission::Admitted(lock));
        }

        tracing::warn!("{:?} is still running, dropping trigger of {}", name, triggered_at);
        let mut run = JobRun::new(name, triggered_at);
        run.skip(format!("a previous run of {name:?} is still active"))?;
        self.record(&run);
        Ok(Admission::Skipped(run))
    }

    /// Runs the job `lock` was taken for and releases it once the run is
    /// recorded.
    pub fn run_admitted(&self, lock: JobLockGuard, triggered_at: DateTime<Utc>) -> Result<JobRun> {
        let name = lock.job().to_string();
        let (job, destination) = self.job(&name)?;
        let mut run = JobRun::new(&name, triggered_at);

        run.transition(RunState::Running)?;
        tracing::info!("Run {} of {:?} started", run.id, name);
        match self.execute(job, destination, &mut run, lock.token()) {
            Ok(()) => {
                run.transition(RunState::Completed)?;
                tracing::info!(
                    "Run {} of {:?} completed: {} item(s), {} archived, {} failed, {} bytes stored",
                    run.id,
                    name,
                    run.items_total,
                    run.items_archived,
                    run.items_failed,
                    run.bytes_stored
                );
                match self.apply_retention(job, destination, job.retention().dry_run) {
                    Ok(plan) if !plan.delete.is_empty() && !job.retention().dry_run => {
                        run.add_note(format!("pruned {} archive(s)", plan.delete.len()))
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Retention of {:?} failed: {}", name, e);
                        run.add_note(format!("retention failed: {e}"));
                    }
                }
            }
            Err(e) => {
                tracing::error!("Run {} of {:?} failed: {}", run.id, name, e);
                run.fail(&e)?;
            }
        }

        self.record(&run);
        drop(lock);
        Ok(run)
    }

    fn record(&self, run: &JobRun) {
        if let Err(e) = self.history.append(run) {
            tracing::error!("Cannot record run {} of {:?}: {}", run.id, run.job, e);
        }
    }

    fn execute(
        &self,
        job: &JobConfig,
        destination: &dyn Destination,
        run: &mut JobRun,
        token: &CancelToken,
    ) -> Result<()> {
        let options = job.options();
        let encryptor = options.encryptor();

        let base = self.select_base(job, destination, run)?;
        let started_at = run.started_at.unwrap_or(run.triggered_at);
        let mut manifest = Manifest::new(run.id, job.name(), started_at, *options.compression())
            .with_base(base.as_ref());
        run.backup_type = Some(manifest.backup_type);

        let spooled = self.archive(job, base.as_ref(), &mut manifest, run, token)?;
        ensure_not_cancelled(token)?;

        let key = ArchiveName {
            job: job.name().clone(),
            created: started_at,
            run_tag: run_tag(&run.id),
            backup_type: manifest.backup_type,
            compression: *options.compression(),
            encrypted: encryptor.is_enabled(),
        }
        .key();
        let staging = staging_key(&key);

        let retry = self.config.global().retry();
        tracing::info!(
            "Uploading {} bytes from {:?} to {:?}",
            spooled.size,
            spooled.path(),
            staging
        );
        let stored_checksum = retry
            .run("put", || destination.put(&staging, &mut spooled.reader()?))
            .add_msg(format!("Uploading {staging:?} failed"))?;
        manifest.encryption = spooled.encryption.clone();
        manifest.archive = Some(ArchiveRef {
            key: key.clone(),
            size: spooled.size,
            checksum: spooled.checksum.clone(),
        });
        run.bytes_stored = spooled.size;
        drop(spooled);

        let promoted = self.promote(job, destination, &key, &stored_checksum, &manifest, run);
        if let Err(e) = promoted {
            discard(destination, &staging);
            discard(destination, &key);
            return Err(e);
        }

        if let Err(e) = self.manifests.save(&manifest) {
            discard(destination, &key);
            return Err(e.add_msg(format!("Saving manifest of run {} failed", run.id)));
        }
        run.archive_key = Some(key);
        Ok(())
    }

    /// Verifies the staged object if the job asks for it, then gives it its
    /// final key.
    fn promote(
        &self,
        job: &JobConfig,
        destination: &dyn Destination,
        key: &str,
        stored_checksum: &Digest,
        manifest: &Manifest,
        run: &mut JobRun,
    ) -> Result<()> {
        let retry = self.config.global().retry();
        let staging = staging_key(key);
        let packed_checksum = manifest
            .archive
            .as_ref()
            .map(|a| &a.checksum)
            .ok_or_else(|| Error::VerificationFailed {
                key: staging.clone(),
                reason: "no archive checksum recorded".into(),
            })?;
        if stored_checksum != packed_checksum {
            return Err(Error::VerificationFailed {
                key: staging,
                reason: format!(
                    "destination stored {stored_checksum}, archive packed as {packed_checksum}"
                ),
            });
        }

        if *job.options().verification() {
            run.transition(RunState::Verifying)?;
            Verifier::new(destination, retry).verify(&staging, manifest, &job.options().encryptor())?;
        } else {
            tracing::debug!("Verification disabled for {:?}", job.name());
        }

        retry
            .run("rename", || destination.rename(&staging, key))
            .add_msg(format!("Promoting {staging:?} to {key:?} failed"))
    }

    /// The manifest to diff against, or `None` for a full backup. Falling
    /// back from incremental to full is noted on the run.
    fn select_base(
        &self,
        job: &JobConfig,
        destination: &dyn Destination,
        run: &mut JobRun,
    ) -> Result<Option<Manifest>> {
        if *job.options().backup_type() == BackupType::Full {
            return Ok(None);
        }

        let name = job.name();
        let Some(latest) = self
            .manifests
            .list(name)?
            .into_iter()
            .find(|m| m.archive.is_some())
        else {
            run.add_note("no previous successful run, performed a full backup instead of incremental");
            return Ok(None);
        };

        let chain = match self.chain(name, latest) {
            Ok(chain) => chain,
            Err(e) => {
                run.add_note(format!(
                    "base chain unreadable, performed a full backup instead of incremental: {e}"
                ));
                return Ok(None);
            }
        };

        let max_age = TimeDelta::from_std(job.retention().max_age).unwrap_or(TimeDelta::MAX);
        if let Some(root) = chain.first() {
            if Utc::now().signed_duration_since(root.started_at) > max_age {
                run.add_note(format!(
                    "full backup of run {} is older than max_age, performed a full backup instead of incremental",
                    root.run_id
                ));
                return Ok(None);
            }
        }

        let retry = self.config.global().retry();
        for manifest in &chain {
            let Some(key) = manifest.archive_key() else {
                continue;
            };
            if !retry.run("exists", || destination.exists(key))? {
                run.add_note(format!(
                    "base archive {key:?} is gone, performed a full backup instead of incremental"
                ));
                return Ok(None);
            }
        }

        let base = chain.into_iter().last();
        if let Some(base) = &base {
            tracing::info!("Incremental run {} based on run {}", run.id, base.run_id);
        }
        Ok(base)
    }

    /// `manifest` and its bases, the full backup first
    fn chain(&self, job: &str, manifest: Manifest) -> Result<Vec<Manifest>> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        let mut current = manifest;
        loop {
            if !seen.insert(current.run_id) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("base chain of {job:?} loops at run {}", current.run_id),
                )));
            }
            let base = current.base_run_id;
            chain.push(current);
            match base {
                None => break,
                Some(id) => {
                    current = self
                        .manifests
                        .load(job, &id)
                        .add_msg(format!("Base manifest {id} of {job:?} unreadable"))?
                }
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// Enumerates on a producer thread and packs on this one. Fills in the
    /// manifest entries and returns the spooled archive.
    #[named]
    fn archive(
        &self,
        job: &JobConfig,
        base: Option<&Manifest>,
        manifest: &mut Manifest,
        run: &mut JobRun,
        token: &CancelToken,
    ) -> Result<SpooledArchive> {
        let options = job.options();
        let source = job.source();
        let mut writer = ArchiveWriter::create(
            &self.spool_dir,
            *options.compression(),
            *options.compression_level(),
            &options.encryptor(),
            source.exclude_matcher()?,
        )
        .map_err(Error::archive)?;

        let (tx, rx) = sync_channel(ITEM_QUEUE_BOUND);
        std::thread::scope(|scope| {
            let producer = scope.spawn(move || enumerate(source, tx));
            let packed = pack(rx, &mut writer, base, manifest, run, options, token);
            let enumerated = producer.join().unwrap_or_else(|_| {
                Err(Error::Io(std::io::Error::other("enumeration thread panicked")))
            });
            match (packed, enumerated) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
                (Err(e1), Err(e2)) => Err(e1.chain(e2)),
            }
        })
        .add_fn_name(function_path!())?;

        manifest.sort_entries();
        tracing::info!(
            "{} added, {} modified, {} unchanged, {} removed",
            manifest.count(ItemStatus::Added),
            manifest.count(ItemStatus::Modified),
            manifest.count(ItemStatus::Unchanged),
            manifest.count(ItemStatus::Removed)
        );
        writer.finish()
    }

    pub fn list_runs(&self, name: &str) -> Result<Vec<JobRun>> {
        self.config.job(name)?;
        self.history.list(name)
    }

    /// Archives at the destination, newest first, with checksum and
    /// encryption details joined in from the manifests still on record.
    pub fn list_archives(&self, name: &str) -> Result<Vec<ArchiveObject>> {
        let (_, destination) = self.job(name)?;
        let manifests: HashMap<String, Manifest> = self
            .manifests
            .list(name)?
            .into_iter()
            .filter_map(|m| m.archive_key().map(str::to_string).map(|k| (k, m)))
            .collect();

        let mut archives = self
            .config
            .global()
            .retry()
            .run("list", || list_destination_archives(destination, name))?;
        for archive in &mut archives {
            if let Some(manifest) = manifests.get(&archive.key) {
                archive.checksum = manifest.archive.as_ref().map(|a| a.checksum.clone());
                archive.encryption = manifest.encryption.clone();
            }
        }
        Ok(archives)
    }

    pub fn prune(&self, name: &str, dry_run: bool) -> Result<RetentionPlan> {
        let (job, destination) = self.job(name)?;
        self.apply_retention(job, destination, dry_run)
    }

    /// Deletes at the destination first and drops the manifest after, so a
    /// manifest never goes missing for an object that still exists.
    fn apply_retention(
        &self,
        job: &JobConfig,
        destination: &dyn Destination,
        dry_run: bool,
    ) -> Result<RetentionPlan> {
        let name = job.name();
        let manifests = self.manifests.list(name)?;
        let base_of: HashMap<String, String> = manifests
            .iter()
            .filter_map(|m| Some((m.archive_key()?.to_string(), m.base_archive_key.clone()?)))
            .collect();
        let objects = self.list_archives(name)?;
        let plan = job.retention().plan(&objects, &base_of, Utc::now());

        for kept in &plan.keep {
            tracing::debug!(
                "Keeping {:?} ({})",
                kept.object.key,
                kept.reasons.iter().join(", ")
            );
        }
        if dry_run {
            for deleted in &plan.delete {
                tracing::info!("Would delete {:?} ({})", deleted.object.key, deleted.reason);
            }
            return Ok(plan);
        }

        let retry = self.config.global().retry();
        let errors = plan
            .delete
            .iter()
            .filter_map(|deleted| {
                let key = deleted.object.key.as_str();
                tracing::info!("Deleting {:?} ({})", key, deleted.reason);
                retry
                    .run("delete", || destination.delete(key))
                    .and_then(|_| {
                        manifests
                            .iter()
                            .filter(|m| m.archive_key() == Some(key))
                            .try_for_each(|m| self.manifests.remove(name, &m.run_id))
                    })
                    .add_msg(format!("Pruning {key:?} failed"))
                    .err()
            })
            .collect_vec();
        convert_error_vec(errors)?;
        Ok(plan)
    }

    /// Unpacks `key` into `target`. An incremental archive is applied on top
    /// of its base chain. With `full_tree`, files under `target` that the
    /// restored state does not contain are removed.
    pub fn restore<P: AsRef<Path>>(
        &self,
        name: &str,
        key: &str,
        target: P,
        full_tree: bool,
    ) -> Result<()> {
        let (job, destination) = self.job(name)?;
        let target = target.as_ref();
        std::fs::create_dir_all(target)?;

        let Some(manifest) = self.manifests.find_by_key(name, key)? else {
            let archive =
                ArchiveName::parse(name, key).ok_or_else(|| Error::ObjectNotFound(key.into()))?;
            tracing::warn!("No manifest for {:?}, restoring the archive on its own", key);
            if archive.backup_type == BackupType::Incremental {
                tracing::warn!("{:?} is incremental, files from its base are not restored", key);
            }
            if full_tree {
                tracing::warn!("Full-tree restore needs the manifest, leaving other files in place");
            }
            let decryptor = job.options().decryptor(archive.encrypted)?;
            self.unpack(destination, key, archive.compression, &decryptor, target, |_| true)?;
            return Ok(());
        };

        let chain = self.chain(name, manifest)?;
        let live: HashSet<PathBuf> = chain
            .last()
            .map(|m| m.live_entries().map(|e| e.path.clone()).collect())
            .unwrap_or_default();
        for manifest in &chain {
            let archive_key = manifest
                .archive_key()
                .ok_or_else(|| Error::ObjectNotFound(format!("archive of run {}", manifest.run_id)))?;
            let decryptor = job.options().decryptor(manifest.encryption.is_some())?;
            self.unpack(
                destination,
                archive_key,
                manifest.compression,
                &decryptor,
                target,
                |path| live.contains(path),
            )?;
        }

        if full_tree {
            remove_untracked(target, &live)?;
        }
        tracing::info!("Restored {} file(s) of {:?} into {:?}", live.len(), key, target);
        Ok(())
    }

    fn unpack<F: Fn(&Path) -> bool>(
        &self,
        destination: &dyn Destination,
        key: &str,
        compression: Compression,
        decryptor: &EncryptorConfig,
        target: &Path,
        wanted: F,
    ) -> Result<usize> {
        tracing::info!("Unpacking {:?} into {:?}", key, target);
        let reader = self
            .config
            .global()
            .retry()
            .run("get", || destination.get(key))?;
        let mut archive = open_archive(reader, compression, decryptor)?;

        let mut count = 0;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if !wanted(&path) {
                tracing::trace!("Skipping {:?}, not part of the restored state", path);
                continue;
            }
            if !entry.unpack_in(target)? {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("entry {path:?} of {key:?} points outside the restore target"),
                )));
            }
            count += 1;
        }
        tracing::debug!("Unpacked {} entries of {:?}", count, key);
        Ok(count)
    }

    /// Returns whether `name` had an active run to cancel
    pub fn cancel(&self, name: &str) -> Result<bool> {
        self.config.job(name)?;
        let cancelled = self.locks.cancel(name);
        if cancelled {
            tracing::info!("Cancellation of {:?} requested", name);
        }
        Ok(cancelled)
    }
}

fn ensure_not_cancelled(token: &CancelToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn enumerate(source: &SourceConfig, tx: SyncSender<Result<SourceItem>>) -> Result<()> {
    for item in source.items()? {
        if tx.send(item).is_err() {
            tracing::debug!("Archiving stopped, ending enumeration early");
            break;
        }
    }
    Ok(())
}

fn pack(
    rx: Receiver<Result<SourceItem>>,
    writer: &mut ArchiveWriter,
    base: Option<&Manifest>,
    manifest: &mut Manifest,
    run: &mut JobRun,
    options: &BackupOptions,
    token: &CancelToken,
) -> Result<()> {
    let mut differ = SnapshotDiffer::new(base);
    for item in rx {
        ensure_not_cancelled(token)?;
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                let carried = e
                    .unreadable_item()
                    .map(|path| differ.carry_forward(path))
                    .unwrap_or_default();
                manifest.entries.extend(carried);
                item_failed(options, run, e)?;
                continue;
            }
        };

        let status = differ.classify(&item);
        if !status.is_archived() {
            run.items_total += 1;
            manifest.entries.push(ManifestEntry::from_item(&item, status));
            continue;
        }
        match writer.append(&item) {
            Ok(Some(packed)) => {
                run.items_total += 1;
                run.items_archived += 1;
                run.bytes_read += packed.size;
                let mut entry = ManifestEntry::from_item(&item, status);
                entry.fingerprint = packed.fingerprint;
                entry.size = packed.size;
                manifest.entries.push(entry);
            }
            Ok(None) => {}
            Err(e) if e.kind() == FailureKind::SourceUnreadable => {
                manifest.entries.extend(differ.carry_forward(item.path()));
                item_failed(options, run, e)?
            }
            Err(e) => return Err(e),
        }
    }
    manifest.entries.extend(differ.removed());
    Ok(())
}

/// Records an unreadable item, or aborts when the job's policy says so.
fn item_failed(options: &BackupOptions, run: &mut JobRun, error: Error) -> Result<()> {
    run.items_failed += 1;
    if *options.strict_source() {
        return Err(error.add_msg("strict_source is set, aborting on unreadable item"));
    }
    if let Some(max) = options.max_item_failures() {
        if run.items_failed > *max {
            return Err(error.add_msg(format!("more than {max} item(s) unreadable")));
        }
    }

    tracing::warn!("Skipping unreadable item: {}", error);
    if run.items_failed <= MAX_FAILURE_NOTES {
        run.add_note(format!("skipped unreadable item: {error}"));
    } else if run.items_failed == MAX_FAILURE_NOTES + 1 {
        run.add_note("further unreadable items omitted from notes");
    }
    Ok(())
}

fn discard(destination: &dyn Destination, key: &str) {
    if let Err(e) = destination.delete(key) {
        tracing::error!("Cannot remove {:?} after failed run: {}", key, e);
    }
}

fn clear_stale_spools(spool_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(spool_dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let stale = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(SPOOL_PREFIX));
        if stale {
            tracing::debug!("Removing stale spool file {:?}", entry.path());
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::warn!("Cannot remove stale spool file {:?}: {}", entry.path(), e);
            }
        }
    }
}

/// Deletes files under `target` that are not in `live`, then directories
/// left empty.
fn remove_untracked(target: &Path, live: &HashSet<PathBuf>) -> Result<()> {
    for entry in WalkDir::new(target).min_depth(1).contents_first(true) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(target)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_dir() {
            if std::fs::read_dir(entry.path())?.next().is_none() {
                tracing::debug!("Removing empty directory {:?}", entry.path());
                std::fs::remove_dir(entry.path())?;
            }
        } else if !live.contains(relative) {
            tracing::info!("Removing {:?}, absent from the restored state", entry.path());
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
