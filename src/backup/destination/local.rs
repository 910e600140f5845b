use crate::backup::destination::{Destination, StoredObject};
use crate::backup::digest::{Digest, HashingReader};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::validate::validate_dir_exist_or_created;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::time::Duration;
use walkdir::WalkDir;

static TMP_PREFIX: &str = ".tmp-put-";
static IO_CHUNK: usize = 1024 * 1024;
static DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Archives as plain files under a root directory. Puts go to a temp file
/// in the target directory and are renamed into place.
///
/// Every filesystem call runs on its own thread bounded by the call timeout,
/// so a hung network mount surfaces as `DestinationUnavailable`.
#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: PathBuf,
    timeout: Duration,
}

impl LocalDestination {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        validate_dir_exist_or_created(&root).map_err(|e| {
            Error::DestinationRejected(format!("local destination {root:?}: {e}"))
        })?;
        Ok(Self {
            root,
            timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::DestinationRejected(format!("invalid key {key:?}")));
        }
        Ok(self.root.join(relative))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        Some(
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .join("/"),
        )
    }

    fn call<T, F>(&self, op: &str, key: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        run_timed(self.timeout, f).map_err(|e| {
            if e.kind() == ErrorKind::TimedOut {
                tracing::warn!("{} {:?} under {:?} timed out", op, key, self.root);
            }
            io_error(op, key, e)
        })
    }
}

/// Runs `f` on a detached thread and waits at most `timeout` for it
fn run_timed<T, F>(timeout: Duration, f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    let (tx, rx) = sync_channel(1);
    std::thread::Builder::new()
        .name("gong-local-io".into())
        .spawn(move || {
            let _ = tx.send(f());
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("timed out after {timeout:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(std::io::Error::other("io thread panicked")),
    }
}

fn io_error(op: &str, key: &str, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::ObjectNotFound(key.to_string()),
        ErrorKind::PermissionDenied
        | ErrorKind::ReadOnlyFilesystem
        | ErrorKind::StorageFull
        | ErrorKind::QuotaExceeded
        | ErrorKind::InvalidInput => {
            Error::DestinationRejected(format!("{op} {key:?}: {e}"))
        }
        _ => Error::DestinationUnavailable(format!("{op} {key:?}: {e}")),
    }
}

fn read_chunk<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(IO_CHUNK);
    reader.take(IO_CHUNK as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

impl Destination for LocalDestination {
    fn put(&self, key: &str, reader: &mut dyn Read) -> Result<Digest> {
        let path = self.path_of(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::DestinationRejected(format!("invalid key {key:?}")))?
            .to_path_buf();

        let mut tmp = self.call("put", key, move || {
            std::fs::create_dir_all(&parent)?;
            tempfile::Builder::new()
                .prefix(TMP_PREFIX)
                .tempfile_in(&parent)
        })?;
        let mut reader = HashingReader::new(reader);
        loop {
            let chunk = read_chunk(&mut reader).map_err(|e| io_error("put", key, e))?;
            if chunk.is_empty() {
                break;
            }
            tmp = self.call("put", key, move || {
                tmp.as_file_mut().write_all(&chunk)?;
                Ok(tmp)
            })?;
        }
        let target = path.clone();
        self.call("put", key, move || {
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map(|_| ()).map_err(|e| e.error)
        })?;

        let (digest, size) = reader.finalize();
        tracing::debug!("Stored {:?} ({} bytes) at {:?}", key, size, path);
        Ok(digest)
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_of(key)?;
        let file = self.call("get", key, move || File::open(path))?;
        Ok(Box::new(TimedReader {
            file: Some(file),
            timeout: self.timeout,
            chunk: Vec::new(),
            pos: 0,
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let this = self.clone();
        let dir = self.root.join(prefix.trim_end_matches('/'));
        self.call("list", prefix, move || {
            if !dir.is_dir() {
                return Ok(Vec::new());
            }
            let mut objects = Vec::new();
            for entry in WalkDir::new(&dir) {
                let entry = entry?;
                if !entry.file_type().is_file()
                    || entry.file_name().to_string_lossy().starts_with(TMP_PREFIX)
                {
                    continue;
                }
                let metadata = entry.metadata()?;
                if let Some(key) = this.key_of(entry.path()) {
                    objects.push(StoredObject {
                        key,
                        size: metadata.len(),
                        last_modified: metadata
                            .modified()
                            .map(DateTime::<Utc>::from)
                            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                    });
                }
            }
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        self.call("delete", key, move || match std::fs::remove_file(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            result => result,
        })?;
        tracing::debug!("Deleted {:?}", key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_of(key)?;
        self.call("exists", key, move || match std::fs::metadata(path) {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.path_of(from)?;
        let to_path = self.path_of(to)?;
        self.call("rename", from, move || {
            if let Some(parent) = to_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(from_path, to_path)
        })
    }
}

/// Reads one chunk ahead at a time, each read bounded by the call timeout
struct TimedReader {
    file: Option<File>,
    timeout: Duration,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for TimedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos == self.chunk.len() {
            let Some(mut file) = self.file.take() else {
                return Ok(0);
            };
            let (file, chunk) = run_timed(self.timeout, move || {
                let chunk = read_chunk(&mut file)?;
                Ok((file, chunk))
            })?;
            if chunk.is_empty() {
                return Ok(0);
            }
            self.file = Some(file);
            self.chunk = chunk;
            self.pos = 0;
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
