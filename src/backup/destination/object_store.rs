use crate::backup::destination::{Destination, StoredObject};
use crate::backup::digest::{Digest, HashingReader};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::future::Future;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Bodies up to this size go up in one request, larger ones as multipart
static PART_SIZE: usize = 8 * 1024 * 1024;
static IO_THREADS: usize = 2;

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    /// For S3-compatible stores such as MinIO
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<RedactedString>,
    pub secret_access_key: Option<RedactedString>,
    #[serde(default)]
    pub allow_http: bool,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcsConfig {
    pub bucket: String,
    pub service_account_path: Option<PathBuf>,
    pub prefix: Option<String>,
}

/// Blocking adapter over an async [`ObjectStore`]. Every request is bounded
/// by the call timeout, and a timeout counts as `DestinationUnavailable`.
#[derive(Debug)]
pub struct ObjectStoreDestination {
    name: String,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    runtime: Arc<Runtime>,
    timeout: Duration,
}

fn io_runtime() -> Result<Arc<Runtime>> {
    Ok(Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(IO_THREADS)
            .thread_name("gong-io")
            .enable_all()
            .build()?,
    ))
}

impl ObjectStoreDestination {
    pub fn new(
        name: String,
        store: Arc<dyn ObjectStore>,
        prefix: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            name,
            store,
            prefix: prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
            runtime: io_runtime()?,
            timeout,
        })
    }

    pub fn s3(config: &S3Config, timeout: Duration) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_allow_http(config.allow_http);
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(key_id.expose());
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret.expose());
        }
        let store = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("s3 destination: {e}")))?;
        Self::new(
            format!("s3://{}", config.bucket),
            Arc::new(store),
            config.prefix.clone(),
            timeout,
        )
    }

    pub fn gcs(config: &GcsConfig, timeout: Duration) -> Result<Self> {
        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&config.bucket);
        if let Some(path) = &config.service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("gcs destination: {e}")))?;
        Self::new(
            format!("gs://{}", config.bucket),
            Arc::new(store),
            config.prefix.clone(),
            timeout,
        )
    }

    pub fn memory(timeout: Duration) -> Result<Self> {
        Self::new("memory".into(), Arc::new(InMemory::new()), None, timeout)
    }

    fn location(&self, key: &str) -> Result<StorePath> {
        let full = match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        };
        StorePath::parse(&full)
            .map_err(|e| Error::DestinationRejected(format!("invalid key {key:?}: {e}")))
    }

    fn key_of(&self, meta: &ObjectMeta) -> String {
        let location = meta.location.as_ref();
        match &self.prefix {
            Some(prefix) => location
                .strip_prefix(prefix.as_str())
                .and_then(|l| l.strip_prefix('/'))
                .unwrap_or(location)
                .to_string(),
            None => location.to_string(),
        }
    }

    fn call<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = object_store::Result<T>>,
    {
        let timeout = self.timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, fut).await })
            .map_err(|_| {
                tracing::warn!("{} {} {:?} timed out after {:?}", self.name, op, key, timeout);
                Error::DestinationUnavailable(format!("{op} {key:?} timed out after {timeout:?}"))
            })?
            .map_err(Error::from)
    }

    fn put_multipart<R: Read>(
        &self,
        key: &str,
        location: &StorePath,
        first: Vec<u8>,
        reader: &mut R,
    ) -> Result<()> {
        let mut upload = self.call("put", key, self.store.put_multipart(location))?;
        let upload_parts = || -> Result<()> {
            let mut part = first;
            let mut parts = 0;
            while !part.is_empty() {
                self.call("put", key, upload.put_part(PutPayload::from(part)))?;
                parts += 1;
                part = read_chunk(reader, PART_SIZE)?;
            }
            self.call("put", key, upload.complete())?;
            tracing::debug!("Completed multipart upload of {:?} in {} part(s)", key, parts);
            Ok(())
        };
        let result = upload_parts();
        if result.is_err() {
            if let Err(e) = self.call("abort", key, upload.abort()) {
                tracing::warn!("Aborting multipart upload of {:?} failed: {}", key, e);
            }
        }
        result
    }
}

fn read_chunk<R: Read>(reader: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(size);
    reader.take(size as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

impl Destination for ObjectStoreDestination {
    fn put(&self, key: &str, reader: &mut dyn Read) -> Result<Digest> {
        let location = self.location(key)?;
        let mut reader = HashingReader::new(reader);
        let first = read_chunk(&mut reader, PART_SIZE)?;
        if first.len() < PART_SIZE {
            self.call("put", key, self.store.put(&location, PutPayload::from(first)))?;
        } else {
            self.put_multipart(key, &location, first, &mut reader)?;
        }
        let (digest, size) = reader.finalize();
        tracing::debug!("Stored {:?} ({} bytes) in {}", key, size, self.name);
        Ok(digest)
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let location = self.location(key)?;
        let result = self.call("get", key, self.store.get(&location))?;
        Ok(Box::new(StreamReader {
            stream: result.into_stream(),
            runtime: self.runtime.clone(),
            timeout: self.timeout,
            current: Bytes::new(),
        }))
    }

    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let prefix = prefix.trim_matches('/');
        let location = match (&self.prefix, prefix.is_empty()) {
            (None, true) => None,
            (Some(p), true) => Some(StorePath::from(p.as_str())),
            _ => Some(self.location(prefix)?),
        };
        let metas: Vec<ObjectMeta> = self.call(
            "list",
            prefix,
            self.store.list(location.as_ref()).try_collect(),
        )?;

        let mut objects: Vec<_> = metas
            .iter()
            .map(|meta| StoredObject {
                key: self.key_of(meta),
                size: meta.size,
                last_modified: meta.last_modified,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let location = self.location(key)?;
        match self.call("delete", key, self.store.delete(&location)) {
            Ok(()) | Err(Error::ObjectNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let location = self.location(key)?;
        match self.call("exists", key, self.store.head(&location)) {
            Ok(_) => Ok(true),
            Err(Error::ObjectNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_location = self.location(from)?;
        let to_location = self.location(to)?;
        self.call(
            "rename",
            from,
            self.store.rename(&from_location, &to_location),
        )
    }
}

/// Pulls body chunks from the object stream on demand
struct StreamReader {
    stream: BoxStream<'static, object_store::Result<Bytes>>,
    runtime: Arc<Runtime>,
    timeout: Duration,
    current: Bytes,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.current.is_empty() {
            let stream = &mut self.stream;
            let timeout = self.timeout;
            let next = self
                .runtime
                .block_on(async move { tokio::time::timeout(timeout, stream.next()).await });
            match next {
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("read timed out after {timeout:?}"),
                    ))
                }
                Ok(None) => return Ok(0),
                Ok(Some(Err(e))) => return Err(std::io::Error::other(e)),
                Ok(Some(Ok(bytes))) => self.current = bytes,
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::FailureKind;

    fn memory() -> ObjectStoreDestination {
        ObjectStoreDestination::memory(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let destination = memory();
        let digest = destination.put("job/a", &mut "payload".as_bytes()).unwrap();
        assert_eq!(digest, Digest::of_bytes("payload"));

        let mut content = String::new();
        destination
            .get("job/a")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "payload");
    }

    #[test]
    fn test_multipart_put() {
        let destination = memory();
        let data = vec![9u8; PART_SIZE * 2 + 17];
        let digest = destination.put("job/big", &mut data.as_slice()).unwrap();
        assert_eq!(digest, Digest::of_bytes(&data));

        let (read_digest, size) = Digest::of_reader(destination.get("job/big").unwrap()).unwrap();
        assert_eq!(read_digest, digest);
        assert_eq!(size, data.len() as u64);
    }

    #[test]
    fn test_list_with_prefix() {
        let destination = ObjectStoreDestination::new(
            "memory".into(),
            Arc::new(InMemory::new()),
            Some("/backups/".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        destination.put("job/b", &mut "b".as_bytes()).unwrap();
        destination.put("job/a", &mut "aa".as_bytes()).unwrap();
        destination.put("other/c", &mut "c".as_bytes()).unwrap();

        let listed = destination.list("job/").unwrap();
        assert_eq!(
            listed.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            vec!["job/a", "job/b"]
        );
        assert_eq!(listed[0].size, 2);
        assert_eq!(destination.list("").unwrap().len(), 3);
    }

    #[test]
    fn test_delete_exists_rename() {
        let destination = memory();
        destination.put("job/a.partial", &mut "x".as_bytes()).unwrap();
        destination.rename("job/a.partial", "job/a").unwrap();
        assert!(destination.exists("job/a").unwrap());
        assert!(!destination.exists("job/a.partial").unwrap());

        destination.delete("job/a").unwrap();
        destination.delete("job/a").unwrap();
        assert!(!destination.exists("job/a").unwrap());
        assert!(matches!(
            destination.get("job/a").err().unwrap(),
            Error::ObjectNotFound(_)
        ));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let destination = memory();
        let error = destination.put("job/../x", &mut "x".as_bytes()).unwrap_err();
        assert_eq!(error.kind(), FailureKind::DestinationRejected);
    }

    #[test]
    fn test_s3_config_builds_without_network() {
        let config: S3Config = serde_yml::from_str(
            "bucket: backups\nregion: us-east-1\nendpoint: http://localhost:9000\nallow_http: true\naccess_key_id: id\nsecret_access_key: secret\n",
        )
        .unwrap();
        assert!(ObjectStoreDestination::s3(&config, Duration::from_secs(1)).is_ok());
    }
}
