//! SHA-256 content digests.
//!
//! The same digest type serves as an item fingerprint (content of one source
//! file) and as an archive checksum (bytes stored at the destination). Both
//! are computed on the fly by wrapping the reader or writer the bytes
//! already flow through.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::io::{Read, Write};

static DIGEST_PREFIX: &str = "sha256:";

#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize())))
    }

    pub fn of_bytes<B: AsRef<[u8]>>(bytes: B) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self::from_hasher(hasher)
    }

    pub fn of_reader<R: Read>(reader: R) -> std::io::Result<(Self, u64)> {
        let mut reader = HashingReader::new(reader);
        std::io::copy(&mut reader, &mut std::io::sink())?;
        Ok(reader.finalize())
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn finalize(self) -> (Digest, u64) {
        (Digest::from_hasher(self.hasher), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// Hashes and counts every byte written through it, keeping the first
/// `prefix_capacity` bytes so stream headers can be inspected afterwards.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
    prefix: Vec<u8>,
    prefix_capacity: usize,
}

impl<W: Write> HashingWriter<W> {
    pub fn with_prefix_capacity(inner: W, prefix_capacity: usize) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
            prefix: Vec::new(),
            prefix_capacity,
        }
    }

    pub fn finalize(self) -> HashedOutput<W> {
        HashedOutput {
            inner: self.inner,
            digest: Digest::from_hasher(self.hasher),
            size: self.count,
            prefix: self.prefix,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        if self.prefix.len() < self.prefix_capacity {
            let take = (self.prefix_capacity - self.prefix.len()).min(n);
            self.prefix.extend_from_slice(&buf[..take]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub struct HashedOutput<W> {
    pub inner: W,
    pub digest: Digest,
    pub size: u64,
    pub prefix: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            Digest::of_bytes("abc").to_string(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_reader_and_writer_agree() {
        let data = vec![7u8; 100_000];
        let (read_digest, read_size) = Digest::of_reader(Cursor::new(&data)).unwrap();

        let mut writer = HashingWriter::with_prefix_capacity(Vec::new(), 16);
        writer.write_all(&data).unwrap();
        let out = writer.finalize();

        assert_eq!(read_digest, out.digest);
        assert_eq!(read_size, 100_000);
        assert_eq!(out.size, 100_000);
        assert_eq!(out.prefix, vec![7u8; 16]);
        assert_eq!(out.inner.len(), 100_000);
    }

    #[test]
    fn test_digest_serializes_as_string() {
        let digest = Digest::of_bytes("");
        let json = serde_json::to_string(&digest).unwrap();
        assert!(json.starts_with("\"sha256:"));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
