//! Streaming archive writer and reader.
//!
//! Items are packed into a tar stream that flows through the compressor and
//! the encryptor into a spool file, hashing the stored bytes on the way. The
//! spool is what gets uploaded, so a retried upload replays identical bytes.

use crate::backup::compress::{Compression, CompressorBuilder, Compressor, Decompressor};
use crate::backup::digest::{Digest, HashingReader, HashingWriter};
use crate::backup::encrypt::{Decryptor, EncryptionMeta, Encryptor, EncryptorBuilder, EncryptorConfig};
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::source::files::ExcludeMatcher;
use crate::backup::source::SourceItem;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;
use tempfile::NamedTempFile;

/// Enough to capture an age header plus the payload nonce after it
static HEADER_PREFIX_CAPACITY: usize = 4096;

type StoredWriter = HashingWriter<BufWriter<File>>;
type ArchiveStream = tar::Builder<BufWriter<Compressor<Encryptor<StoredWriter>>>>;

pub type ArchiveReader<R> = tar::Archive<Decompressor<BufReader<Decryptor<R>>>>;

/// A finished archive waiting in the spool directory
#[derive(Debug)]
pub struct SpooledArchive {
    file: NamedTempFile,
    pub size: u64,
    pub checksum: Digest,
    pub encryption: Option<EncryptionMeta>,
    pub items: usize,
}

impl SpooledArchive {
    /// A fresh handle positioned at the start of the stored bytes
    pub fn reader(&self) -> std::io::Result<File> {
        self.file.reopen()
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// What actually went into the archive for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedItem {
    pub fingerprint: Digest,
    pub size: u64,
}

pub struct ArchiveWriter {
    stream: ArchiveStream,
    spool: NamedTempFile,
    matcher: ExcludeMatcher,
    encryptor: EncryptorConfig,
    items: usize,
}

impl ArchiveWriter {
    pub fn create<P: AsRef<Path>>(
        spool_dir: P,
        compression: Compression,
        level: Option<u32>,
        encryptor: &EncryptorConfig,
        matcher: ExcludeMatcher,
    ) -> Result<Self> {
        let spool = tempfile::Builder::new()
            .prefix(".spool-")
            .tempfile_in(spool_dir.as_ref())?;
        let stored = HashingWriter::with_prefix_capacity(
            BufWriter::new(spool.reopen()?),
            HEADER_PREFIX_CAPACITY,
        );
        let writer = encryptor
            .build_encryptor(stored)
            .and_then(|w| compression.build_compressor(level, w))
            .map(BufWriter::new)?;
        tracing::debug!(
            "Spooling archive to {:?} ({} compression, encrypted: {})",
            spool.path(),
            compression,
            encryptor.is_enabled()
        );

        Ok(Self {
            stream: tar::Builder::new(writer),
            spool,
            matcher,
            encryptor: encryptor.clone(),
            items: 0,
        })
    }

    /// Appends one item, or returns `None` when an exclude rule filters it.
    ///
    /// Failing to open the item is a per-item `SourceUnreadable` and leaves
    /// the stream untouched. Any failure after that corrupts the stream and
    /// comes back as an archive error.
    pub fn append(&mut self, item: &SourceItem) -> Result<Option<PackedItem>> {
        if self.matcher.is_excluded(item.path()) {
            tracing::debug!("Filtered {:?} at pack time", item.path());
            return Ok(None);
        }

        let file = item
            .open()
            .map_err(|e| Error::source_unreadable(item.origin_path(), e.into()))?;
        let metadata = file
            .metadata()
            .map_err(|e| Error::source_unreadable(item.origin_path(), e.into()))?;
        let len = metadata.len();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(len);
        header.set_mode(file_mode(&metadata));
        header.set_mtime(item.modified().timestamp().max(0) as u64);

        let mut reader = HashingReader::new(file.take(len));
        self.stream
            .append_data(&mut header, item.path(), &mut reader)
            .map_err(|e| Error::archive(e.into()))?;
        let (fingerprint, size) = reader.finalize();
        if size != len {
            return Err(Error::archive(Error::Io(std::io::Error::other(format!(
                "{:?} shrank from {} to {} bytes while packing",
                item.path(),
                len,
                size
            )))));
        }
        if &fingerprint != item.fingerprint() {
            tracing::debug!("{:?} changed since enumeration", item.path());
        }

        self.items += 1;
        tracing::trace!("Packed {:?} ({} bytes)", item.path(), size);
        Ok(Some(PackedItem { fingerprint, size }))
    }

    pub fn finish(self) -> Result<SpooledArchive> {
        let stored = self
            .stream
            .into_inner()
            .and_then(Finish::finish)
            .and_then(Finish::finish)
            .and_then(Finish::finish)
            .map_err(|e| Error::archive(e.into()))?;
        let output = stored.finalize();
        output
            .inner
            .finish()
            .and_then(|f| f.sync_all())
            .map_err(|e| Error::archive(e.into()))?;

        let encryption = self.encryptor.meta(&output.prefix);
        tracing::info!(
            "Archive spooled: {} item(s), {} bytes, {}",
            self.items,
            output.size,
            output.digest
        );
        Ok(SpooledArchive {
            file: self.spool,
            size: output.size,
            checksum: output.digest,
            encryption,
            items: self.items,
        })
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Inverse of [`ArchiveWriter`]: decrypt, decompress, untar.
pub fn open_archive<R: Read>(
    reader: R,
    compression: Compression,
    encryptor: &EncryptorConfig,
) -> Result<ArchiveReader<R>> {
    let decrypted = encryptor.build_decryptor(reader)?;
    let mut archive = tar::Archive::new(compression.build_decompressor(BufReader::new(decrypted)));
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::encrypt::age::AgeEncryptorConfig;
    use crate::backup::redacted::RedactedString;
    use crate::backup::source::files::{ExcludePattern, FilesSource};
    use crate::backup::source::ItemSource;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn x25519() -> EncryptorConfig {
        let identity = age::x25519::Identity::generate();
        AgeEncryptorConfig::X25519 {
            identity: RedactedString::new(
                age::secrecy::ExposeSecret::expose_secret(&identity.to_string()).to_string(),
            ),
        }
        .into()
    }

    fn items(dir: &Path) -> Vec<SourceItem> {
        FilesSource::builder()
            .paths(vec![dir.to_path_buf()])
            .build()
            .items()
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    fn pack(
        spool_dir: &Path,
        items: &[SourceItem],
        compression: Compression,
        encryptor: &EncryptorConfig,
        matcher: ExcludeMatcher,
    ) -> SpooledArchive {
        let mut writer =
            ArchiveWriter::create(spool_dir, compression, None, encryptor, matcher).unwrap();
        for item in items {
            writer.append(item).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_round_trip_all_combinations() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(src.path().join("sub/b.bin"), vec![42u8; 70_000]).unwrap();
        let items = items(src.path());
        let spool = TempDir::new().unwrap();

        for compression in [
            Compression::None,
            Compression::Gzip,
            Compression::Lz4,
            Compression::Xz,
        ] {
            for encryptor in [EncryptorConfig::None, x25519()] {
                let archive = pack(
                    spool.path(),
                    &items,
                    compression,
                    &encryptor,
                    ExcludeMatcher::empty(),
                );
                assert_eq!(archive.items, 2);
                assert_eq!(archive.encryption.is_some(), encryptor.is_enabled());
                let (digest, size) = Digest::of_reader(archive.reader().unwrap()).unwrap();
                assert_eq!(digest, archive.checksum);
                assert_eq!(size, archive.size);

                let dst = TempDir::new().unwrap();
                open_archive(archive.reader().unwrap(), compression, &encryptor)
                    .unwrap()
                    .unpack(dst.path())
                    .unwrap();
                assert_eq!(std::fs::read(dst.path().join("a.txt")).unwrap(), b"alpha");
                assert_eq!(
                    std::fs::read(dst.path().join("sub/b.bin")).unwrap(),
                    vec![42u8; 70_000]
                );
            }
        }
    }

    #[test]
    fn test_encrypted_spool_has_no_plaintext() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("secret.txt"), "TOP-SECRET-MARKER").unwrap();
        let spool = TempDir::new().unwrap();
        let archive = pack(
            spool.path(),
            &items(src.path()),
            Compression::None,
            &x25519(),
            ExcludeMatcher::empty(),
        );

        let stored = std::fs::read(archive.path()).unwrap();
        let marker = b"TOP-SECRET-MARKER";
        assert!(!stored.windows(marker.len()).any(|w| w == marker));
        assert!(!stored.windows(10).any(|w| w == b"secret.txt"));
    }

    #[test]
    fn test_filter_stage_drops_excluded() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("keep"), "k").unwrap();
        std::fs::write(src.path().join("drop.tmp"), "d").unwrap();
        let items = items(src.path());
        let matcher = FilesSource::builder()
            .paths(vec![PathBuf::from("/")])
            .exclude(vec![ExcludePattern::new("*.tmp").unwrap()])
            .build()
            .exclude_matcher()
            .unwrap();

        let spool = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(
            spool.path(),
            Compression::Gzip,
            None,
            &EncryptorConfig::None,
            matcher,
        )
        .unwrap();
        let outcomes: Vec<_> = items.iter().map(|i| writer.append(i).unwrap()).collect();
        assert!(outcomes[0].is_none());
        assert_eq!(
            outcomes[1],
            Some(PackedItem {
                fingerprint: Digest::of_bytes("k"),
                size: 1
            })
        );
        assert_eq!(writer.finish().unwrap().items, 1);
    }

    #[test]
    fn test_vanished_item_is_per_item_failure() {
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("gone"), "g").unwrap();
        let items = items(src.path());
        std::fs::remove_file(src.path().join("gone")).unwrap();

        let spool = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(
            spool.path(),
            Compression::Lz4,
            None,
            &EncryptorConfig::None,
            ExcludeMatcher::empty(),
        )
        .unwrap();
        let error = writer.append(&items[0]).unwrap_err();
        assert_eq!(
            error.kind(),
            crate::backup::result_error::error::FailureKind::SourceUnreadable
        );
        assert_eq!(writer.finish().unwrap().items, 0);
    }

    #[test]
    fn test_spool_removed_on_drop() {
        let spool = TempDir::new().unwrap();
        let archive = pack(
            spool.path(),
            &[],
            Compression::Gzip,
            &EncryptorConfig::None,
            ExcludeMatcher::empty(),
        );
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        drop(archive);
        assert!(!path.exists());
    }
}
