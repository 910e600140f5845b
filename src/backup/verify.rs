//! Re-reads a stored archive and checks it against what was packed.

use crate::backup::destination::retry::RetryPolicy;
use crate::backup::destination::Destination;
use crate::backup::digest::Digest;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::manifest::Manifest;
use crate::backup::pipeline::open_archive;
use crate::backup::result_error::error::{Error, FailureKind};
use crate::backup::result_error::result::Result;

pub struct Verifier<'a> {
    destination: &'a dyn Destination,
    retry: &'a RetryPolicy,
}

impl<'a> Verifier<'a> {
    pub fn new(destination: &'a dyn Destination, retry: &'a RetryPolicy) -> Self {
        Self { destination, retry }
    }

    /// Checksum pass, then a full decode pass. A corrupt object is deleted
    /// before the error is returned.
    pub fn verify(&self, key: &str, manifest: &Manifest, encryptor: &EncryptorConfig) -> Result<()> {
        tracing::info!("Verifying {:?}", key);
        let result = manifest
            .archive
            .as_ref()
            .ok_or_else(|| Error::VerificationFailed {
                key: key.to_string(),
                reason: "manifest has no archive checksum".into(),
            })
            .and_then(|archive| self.verify_checksum(key, &archive.checksum))
            .and_then(|_| self.verify_restorable(key, manifest, encryptor));

        if let Err(e) = &result {
            if e.kind() == FailureKind::VerificationFailed {
                tracing::error!("Deleting corrupt object {:?}: {}", key, e);
                if let Err(delete_error) = self
                    .retry
                    .run("delete corrupt object", || self.destination.delete(key))
                {
                    tracing::error!("Could not delete corrupt object {:?}: {}", key, delete_error);
                }
            }
        }
        result
    }

    pub fn verify_checksum(&self, key: &str, expected: &Digest) -> Result<()> {
        let (actual, size) = self.retry.run("verify get", || {
            let reader = self.destination.get(key)?;
            Digest::of_reader(reader)
                .map_err(|e| Error::DestinationUnavailable(format!("read {key:?}: {e}")))
        })?;
        if &actual != expected {
            return Err(Error::VerificationFailed {
                key: key.to_string(),
                reason: format!("checksum mismatch: expected {expected}, read {actual} ({size} bytes)"),
            });
        }
        tracing::debug!("Checksum of {:?} matches ({} bytes)", key, size);
        Ok(())
    }

    /// Decodes every entry and compares it with the manifest's archived items
    pub fn verify_restorable(
        &self,
        key: &str,
        manifest: &Manifest,
        encryptor: &EncryptorConfig,
    ) -> Result<()> {
        let failed = |reason: String| Error::VerificationFailed {
            key: key.to_string(),
            reason,
        };

        let reader = self.retry.run("verify get", || self.destination.get(key))?;
        let mut archive = open_archive(reader, manifest.compression, encryptor)
            .map_err(|e| failed(format!("cannot open archive: {e}")))?;
        let mut expected = manifest.archived_entries();
        let mut count = 0usize;

        let entries = archive
            .entries()
            .map_err(|e| failed(format!("cannot read entries: {e}")))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| failed(format!("corrupt entry: {e}")))?;
            let path = entry
                .path()
                .map_err(|e| failed(format!("corrupt entry path: {e}")))?
                .into_owned();
            let Some(manifest_entry) = expected.next() else {
                return Err(failed(format!("unexpected entry {path:?}")));
            };
            if manifest_entry.path != path {
                return Err(failed(format!(
                    "entry {path:?} found where {:?} was expected",
                    manifest_entry.path
                )));
            }
            let (fingerprint, _) = Digest::of_reader(&mut entry)
                .map_err(|e| failed(format!("cannot decode {path:?}: {e}")))?;
            if fingerprint != manifest_entry.fingerprint {
                return Err(failed(format!("content of {path:?} differs from manifest")));
            }
            count += 1;
        }

        if let Some(missing) = expected.next() {
            return Err(failed(format!("entry {:?} missing", missing.path)));
        }
        tracing::debug!("Decoded {} entries of {:?}", count, key);
        Ok(())
    }
}
