pub mod age;

use crate::backup::encrypt::age::AgeEncryptorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDebugObjectAndFnName;
use ::age::stream::{StreamReader, StreamWriter};
use derive_more::From;
use io_enum::{Read, Write};
use serde::{Deserialize, Serialize};
use std::io::{Error, Read, Write};
use std::result;

#[derive(Write, From)]
pub enum Encryptor<W: Write> {
    None(W),
    AgeEncryptor(StreamWriter<W>),
}

#[derive(Read, From)]
pub enum Decryptor<R: Read> {
    None(R),
    AgeDecryptor(StreamReader<R>),
}

#[derive(Clone, Default, From, Debug)]
pub enum EncryptorConfig {
    #[default]
    None,
    Age(AgeEncryptorConfig),
}

/// Encryption parameters stored with an archive. Never contains key material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMeta {
    pub algorithm: String,
    #[serde(default)]
    pub nonce: Option<String>,
}

pub trait EncryptorBuilder<W: Write> {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>>;
}

impl<W: Write> Finish<W> for Encryptor<W> {
    fn finish(self) -> result::Result<W, Error> {
        match self {
            Encryptor::None(w) => Ok(w),
            Encryptor::AgeEncryptor(w) => Finish::finish(w),
        }
    }
}

impl<W: Write> EncryptorBuilder<W> for EncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        match self {
            EncryptorConfig::None => {
                tracing::debug!("Using no encryption");
                Ok(writer.into())
            }
            EncryptorConfig::Age(age) => {
                tracing::debug!("Initializing {} encryption", age.algorithm());
                age.build_encryptor(writer)
            }
        }
        .add_debug_object_and_fn_name(self.clone(), "build_encryptor")
    }
}

impl EncryptorConfig {
    pub fn build_decryptor<R: Read>(&self, reader: R) -> Result<Decryptor<R>> {
        match self {
            EncryptorConfig::None => Ok(reader.into()),
            EncryptorConfig::Age(age) => age.build_decryptor(reader),
        }
        .add_debug_object_and_fn_name(self.clone(), "build_decryptor")
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, EncryptorConfig::None)
    }

    /// Metadata for an archive whose stored bytes start with `stored_prefix`.
    pub fn meta(&self, stored_prefix: &[u8]) -> Option<EncryptionMeta> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Age(age) => Some(EncryptionMeta {
                algorithm: age.algorithm().to_string(),
                nonce: age::payload_nonce(stored_prefix),
            }),
        }
    }
}

impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> Option<&'static str> {
        match self {
            EncryptorConfig::None => None,
            EncryptorConfig::Age(_) => Some("age"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::redacted::RedactedString;

    fn x25519_config() -> EncryptorConfig {
        let identity = ::age::x25519::Identity::generate();
        let identity = ::age::secrecy::ExposeSecret::expose_secret(&identity.to_string()).to_string();
        AgeEncryptorConfig::X25519 {
            identity: RedactedString::new(identity),
        }
        .into()
    }

    #[test]
    fn test_encryptor_config_none() {
        let config = EncryptorConfig::None;
        assert!(config.file_ext().is_none());
        assert!(!config.is_enabled());
        assert!(config.meta(b"").is_none());
    }

    #[test]
    fn test_encryptor_builder_none() {
        let encryptor = EncryptorConfig::None.build_encryptor(Vec::new()).unwrap();
        match encryptor {
            Encryptor::None(_) => (),
            _ => panic!("Expected None encryptor"),
        }
    }

    #[test]
    fn test_age_round_trip_and_meta() {
        let config = x25519_config();
        assert_eq!(config.file_ext(), Some("age"));

        let mut encryptor = config.build_encryptor(Vec::new()).unwrap();
        encryptor.write_all(b"secret payload").unwrap();
        let ciphertext = encryptor.finish().unwrap();
        assert!(!ciphertext
            .windows(b"secret payload".len())
            .any(|w| w == b"secret payload"));

        let meta = config.meta(&ciphertext).unwrap();
        assert_eq!(meta.algorithm, "age-v1/x25519");
        assert_eq!(meta.nonce.map(|n| n.len()), Some(32));

        let mut plaintext = String::new();
        config
            .build_decryptor(ciphertext.as_slice())
            .unwrap()
            .read_to_string(&mut plaintext)
            .unwrap();
        assert_eq!(plaintext, "secret payload");
    }

    #[test]
    fn test_wrong_identity_fails() {
        let mut encryptor = x25519_config().build_encryptor(Vec::new()).unwrap();
        encryptor.write_all(b"data").unwrap();
        let ciphertext = encryptor.finish().unwrap();

        assert!(x25519_config()
            .build_decryptor(ciphertext.as_slice())
            .is_err());
    }
}
