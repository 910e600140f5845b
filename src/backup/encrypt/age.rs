use crate::backup::encrypt::{Decryptor, Encryptor, EncryptorBuilder};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use age::secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};

/// Minimum passphrase length accepted at load time
static MIN_PASSPHRASE_LEN: usize = 8;
static AGE_NONCE_LEN: usize = 16;
static AGE_MAC_LINE_PREFIX: &[u8] = b"\n--- ";

/// Key material for age encryption
///
/// Passphrases go through scrypt, which is deliberately slow (about a
/// second per archive on each side). X25519 identities are the better fit
/// for unattended jobs.
#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AgeEncryptorConfig {
    Passphrase { passphrase: RedactedString },
    X25519 { identity: RedactedString },
}

impl AgeEncryptorConfig {
    pub fn algorithm(&self) -> &'static str {
        match self {
            AgeEncryptorConfig::Passphrase { .. } => "age-v1/scrypt",
            AgeEncryptorConfig::X25519 { .. } => "age-v1/x25519",
        }
    }

    fn x25519_identity(identity: &RedactedString) -> Result<age::x25519::Identity> {
        identity
            .expose()
            .trim()
            .parse::<age::x25519::Identity>()
            .map_err(|e| Error::InvalidConfig(format!("invalid x25519 identity: {e}")))
    }

    pub fn build_decryptor<R: Read>(&self, reader: R) -> Result<Decryptor<R>> {
        let decryptor = age::Decryptor::new(reader)?;
        let stream = match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                let identity =
                    age::scrypt::Identity::new(SecretString::from(passphrase.expose()));
                decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?
            }
            AgeEncryptorConfig::X25519 { identity } => {
                let identity = Self::x25519_identity(identity)?;
                decryptor.decrypt(std::iter::once(&identity as &dyn age::Identity))?
            }
        };
        Ok(stream.into())
    }
}

impl<W: Write> EncryptorBuilder<W> for AgeEncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        let encryptor = match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                age::Encryptor::with_user_passphrase(SecretString::from(passphrase.expose()))
            }
            AgeEncryptorConfig::X25519 { identity } => {
                let recipient = Self::x25519_identity(identity)?.to_public();
                age::Encryptor::with_recipients(std::iter::once(
                    &recipient as &dyn age::Recipient,
                ))?
            }
        };
        Ok(encryptor.wrap_output(writer)?.into())
    }
}

impl Validate for AgeEncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                if passphrase.len() < MIN_PASSPHRASE_LEN {
                    errors.add(
                        "passphrase",
                        ValidationError::new("length").with_message(
                            format!("passphrase must be at least {MIN_PASSPHRASE_LEN} characters")
                                .into(),
                        ),
                    );
                }
            }
            AgeEncryptorConfig::X25519 { identity } => {
                if let Err(e) = Self::x25519_identity(identity) {
                    errors.add(
                        "identity",
                        ValidationError::new("InvalidIdentity").with_message(e.to_string().into()),
                    );
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// The payload nonce follows the header's MAC line in an age v1 stream.
pub fn payload_nonce(stored_prefix: &[u8]) -> Option<String> {
    let mac_line = stored_prefix
        .windows(AGE_MAC_LINE_PREFIX.len())
        .position(|w| w == AGE_MAC_LINE_PREFIX)?;
    let header_end = stored_prefix[mac_line + 1..]
        .iter()
        .position(|b| *b == b'\n')
        .map(|p| mac_line + 1 + p + 1)?;
    stored_prefix
        .get(header_end..header_end + AGE_NONCE_LEN)
        .map(hex::encode)
}
