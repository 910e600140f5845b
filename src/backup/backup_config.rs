use crate::backup::compress::Compression;
use crate::backup::destination::retry::RetryPolicy;
use crate::backup::destination::DestinationConfig;
use crate::backup::encrypt::age::AgeEncryptorConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::manifest::BackupType;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::retention::RetentionConfig;
use crate::backup::source::SourceConfig;
use crate::backup::validate::{validate_cron_str, validate_dir_exist_or_created, validate_job_name};
use bon::Builder;
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Process-wide settings. Keys this version does not know (such as the web
/// UI settings) are accepted and ignored.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[getset(get = "pub")]
pub struct GlobalConfig {
    #[serde(default)]
    #[builder(default)]
    log_level: LogLevel,
    #[builder(into)]
    log_file: Option<PathBuf>,
    #[validate(custom(function = validate_dir_exist_or_created))]
    #[serde(default = "default_data_dir")]
    #[builder(default = default_data_dir(), into)]
    data_dir: PathBuf,
    /// Ceiling for a single destination call
    #[serde(with = "humantime_serde", default = "default_call_timeout")]
    #[builder(default = default_call_timeout())]
    call_timeout: Duration,
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    retry: RetryPolicy,
    #[validate(range(min = 1))]
    #[serde(default = "default_max_concurrent_jobs")]
    #[builder(default = default_max_concurrent_jobs())]
    max_concurrent_jobs: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_concurrent_jobs() -> usize {
    4
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_backup_options))]
#[getset(get = "pub")]
pub struct BackupOptions {
    #[serde(default)]
    #[builder(default)]
    backup_type: BackupType,
    #[serde(default)]
    #[builder(default)]
    compression: Compression,
    #[validate(range(min = 0, max = 9))]
    compression_level: Option<u32>,
    #[serde(default)]
    #[builder(default)]
    encryption: bool,
    #[validate(nested)]
    encryption_key: Option<AgeEncryptorConfig>,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    verification: bool,
    /// Abort on the first unreadable item
    #[serde(default)]
    #[builder(default)]
    strict_source: bool,
    /// Abort once more items than this could not be read
    max_item_failures: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn validate_backup_options(options: &BackupOptions) -> std::result::Result<(), ValidationError> {
    if options.encryption && options.encryption_key.is_none() {
        return Err(ValidationError::new("MissingEncryptionKey")
            .with_message("encryption is enabled but no encryption_key is configured".into()));
    }
    Ok(())
}

impl BackupOptions {
    pub fn encryptor(&self) -> EncryptorConfig {
        match (&self.encryption, &self.encryption_key) {
            (true, Some(key)) => key.clone().into(),
            _ => EncryptorConfig::None,
        }
    }

    /// Decryption may be needed for archives written while encryption was
    /// still on, so the key is used whenever one is configured.
    pub fn decryptor(&self, encrypted: bool) -> Result<EncryptorConfig> {
        match (encrypted, &self.encryption_key) {
            (false, _) => Ok(EncryptorConfig::None),
            (true, Some(key)) => Ok(key.clone().into()),
            (true, None) => Err(Error::InvalidConfig(
                "archive is encrypted but no encryption_key is configured".into(),
            )),
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct JobConfig {
    #[validate(custom(function = validate_job_name))]
    #[builder(into)]
    name: String,
    #[builder(into)]
    description: Option<String>,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    enabled: bool,
    #[validate(custom(function = validate_cron_str))]
    #[builder(into)]
    schedule: String,
    #[validate(nested)]
    source: SourceConfig,
    destination: DestinationConfig,
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    options: BackupOptions,
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    retention: RetentionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_unique_job_names))]
#[getset(get = "pub")]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    global: GlobalConfig,
    #[validate(nested)]
    #[serde(default)]
    #[builder(default)]
    jobs: Vec<JobConfig>,
}

fn validate_unique_job_names(config: &Config) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    let duplicated = config
        .jobs
        .iter()
        .map(|j| j.name.as_str())
        .filter(|name| !seen.insert(*name))
        .unique()
        .collect_vec();
    if !duplicated.is_empty() {
        return Err(ValidationError::new("DuplicateJobName").with_message(
            format!("job names must be unique: {}", duplicated.join(", ")).into(),
        ));
    }
    Ok(())
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, Config>(f).map_err(Error::from))
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| Error::JobNotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(data_dir: &Path, extra_job: &str) -> String {
        format!(
            r#"
global:
  log_level: debug
  data_dir: {data_dir:?}
  call_timeout: 30s
  retry: {{ max_attempts: 3, base_delay: 10ms }}
  web_port: 8080
jobs:
  - name: daily-etc
    schedule: "0 2 * * *"
    source: {{ type: files, paths: [/etc], exclude: ["*.swp"] }}
    destination: {{ type: local, path: /backups }}
{extra_job}"#
        )
    }

    #[test]
    fn test_load_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::from_yaml_str(&yaml(temp_dir.path(), "")).unwrap();

        assert_eq!(config.global().log_level(), &LogLevel::Debug);
        assert_eq!(config.global().call_timeout(), &Duration::from_secs(30));
        assert_eq!(config.global().retry().max_attempts, 3);

        let job = config.job("daily-etc").unwrap();
        assert!(*job.enabled());
        assert_eq!(job.options().backup_type(), &BackupType::Full);
        assert_eq!(job.options().compression(), &Compression::Gzip);
        assert!(!*job.options().encryption());
        assert!(*job.options().verification());
        assert_eq!(job.retention().keep_daily, 7);
        assert!(matches!(config.job("nope"), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn test_duplicate_job_names_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let duplicate = r#"  - name: daily-etc
    schedule: "0 3 * * *"
    source: { type: files, paths: [/var] }
    destination: { type: memory }
"#;
        let error = Config::from_yaml_str(&yaml(temp_dir.path(), duplicate)).unwrap_err();
        assert!(error.to_string().contains("unique"));
    }

    #[test]
    fn test_malformed_schedule_rejected_at_load() {
        let temp_dir = TempDir::new().unwrap();
        let bad = r#"  - name: broken
    schedule: "whenever"
    source: { type: files, paths: [/var] }
    destination: { type: memory }
"#;
        assert!(Config::from_yaml_str(&yaml(temp_dir.path(), bad)).is_err());
    }

    #[test]
    fn test_encryption_requires_key() {
        let options: BackupOptions = serde_yml::from_str("encryption: true\n").unwrap();
        assert!(options.validate().is_err());

        let options: BackupOptions = serde_yml::from_str(
            "encryption: true\nencryption_key: { kind: passphrase, passphrase: long-enough-pass }\n",
        )
        .unwrap();
        assert!(options.validate().is_ok());
        assert!(options.encryptor().is_enabled());
        assert!(options.decryptor(true).unwrap().is_enabled());
        assert!(!options.decryptor(false).unwrap().is_enabled());
        assert!(BackupOptions::default().decryptor(true).is_err());
    }

    #[test]
    fn test_unknown_job_keys_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let typo = r#"  - name: typo
    schedule: "0 3 * * *"
    sauce: { type: files, paths: [/var] }
    destination: { type: memory }
"#;
        assert!(Config::from_yaml_str(&yaml(temp_dir.path(), typo)).is_err());
    }
}
