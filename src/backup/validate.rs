//! Validation functions for configuration values.
//!
//! Provides custom validation functions for job names, cron expressions,
//! source paths and data directories.

use crate::backup::scheduler::cron::next_fire_time;
use chrono::Utc;
use itertools::Itertools;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub fn validate_job_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() {
        return Err(ValidationError::new("InvalidJobName").with_message("name is required".into()));
    }

    if !is_sanitized(name) || name.starts_with('.') {
        return Err(ValidationError::new("InvalidJobName").with_message(
            format!(
                "Invalid job name {:?}, try sanitizing like {:?}",
                name,
                sanitize(name.trim_start_matches('.'))
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_cron_str<S: AsRef<str>>(cron: S) -> Result<(), ValidationError> {
    let cron = cron.as_ref();
    if next_fire_time(cron, Utc::now()).is_err() {
        return Err(ValidationError::new("InvalidCron")
            .with_message(format!("Invalid cron string: {cron:?}").into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access directory {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

/// Multiple roots are archived under their base names, so the names must not collide.
pub fn validate_source_roots(paths: &[PathBuf]) -> Result<(), ValidationError> {
    if paths.is_empty() {
        return Err(ValidationError::new("InvalidSource")
            .with_message("at least one source path is required".into()));
    }

    if paths.len() == 1 {
        return Ok(());
    }

    let mut seen = HashSet::new();
    let duplicated = paths
        .iter()
        .filter_map(|p| p.file_name())
        .filter(|name| !seen.insert(*name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect_vec();

    if paths.iter().any(|p| p.file_name().is_none()) {
        return Err(ValidationError::new("InvalidSource")
            .with_message("source paths must have a final path component".into()));
    }

    if !duplicated.is_empty() {
        return Err(ValidationError::new("InvalidSource").with_message(
            format!("source paths share base names: {}", duplicated.join(", ")).into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_job_name() {
        assert!(validate_job_name("daily-etc").is_ok());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name("a/b").is_err());
        assert!(validate_job_name(".hidden").is_err());
    }

    #[test]
    fn test_validate_cron_str() {
        assert!(validate_cron_str("0 2 * * *").is_ok());
        assert!(validate_cron_str("*/5 * * * *").is_ok());
        assert!(validate_cron_str("not a cron").is_err());
    }

    #[test]
    fn test_validate_dir_exist_or_created() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b");
        assert!(validate_dir_exist_or_created(&nested).is_ok());
        assert!(nested.is_dir());

        let file = temp_dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_dir_exist_or_created(&file).is_err());
    }

    #[test]
    fn test_validate_source_roots() {
        assert!(validate_source_roots(&[]).is_err());
        assert!(validate_source_roots(&[PathBuf::from("/etc")]).is_ok());
        assert!(validate_source_roots(&[PathBuf::from("/etc"), PathBuf::from("/var/log")]).is_ok());
        assert!(
            validate_source_roots(&[PathBuf::from("/a/data"), PathBuf::from("/b/data")]).is_err()
        );
    }
}
