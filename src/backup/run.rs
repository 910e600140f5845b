use crate::backup::manifest::BackupType;
use crate::backup::result_error::error::{Error, FailureKind};
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Verifying,
    Completed,
    Failed,
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Skipped
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Running)
                | (RunState::Pending, RunState::Skipped)
                | (RunState::Running, RunState::Verifying)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Failed)
                | (RunState::Verifying, RunState::Completed)
                | (RunState::Verifying, RunState::Failed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: FailureKind,
    pub message: String,
}

/// One execution of a job, from trigger to terminal state.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job: String,
    pub state: RunState,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Type actually performed
    #[serde(default)]
    pub backup_type: Option<BackupType>,
    #[serde(default)]
    pub items_total: u64,
    #[serde(default)]
    pub items_archived: u64,
    #[serde(default)]
    pub items_failed: u64,
    #[serde(default)]
    pub bytes_read: u64,
    #[serde(default)]
    pub bytes_stored: u64,
    #[serde(default)]
    pub archive_key: Option<String>,
    #[serde(default)]
    pub error: Option<RunError>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl JobRun {
    pub fn new<S: Into<String>>(job: S, triggered_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job: job.into(),
            state: RunState::Pending,
            triggered_at,
            started_at: None,
            ended_at: None,
            backup_type: None,
            items_total: 0,
            items_archived: 0,
            items_failed: 0,
            bytes_read: 0,
            bytes_stored: 0,
            archive_key: None,
            error: None,
            notes: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("Run {} of {:?}: {} -> {}", self.id, self.job, self.state, next);
        let now = Utc::now();
        if next == RunState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed` and records the error. Archive identifiers are
    /// dropped since no new object stays visible after a failure.
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.transition(RunState::Failed)?;
        self.error = Some(RunError {
            kind: error.kind(),
            message: error.to_string(),
        });
        self.archive_key = None;
        Ok(())
    }

    pub fn skip<S: Into<String>>(&mut self, reason: S) -> Result<()> {
        self.transition(RunState::Skipped)?;
        self.add_note(reason);
        Ok(())
    }

    pub fn add_note<S: Into<String>>(&mut self, note: S) {
        let note = note.into();
        tracing::info!("Run {} of {:?}: {}", self.id, self.job, note);
        self.notes.push(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut run = JobRun::new("job", Utc::now());
        run.transition(RunState::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition(RunState::Verifying).unwrap();
        run.transition(RunState::Completed).unwrap();
        assert!(run.ended_at.is_some());
        assert!(run.state.is_terminal());
    }

    #[test]
    fn test_no_way_back_from_terminal() {
        let mut run = JobRun::new("job", Utc::now());
        run.transition(RunState::Running).unwrap();
        run.fail(&Error::Cancelled).unwrap();
        assert_eq!(run.error.as_ref().unwrap().kind, FailureKind::Cancelled);

        for next in [
            RunState::Pending,
            RunState::Running,
            RunState::Verifying,
            RunState::Completed,
            RunState::Skipped,
        ] {
            assert!(matches!(
                run.transition(next),
                Err(Error::IllegalTransition { .. })
            ));
        }
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut run = JobRun::new("job", Utc::now());
        run.skip("previous run still active").unwrap();
        assert_eq!(run.state, RunState::Skipped);
        assert_eq!(run.notes.len(), 1);

        let mut running = JobRun::new("job", Utc::now());
        running.transition(RunState::Running).unwrap();
        assert!(running.skip("late").is_err());
        assert!(!RunState::Pending.can_transition_to(RunState::Verifying));
    }

    #[test]
    fn test_forward_compatible_record() {
        let run = JobRun::new("job", Utc::now());
        let mut value = serde_json::to_value(&run).unwrap();
        value["future_field"] = serde_json::json!(42);
        let back: JobRun = serde_json::from_value(value).unwrap();
        assert_eq!(back, run);

        let minimal = format!(
            r#"{{"id":"{}","job":"j","state":"completed","triggered_at":"2026-10-18T02:00:00Z"}}"#,
            Uuid::new_v4()
        );
        let parsed: JobRun = serde_json::from_str(&minimal).unwrap();
        assert_eq!(parsed.state, RunState::Completed);
        assert!(parsed.notes.is_empty());
    }
}
