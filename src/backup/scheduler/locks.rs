use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cooperative stop request, checked between items
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ActiveRuns = Arc<Mutex<HashMap<String, CancelToken>>>;

fn lock_active(active: &ActiveRuns) -> MutexGuard<'_, HashMap<String, CancelToken>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of jobs with an active run. At most one run per job name.
#[derive(Debug, Default)]
pub struct JobLocks {
    active: ActiveRuns,
}

/// Releases the job when dropped. Owns its handle on the registry, so it can
/// travel to whichever thread ends up running the job.
#[derive(Debug)]
pub struct JobLockGuard {
    active: ActiveRuns,
    job: String,
    token: CancelToken,
}

impl JobLockGuard {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.job);
        tracing::trace!("Released lock of {:?}", self.job);
    }
}

impl JobLocks {
    /// `None` when the job already has an active run
    pub fn try_acquire(&self, job: &str) -> Option<JobLockGuard> {
        let mut active = lock_active(&self.active);
        if active.contains_key(job) {
            return None;
        }
        let token = CancelToken::default();
        active.insert(job.to_string(), token.clone());
        Some(JobLockGuard {
            active: self.active.clone(),
            job: job.to_string(),
            token,
        })
    }

    /// Returns whether a run was active to cancel
    pub fn cancel(&self, job: &str) -> bool {
        match lock_active(&self.active).get(job) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
