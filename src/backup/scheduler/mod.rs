//! Cron-driven triggering of job runs.
//!
//! A single ticker sleeps until the earliest next firing and hands due jobs
//! to a rayon pool. Mutual exclusion per job lives in the engine, so a slow
//! run simply turns the next firing into a `Skipped` run.

pub mod cron;
pub mod locks;

use crate::backup::engine::{Admission, Engine};
use crate::backup::result_error::result::Result;
use crate::backup::scheduler::cron::next_fire_time;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper bound on one sleep, so clock adjustments are picked up
static MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct SchedulerState {
    accepting: bool,
    in_flight: usize,
    next_fire: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SchedulerState>,
    changed: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks one triggered run as in flight until dropped
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.state().in_flight -= 1;
        self.0.changed.notify_all();
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    pool: ThreadPool,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("gong-job-{i}"))
            .build()?;

        let now = Utc::now();
        let mut next_fire = BTreeMap::new();
        for job in engine.config().jobs() {
            if !job.enabled() {
                tracing::info!("Job {:?} is disabled", job.name());
                continue;
            }
            next_fire.insert(job.name().clone(), next_fire_time(job.schedule(), now)?);
        }

        Ok(Self {
            engine,
            pool,
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    accepting: true,
                    in_flight: 0,
                    next_fire,
                }),
                changed: Condvar::new(),
            }),
        })
    }

    pub fn next_fire_times(&self) -> Vec<(String, DateTime<Utc>)> {
        self.shared
            .state()
            .next_fire
            .iter()
            .map(|(job, at)| (job.clone(), *at))
            .collect_vec()
    }

    /// Starts a run of `job` on the pool. Returns `false` once shutdown has
    /// begun.
    ///
    /// The job lock is taken here, before the run is queued, so a trigger for
    /// a job that is still running, or still waiting for a free worker, ends
    /// as a `Skipped` run on the spot.
    pub fn trigger(&self, job: &str, at: DateTime<Utc>) -> bool {
        {
            let mut state = self.shared.state();
            if !state.accepting {
                tracing::info!("Shutting down, ignoring trigger of {:?}", job);
                return false;
            }
            state.in_flight += 1;
        }
        let in_flight = InFlight(self.shared.clone());

        let lock = match self.engine.admit(job, at) {
            Ok(Admission::Admitted(lock)) => lock,
            Ok(Admission::Skipped(run)) => {
                tracing::info!("Run {} of {:?} ended {}", run.id, job, run.state);
                return true;
            }
            Err(e) => {
                tracing::error!("Cannot run {:?}: {}", job, e);
                return true;
            }
        };

        let engine = self.engine.clone();
        self.pool.spawn(move || {
            let _in_flight = in_flight;
            let job = lock.job().to_string();
            match engine.run_admitted(lock, at) {
                Ok(run) => tracing::info!("Run {} of {:?} ended {}", run.id, job, run.state),
                Err(e) => tracing::error!("Cannot run {:?}: {}", job, e),
            }
        });
        true
    }

    /// Jobs due at `now`, each moved on to its next firing after `now`.
    /// Firings missed while the process was busy collapse into one.
    fn take_due(
        &self,
        state: &mut SchedulerState,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let due = state
            .next_fire
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(job, at)| (job.clone(), *at))
            .collect_vec();
        for (job, _) in &due {
            let schedule = self.engine.config().job(job)?.schedule();
            state.next_fire.insert(job.clone(), next_fire_time(schedule, now)?);
        }
        Ok(due)
    }

    /// Ticks until [`Scheduler::shutdown`] is called.
    pub fn run(&self) -> Result<()> {
        tracing::info!("Scheduler started");
        loop {
            let due = {
                let mut state = self.shared.state();
                if !state.accepting {
                    break;
                }
                let now = Utc::now();
                let due = self.take_due(&mut state, now)?;
                if due.is_empty() {
                    let wait = state
                        .next_fire
                        .values()
                        .min()
                        .map(|at| (*at - now).to_std().unwrap_or_default())
                        .unwrap_or(MAX_WAIT)
                        .min(MAX_WAIT);
                    tracing::trace!("Sleeping for {:?}", wait);
                    let _ = self
                        .shared
                        .changed
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
                due
            };

            for (job, at) in due {
                tracing::info!("Triggering {:?} scheduled at {}", job, at);
                self.trigger(&job, at);
            }
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Stops accepting triggers and waits for runs in flight to finish.
    pub fn shutdown(&self) {
        let mut state = self.shared.state();
        state.accepting = false;
        self.shared.changed.notify_all();
        while state.in_flight > 0 {
            tracing::info!("Waiting for {} run(s) to finish", state.in_flight);
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_config::Config;
    use crate::backup::run::RunState;
    use tempfile::TempDir;

    struct Fixture {
        _source: TempDir,
        _data: TempDir,
        engine: Arc<Engine>,
    }

    fn fixture() -> Fixture {
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("a.txt"), "alpha").unwrap();
        let data = TempDir::new().unwrap();
        let config = Config::from_yaml_str(&format!(
            r#"
global:
  data_dir: {:?}
jobs:
  - name: hourly
    schedule: "0 * * * *"
    source: {{ type: files, paths: [{:?}] }}
    destination: {{ type: memory }}
  - name: off
    enabled: false
    schedule: "0 * * * *"
    source: {{ type: files, paths: [{:?}] }}
    destination: {{ type: memory }}
"#,
            data.path(),
            source.path(),
            source.path()
        ))
        .unwrap();
        Fixture {
            engine: Arc::new(Engine::new(config).unwrap()),
            _source: source,
            _data: data,
        }
    }

    #[test]
    fn test_only_enabled_jobs_are_scheduled() {
        let fixture = fixture();
        let scheduler = Scheduler::new(fixture.engine.clone(), 2).unwrap();
        let times = scheduler.next_fire_times();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].0, "hourly");
        assert!(times[0].1 > Utc::now());
    }

    #[test]
    fn test_trigger_then_drain() {
        let fixture = fixture();
        let scheduler = Scheduler::new(fixture.engine.clone(), 2).unwrap();

        assert!(scheduler.trigger("hourly", Utc::now()));
        scheduler.shutdown();
        assert!(!scheduler.trigger("hourly", Utc::now()));

        let runs = fixture.engine.list_runs("hourly").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Completed);
    }

    #[test]
    fn test_trigger_while_queued_is_skipped() {
        let fixture = fixture();
        let scheduler = Scheduler::new(fixture.engine.clone(), 1).unwrap();

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        scheduler.pool.spawn(move || {
            let _ = release_rx.recv();
        });

        assert!(scheduler.trigger("hourly", Utc::now()));
        assert!(scheduler.trigger("hourly", Utc::now()));
        let runs = fixture.engine.list_runs("hourly").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Skipped);

        release_tx.send(()).unwrap();
        scheduler.shutdown();
        let states = fixture
            .engine
            .list_runs("hourly")
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .sorted_by_key(|s| s.to_string())
            .collect_vec();
        assert_eq!(states, vec![RunState::Completed, RunState::Skipped]);
    }

    #[test]
    fn test_due_jobs_move_to_next_firing() {
        let fixture = fixture();
        let scheduler = Scheduler::new(fixture.engine.clone(), 1).unwrap();
        let now = Utc::now();
        let past = now - chrono::Duration::hours(3);

        let mut state = scheduler.shared.state();
        state.next_fire.insert("hourly".into(), past);
        let due = scheduler.take_due(&mut state, now).unwrap();
        assert_eq!(due, vec![("hourly".to_string(), past)]);
        assert!(state.next_fire["hourly"] > now);
        assert!(scheduler.take_due(&mut state, now).unwrap().is_empty());
    }

    #[test]
    fn test_run_returns_after_shutdown() {
        let fixture = fixture();
        let scheduler = Arc::new(Scheduler::new(fixture.engine.clone(), 1).unwrap());
        let ticker = {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || scheduler.run())
        };
        std::thread::sleep(Duration::from_millis(50));
        scheduler.shutdown();
        ticker.join().unwrap().unwrap();
    }
}
