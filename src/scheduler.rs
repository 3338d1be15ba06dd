// =============================================================================
// Scheduler — cron ticks, concurrency guard, misfire grace
// =============================================================================
//
// Each job gets its own tick loop driven by a cron schedule (UTC). The rules:
//
//   * At-most-one-in-flight per job: a tick that fires while the previous
//     instance still runs is dropped and logged, never queued.
//   * Misfire grace: a tick observed within the grace window of its nominal
//     time runs with the nominal time as logical now; a later one is
//     abandoned and the loop moves on to the next schedule point.
//   * Every run writes a job-log row (running -> success/failed); unhandled
//     errors and deadline overruns land in the row's error message.
//   * Shutdown stops new ticks; in-flight runs get a bounded grace to finish.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::jobs::JobReport;
use crate::store::{JobStatus, Store};

/// Hourly tick: top of every hour, UTC (sec min hour dom month dow).
pub const HOURLY_SCHEDULE: &str = "0 0 * * * *";
/// Daily tick: midnight UTC.
pub const DAILY_SCHEDULE: &str = "0 0 0 * * *";

/// Grace windows within which a late tick still runs.
pub const HOURLY_GRACE: Duration = Duration::from_secs(60);
pub const DAILY_GRACE: Duration = Duration::from_secs(300);

/// Hard deadlines per run; past these the job is cancelled and marked failed.
pub const HOURLY_DEADLINE: Duration = Duration::from_secs(120);
pub const DAILY_DEADLINE: Duration = Duration::from_secs(600);

/// How long shutdown waits for in-flight runs.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<JobReport>> + Send>>;
pub type JobFn = Arc<dyn Fn(DateTime<Utc>) -> JobFuture + Send + Sync>;

/// Static description of one scheduled job.
#[derive(Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub cron_expr: &'static str,
    pub grace: Duration,
    pub deadline: Duration,
}

impl JobSpec {
    pub fn schedule(&self) -> Schedule {
        self.cron_expr
            .parse()
            .expect("job cron expression must be valid")
    }
}

/// What to do with a tick observed at `now` whose nominal time was `nominal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Run, treating the nominal time as logical now.
    Run { late_by_ms: i64 },
    /// Too far past the nominal time: abandon this tick entirely.
    Misfire { late_by_ms: i64 },
}

/// Pure misfire rule, separated so it can be tested without a clock.
pub fn evaluate_tick(nominal: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> TickDecision {
    let late_by_ms = (now - nominal).num_milliseconds();
    if late_by_ms > grace.as_millis() as i64 {
        TickDecision::Misfire { late_by_ms }
    } else {
        TickDecision::Run { late_by_ms }
    }
}

/// One job's tick loop plus the guard that shutdown waits on.
pub struct ScheduledJob {
    pub spec: JobSpec,
    guard: Arc<Mutex<()>>,
}

impl ScheduledJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Wait (bounded) for an in-flight run to finish. Returns false when the
    /// run was still going at the deadline.
    pub async fn await_idle(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.guard.clone().lock_owned())
            .await
            .is_ok()
    }

    /// Drive the tick loop until `shutdown` flips. Runs are spawned so the
    /// loop keeps observing (and dropping) ticks while a run is in flight.
    pub async fn run_loop(&self, store: Store, job: JobFn, mut shutdown: watch::Receiver<bool>) {
        let schedule = self.spec.schedule();
        info!(job = self.spec.name, cron = self.spec.cron_expr, "job scheduled");

        loop {
            let now = Utc::now();
            let Some(nominal) = schedule.after(&now).next() else {
                error!(job = self.spec.name, "schedule yielded no next tick");
                return;
            };
            let wait = (nominal - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            if *shutdown.borrow() {
                info!(job = self.spec.name, "scheduler stopping, no further ticks");
                return;
            }

            match evaluate_tick(nominal, Utc::now(), self.spec.grace) {
                TickDecision::Misfire { late_by_ms } => {
                    warn!(
                        job = self.spec.name,
                        nominal = %nominal,
                        late_by_ms,
                        "tick missed its grace window, abandoned"
                    );
                }
                TickDecision::Run { late_by_ms } => {
                    match self.guard.clone().try_lock_owned() {
                        Err(_) => {
                            warn!(
                                job = self.spec.name,
                                nominal = %nominal,
                                "tick dropped, previous run still in flight"
                            );
                        }
                        Ok(permit) => {
                            if late_by_ms > 0 {
                                info!(
                                    job = self.spec.name,
                                    late_by_ms, "tick within grace, running at nominal time"
                                );
                            }
                            let store = store.clone();
                            let job = job.clone();
                            let name = self.spec.name;
                            let deadline = self.spec.deadline;
                            tokio::spawn(async move {
                                run_tracked(permit, &store, name, deadline, nominal, job).await;
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Execute one run under job-log tracking and a deadline. The permit is held
/// for the whole run, which is what makes the drop-tick guard work.
async fn run_tracked(
    permit: OwnedMutexGuard<()>,
    store: &Store,
    name: &'static str,
    deadline: Duration,
    logical_now: DateTime<Utc>,
    job: JobFn,
) {
    let _permit = permit;

    let handle = match store.begin_job(name, Utc::now()).await {
        Ok(h) => h,
        Err(e) => {
            // Without a log row the run is unaccountable; skip it and let
            // the next tick retry once the store is back.
            error!(job = name, error = %e, "could not open job-log row, skipping run");
            return;
        }
    };

    let (status, message, records) = match tokio::time::timeout(deadline, job(logical_now)).await {
        Ok(Ok(report)) => (JobStatus::Success, report.note, report.records_processed),
        Ok(Err(e)) => {
            error!(job = name, error = %e, "job run failed");
            (JobStatus::Failed, Some(e.to_string()), 0)
        }
        Err(_) => {
            error!(job = name, deadline_s = deadline.as_secs(), "job run exceeded its deadline");
            (
                JobStatus::Failed,
                Some(format!("cancelled after {}s deadline", deadline.as_secs())),
                0,
            )
        }
    };

    if let Err(e) = store
        .end_job(&handle, status, message.as_deref(), records)
        .await
    {
        error!(job = name, error = %e, "could not finalize job-log row");
    }
}

/// The two production job specs.
pub fn hourly_spec() -> JobSpec {
    JobSpec {
        name: crate::jobs::HOURLY_JOB_NAME,
        cron_expr: HOURLY_SCHEDULE,
        grace: HOURLY_GRACE,
        deadline: HOURLY_DEADLINE,
    }
}

pub fn daily_spec() -> JobSpec {
    JobSpec {
        name: crate::jobs::DAILY_JOB_NAME,
        cron_expr: DAILY_SCHEDULE,
        grace: DAILY_GRACE,
        deadline: DAILY_DEADLINE,
    }
}
