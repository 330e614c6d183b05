// ── Job orchestrator ──
//
// Stages 2-4 run as jobs: a bounded worker pool drains a shared device
// queue and appends one result per device as it completes, so pollers
// see live progress. Only one job per stage may run against an
// overlapping device set at a time; that rule is what keeps two
// workers from racing on the same registry records.

use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::{StreamExt, stream};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::stage::DeviceOutcome;

/// Default worker pool width.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Finished jobs stay pollable this long before pruning.
const RETAIN_FINISHED_MINS: i64 = 5;

/// Which pipeline stage a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Adopt,
    OtaNaming,
    Configure,
    Snapshot,
    Audit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

/// Pollable progress view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub stage: JobStage,
    pub status: JobState,
    pub current: usize,
    pub total: usize,
    /// Device currently being processed, when one is in flight.
    pub current_device: Option<String>,
    pub results: Vec<DeviceOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobInner {
    status: JobStatus,
    devices: HashSet<String>,
}

/// Tracks running and recently finished jobs.
#[derive(Clone)]
pub struct JobTracker {
    jobs: Arc<Mutex<HashMap<String, Arc<Mutex<JobInner>>>>>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a job over `devices`, fanning work out to `concurrency`
    /// workers running `worker` per device. Returns the job id
    /// immediately; progress is polled via [`JobTracker::status`].
    ///
    /// Rejected with `JobConflict` when a running job for the same
    /// stage overlaps this device set.
    pub fn start<W, Fut>(
        &self,
        stage: JobStage,
        devices: Vec<String>,
        concurrency: usize,
        worker: W,
    ) -> Result<String>
    where
        W: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DeviceOutcome> + Send,
    {
        let device_set: HashSet<String> = devices.iter().cloned().collect();
        let id = short_id();

        {
            let mut jobs = lock(&self.jobs);
            Self::prune(&mut jobs);
            for job in jobs.values() {
                let inner = lock(job);
                if inner.status.status == JobState::Running
                    && inner.status.stage == stage
                    && !inner.devices.is_disjoint(&device_set)
                {
                    return Err(CoreError::JobConflict {
                        running: inner.status.id.clone(),
                        stage: format!("{stage:?}"),
                    });
                }
            }

            let inner = Arc::new(Mutex::new(JobInner {
                status: JobStatus {
                    id: id.clone(),
                    stage,
                    status: JobState::Running,
                    current: 0,
                    total: devices.len(),
                    current_device: None,
                    results: Vec::with_capacity(devices.len()),
                    started_at: Utc::now(),
                    finished_at: None,
                },
                devices: device_set,
            }));
            jobs.insert(id.clone(), inner);
        }

        let jobs = Arc::clone(&self.jobs);
        let job_id = id.clone();
        let concurrency = concurrency.max(1);
        info!(id = %job_id, ?stage, total = devices.len(), concurrency, "job started");

        tokio::spawn(async move {
            let handle = lock(&jobs).get(&job_id).cloned();
            let Some(handle) = handle else { return };

            let worker = Arc::new(worker);
            let mut results = stream::iter(devices)
                .map(|device| {
                    let worker = Arc::clone(&worker);
                    let handle = Arc::clone(&handle);
                    async move {
                        lock(&handle).status.current_device = Some(device.clone());
                        worker(device).await
                    }
                })
                .buffer_unordered(concurrency);

            while let Some(outcome) = results.next().await {
                let mut inner = lock(&handle);
                debug!(id = %inner.status.id, device = %outcome.device, ok = outcome.ok, "device finished");
                inner.status.current += 1;
                inner.status.results.push(outcome);
            }

            let mut inner = lock(&handle);
            let failed = inner.status.results.iter().any(|r| !r.ok);
            inner.status.status = if failed {
                JobState::Failed
            } else {
                JobState::Completed
            };
            inner.status.current_device = None;
            inner.status.finished_at = Some(Utc::now());
            info!(id = %inner.status.id, status = ?inner.status.status, "job finished");
        });

        Ok(id)
    }

    /// Current status snapshot of a job.
    pub fn status(&self, id: &str) -> Result<JobStatus> {
        let mut jobs = lock(&self.jobs);
        Self::prune(&mut jobs);
        jobs.get(id)
            .map(|job| lock(job).status.clone())
            .ok_or_else(|| CoreError::JobNotFound { id: id.to_owned() })
    }

    /// Status snapshots of every known job, newest first.
    pub fn list(&self) -> Vec<JobStatus> {
        let mut jobs = lock(&self.jobs);
        Self::prune(&mut jobs);
        let mut statuses: Vec<JobStatus> =
            jobs.values().map(|job| lock(job).status.clone()).collect();
        statuses.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        statuses
    }

    /// Drop finished jobs past the retention window.
    fn prune(jobs: &mut HashMap<String, Arc<Mutex<JobInner>>>) {
        let cutoff = Utc::now() - ChronoDuration::minutes(RETAIN_FINISHED_MINS);
        jobs.retain(|_, job| {
            let inner = lock(job);
            match inner.status.finished_at {
                Some(finished) => finished > cutoff,
                None => true,
            }
        });
    }
}

/// First 8 characters of a v4 UUID; short enough to type, unique
/// enough for a tracker that prunes itself.
fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_owned()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
