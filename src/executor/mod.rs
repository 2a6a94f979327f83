//! Job registry and lifecycle.
//!
//! The executor owns every job it has ever started, keyed by a monotonic ID,
//! so terminated jobs stay inspectable until the process exits. It is
//! deliberately unbounded: admission control belongs to a layer this service
//! does not have.

pub mod job;
pub mod reader;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::sandbox::mount::MountError;

pub use job::{Job, JobConfig, JobError, State, Status};
pub use reader::PollingReader;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("error reading device info: {0}")]
    Mount(#[from] MountError),
}

pub struct Executor {
    /// Per-instance UUID, used as the cgroup naming prefix so concurrent
    /// executors on one host cannot collide.
    id: Uuid,
    device_major: u64,
    device_minor: u64,
    jobs: RwLock<HashMap<u64, Arc<Job>>>,
    next_id: AtomicU64,
    /// Count of live jobs; the collective wait blocks until it drains to 0.
    active: watch::Sender<usize>,
}

impl Executor {
    pub fn new() -> Result<Self, ExecutorError> {
        let (device_major, device_minor) = discover_root_device()?;
        let (active, _) = watch::channel(0);
        Ok(Executor {
            id: Uuid::new_v4(),
            device_major,
            device_minor,
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            active,
        })
    }

    /// Starts a job and registers it under a fresh ID. The ID counter moves
    /// even when the spawn fails, so IDs are never reused. Jobs enter the map
    /// only after a successful spawn.
    pub async fn start(&self, mut config: JobConfig) -> Result<u64, ExecutorError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        config.cgroup_prefix = self.id.to_string();
        config.device_major = self.device_major;
        config.device_minor = self.device_minor;

        let job = Arc::new(Job::new(id, config));
        job.start().await?;

        self.jobs.write().await.insert(id, Arc::clone(&job));
        self.active.send_modify(|n| *n += 1);

        let active = self.active.clone();
        drop(tokio::spawn(async move {
            job.wait().await;
            active.send_modify(|n| *n -= 1);
        }));

        Ok(id)
    }

    /// Status snapshot for a job, or None if the ID is unknown.
    pub async fn get(&self, id: u64) -> Option<Status> {
        self.jobs.read().await.get(&id).map(|job| job.status())
    }

    /// All job IDs ever managed by this instance, in no particular order.
    pub async fn list(&self) -> Vec<u64> {
        self.jobs.read().await.keys().copied().collect()
    }

    /// Opens a follow-mode reader over a job's output.
    pub async fn stdout(&self, id: u64) -> Result<PollingReader, ExecutorError> {
        let job = self
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ExecutorError::JobNotFound(id))?;
        let file = job.stdout()?;
        Ok(PollingReader::new(file, job.status_cell()))
    }

    /// Terminates one job. Unknown IDs are silently ignored.
    pub async fn stop_process(&self, id: u64) {
        let job = self.jobs.read().await.get(&id).cloned();
        if let Some(job) = job {
            job.stop().await;
        }
    }

    /// Terminates every running job, then blocks until all of them are
    /// reaped.
    pub async fn stop(&self) {
        let running: Vec<Arc<Job>> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status().state == State::Running)
            .cloned()
            .collect();
        for job in running {
            job.stop().await;
        }
        self.wait().await;
    }

    /// Blocks until there are no live jobs.
    pub async fn wait(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("device_major", &self.device_major)
            .field("device_minor", &self.device_minor)
            .finish_non_exhaustive()
    }
}

#[cfg(target_os = "linux")]
fn discover_root_device() -> Result<(u64, u64), MountError> {
    crate::sandbox::mount::root_device()
}

#[cfg(not(target_os = "linux"))]
fn discover_root_device() -> Result<(u64, u64), MountError> {
    Ok((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_config() -> JobConfig {
        JobConfig {
            cmd: "bashh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn failed_spawns_are_not_registered() {
        let executor = Executor::new().unwrap();
        let err = executor.start(failing_config()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(executor.list().await.is_empty());
        assert!(executor.get(0).await.is_none());
    }

    #[tokio::test]
    async fn ids_advance_across_failed_starts() {
        let executor = Executor::new().unwrap();
        let _ = executor.start(failing_config()).await;
        let _ = executor.start(failing_config()).await;
        assert_eq!(executor.next_id.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_ids_are_handled() {
        let executor = Executor::new().unwrap();
        assert!(executor.get(42).await.is_none());
        assert!(matches!(
            executor.stdout(42).await.unwrap_err(),
            ExecutorError::JobNotFound(42)
        ));
        // must not panic or block
        executor.stop_process(42).await;
    }

    #[tokio::test]
    async fn wait_returns_with_no_active_jobs() {
        let executor = Executor::new().unwrap();
        executor.wait().await;
        executor.stop().await;
    }
}
