//! A single supervised job: configuration, spawn, state machine, output and
//! termination.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::watch;

use crate::sandbox::cgroup::{self, CgroupConfig, CgroupError};
use crate::sandbox::spawn::{self, SpawnError};
use crate::sandbox::{bootstrap, mount};

/// How long to wait after each termination signal before escalating.
pub const WAIT_DELAY: Duration = Duration::from_secs(30);

/// Configuration for a job. Limit fields set to zero mean "no limit"; the
/// cgroup prefix and device numbers are injected by the owning executor.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub cmd: String,
    pub args: Vec<String>,
    pub cpu_percent: u32,
    pub memory_mb: u64,
    pub read_bps: u32,
    pub write_bps: u32,
    /// Injected by the owning executor: per-instance cgroup naming prefix.
    pub cgroup_prefix: String,
    /// Injected by the owning executor: discovered root block device. Only
    /// the major matters for `io.max`, partitions are not throttle targets.
    pub device_major: u64,
    pub device_minor: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Queued,
    Running,
    Failed,
    Completed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Queued => "Queued",
            State::Running => "Running",
            State::Failed => "Failed",
            State::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of a job.
#[derive(Debug, Clone)]
pub struct Status {
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub terminated_at: Option<SystemTime>,
    pub pid: Option<i32>,
    pub state: State,
    pub error: Option<String>,
}

/// Shared status slot, owned by the job and handed to followers such as the
/// polling reader. The lock is only ever held for a field update or a copy.
#[derive(Debug)]
pub(crate) struct StatusCell(Mutex<Status>);

impl StatusCell {
    fn new() -> Self {
        StatusCell(Mutex::new(Status {
            created_at: SystemTime::now(),
            started_at: None,
            terminated_at: None,
            pid: None,
            state: State::Queued,
            error: None,
        }))
    }

    pub(crate) fn snapshot(&self) -> Status {
        self.0
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut Status)) {
        let mut status = self.0.lock().unwrap_or_else(|poison| poison.into_inner());
        f(&mut status);
    }

    #[cfg(test)]
    pub(crate) fn for_test(state: State) -> Arc<Self> {
        let cell = StatusCell::new();
        cell.update(|s| s.state = state);
        Arc::new(cell)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} has been started already")]
    AlreadyStarted(u64),

    #[error("job not started yet")]
    NotStarted,

    #[error("failed to allocate output file: {0}")]
    Output(std::io::Error),

    #[error(transparent)]
    Cgroup(#[from] CgroupError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

pub struct Job {
    id: u64,
    config: JobConfig,
    started: AtomicBool,
    status: Arc<StatusCell>,
    output: OnceLock<(PathBuf, std::fs::File)>,
    cgroup_path: OnceLock<PathBuf>,
    done: watch::Sender<bool>,
    wait_delay: Duration,
}

impl Job {
    pub fn new(id: u64, config: JobConfig) -> Self {
        let (done, _) = watch::channel(false);
        Job {
            id,
            config,
            started: AtomicBool::new(false),
            status: Arc::new(StatusCell::new()),
            output: OnceLock::new(),
            cgroup_path: OnceLock::new(),
            done,
            wait_delay: WAIT_DELAY,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the job's status.
    pub fn status(&self) -> Status {
        self.status.snapshot()
    }

    pub(crate) fn status_cell(&self) -> Arc<StatusCell> {
        Arc::clone(&self.status)
    }

    /// Starts the job. Flips the started flag exactly once; a second call
    /// fails with `AlreadyStarted` and leaves the job untouched. Spawn
    /// failures are surfaced here and transition the job to Failed.
    pub async fn start(self: &Arc<Self>) -> Result<(), JobError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JobError::AlreadyStarted(self.id));
        }

        match self.launch() {
            Ok(pid) => {
                self.spawn_waiter(pid);
                Ok(())
            }
            Err(err) => {
                self.status.update(|s| {
                    s.state = State::Failed;
                    s.error = Some(err.to_string());
                });
                // never transitioned to Running, so nothing else will
                // release the cgroup
                if let Some(path) = self.cgroup_path.get() {
                    let _ = cgroup::remove(path);
                }
                Err(err)
            }
        }
    }

    fn launch(&self) -> Result<i32, JobError> {
        let path = spawn::lookup_path(&self.config.cmd)?;

        let (file, output_path) = tempfile::NamedTempFile::new()
            .map_err(JobError::Output)?
            .keep()
            .map_err(|e| JobError::Output(e.error))?;
        let _ = self.output.set((output_path, file));

        let attrs = self.prepare_attrs()?;

        let env = bootstrap::helper_env(&path.to_string_lossy(), &self.config.args);
        let (_, output_file) = self.output.get().ok_or(JobError::NotStarted)?;
        let pid = spawn::spawn_helper(&attrs, &env, output_file)?;

        self.status.update(|s| {
            s.started_at = Some(SystemTime::now());
            s.pid = Some(pid);
            s.state = State::Running;
        });
        Ok(pid)
    }

    #[cfg(target_os = "linux")]
    fn prepare_attrs(&self) -> Result<mount::SpawnAttrs, JobError> {
        let limits = CgroupConfig {
            cpu_percent: self.config.cpu_percent,
            memory_mb: self.config.memory_mb,
            read_bps: self.config.read_bps,
            write_bps: self.config.write_bps,
            device_major: self.config.device_major,
        };
        let (fd, path) = cgroup::create(
            std::path::Path::new(cgroup::CGROUP_ROOT),
            &self.config.cgroup_prefix,
            self.id,
            &limits,
        )?;
        let _ = self.cgroup_path.set(path);
        Ok(mount::clone_attrs(Some(fd)))
    }

    #[cfg(not(target_os = "linux"))]
    fn prepare_attrs(&self) -> Result<mount::SpawnAttrs, JobError> {
        Ok(mount::clone_attrs())
    }

    /// Detached supervisor: reaps the child, then stamps the terminal state,
    /// flushes the output file, removes the cgroup and signals `done`.
    fn spawn_waiter(self: &Arc<Self>, pid: i32) {
        let job = Arc::clone(self);
        drop(tokio::spawn(async move {
            let wait = tokio::task::spawn_blocking(move || waitpid(Pid::from_raw(pid), None)).await;

            if let Some((_, file)) = job.output.get() {
                let _ = file.sync_all();
            }

            job.status.update(|s| {
                s.terminated_at = Some(SystemTime::now());
                match wait {
                    Ok(Ok(WaitStatus::Exited(_, 0))) => s.state = State::Completed,
                    Ok(Ok(wait_status)) => {
                        s.state = State::Failed;
                        s.error = Some(describe_exit(&wait_status));
                    }
                    Ok(Err(err)) => {
                        s.state = State::Failed;
                        s.error = Some(format!("wait failed: {err}"));
                    }
                    Err(err) => {
                        s.state = State::Failed;
                        s.error = Some(format!("waiter panicked: {err}"));
                    }
                }
            });

            if let Some(path) = job.cgroup_path.get() {
                if let Err(err) = cgroup::remove(path) {
                    tracing::debug!(job_id = job.id, error = %err, "cgroup removal failed");
                }
            }

            let _ = job.done.send(true);
        }));
    }

    /// Terminates the job: SIGTERM first, then SIGKILL twice at `WAIT_DELAY`
    /// intervals if the child keeps ignoring us. Returns once the child is
    /// reaped or after the second kill attempt. Terminal jobs are a no-op.
    pub async fn stop(&self) {
        let status = self.status.snapshot();
        if status.state.is_terminal() {
            return;
        }
        let Some(pid) = status.pid else {
            return;
        };
        let pid = Pid::from_raw(pid);

        let mut done = self.done.subscribe();
        if *done.borrow_and_update() {
            return;
        }

        if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
            tracing::debug!(job_id = self.id, error = %err, "SIGTERM delivery failed");
        }

        for _ in 0..2 {
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_ok() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.wait_delay) => {
                    let _ = signal::kill(pid, Signal::SIGKILL);
                }
            }
        }
    }

    /// Opens a fresh read-only handle on the job's output. Every caller gets
    /// an independent file position.
    pub fn stdout(&self) -> Result<std::fs::File, JobError> {
        let (path, _) = self.output.get().ok_or(JobError::NotStarted)?;
        std::fs::File::open(path).map_err(JobError::Output)
    }

    /// Blocks until the job reaches a terminal state. Returns immediately if
    /// it already has.
    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cmd", &self.config.cmd)
            .field("state", &self.status.snapshot().state)
            .finish()
    }
}

fn describe_exit(status: &WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exit status {code}"),
        WaitStatus::Signaled(_, sig, _) => format!("terminated by signal {sig}"),
        other => format!("unexpected wait status: {other:?}"),
    }
}
