//! Follow-mode output reader.
//!
//! Wraps a plain file handle so end-of-file is suppressed while the job is
//! still running, emulating `docker logs -f` without inotify: hitting EOF on
//! a live job just means "nothing new yet".

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::job::{State, StatusCell};

/// How long to idle after a suppressed EOF before the caller retries.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct PollingReader {
    inner: std::fs::File,
    status: Arc<StatusCell>,
    finished: bool,
}

impl PollingReader {
    pub(crate) fn new(inner: std::fs::File, status: Arc<StatusCell>) -> Self {
        PollingReader {
            inner,
            status,
            finished: false,
        }
    }

    /// True once a read has observed EOF with the job in a terminal state.
    /// From then on `read` keeps returning 0 and callers should stop.
    pub fn finished(&self) -> bool {
        self.finished
    }
}

impl Read for PollingReader {
    /// Returns bytes whenever the file has them. On EOF with the job still
    /// running, sleeps one poll interval and reports "no bytes, no error" so
    /// the caller loops; on EOF with the job terminal, latches `finished`.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            if self.status.snapshot().state == State::Running {
                std::thread::sleep(POLL_INTERVAL);
            } else {
                self.finished = true;
            }
        }
        Ok(n)
    }
}
