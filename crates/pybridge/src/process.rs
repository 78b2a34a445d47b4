use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};

/// How long `terminate` waits after SIGTERM before escalating to SIGKILL.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Shared handle to the spawned guest. Clones refer to the same process, so
/// a signal coordinator or a timed-out channel can terminate it while
/// another thread is blocked in `wait`.
#[derive(Clone)]
pub struct ChildProcess {
    inner: Arc<ChildInner>,
}

struct ChildInner {
    child: Mutex<Child>,
    pid: u32,
}

impl ChildProcess {
    pub(crate) fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            inner: Arc::new(ChildInner {
                child: Mutex::new(child),
                pid,
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let mut child = self.inner.child.lock().unwrap();
        child.try_wait().map_err(BridgeError::Io)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Blocks until the guest exits and returns its exit code. An exit by
    /// signal (including a forced kill) surfaces as `ChildKilled`.
    ///
    /// Polls rather than holding the child lock across a blocking wait, so
    /// `terminate` stays callable from other threads.
    pub fn wait(&self) -> Result<i32> {
        loop {
            if let Some(status) = self.try_wait()? {
                return exit_code(status);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Graceful-then-forced termination: SIGTERM, up to five seconds of
    /// grace, then SIGKILL. A no-op when the guest has already exited.
    pub fn terminate(&self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }

        tracing::debug!(pid = self.inner.pid, "terminating guest");
        self.signal(libc::SIGTERM)?;

        let deadline = Instant::now() + GRACEFUL_EXIT_TIMEOUT;
        while Instant::now() < deadline {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::warn!(
            pid = self.inner.pid,
            "guest ignored SIGTERM for {GRACEFUL_EXIT_TIMEOUT:?}, killing"
        );
        self.signal(libc::SIGKILL)?;
        loop {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn signal(&self, signal: libc::c_int) -> Result<()> {
        let pid = self.inner.pid as libc::pid_t;
        if unsafe { libc::kill(pid, signal) } != 0 {
            let err = std::io::Error::last_os_error();
            // The guest may have exited between the liveness check and the
            // kill; that is not a failure.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(BridgeError::Io(err));
        }
        Ok(())
    }
}

fn exit_code(status: ExitStatus) -> Result<i32> {
    match status.code() {
        Some(code) => Ok(code),
        None => Err(BridgeError::ChildKilled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn wait_returns_the_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let child = ChildProcess::new(child);
        assert_eq!(child.wait().unwrap(), 3);
    }

    #[test]
    fn killed_child_surfaces_as_child_killed() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let child = ChildProcess::new(child);
        unsafe {
            libc::kill(child.pid() as libc::pid_t, libc::SIGKILL);
        }
        assert!(matches!(child.wait(), Err(BridgeError::ChildKilled)));
    }

    #[test]
    fn terminate_stops_a_running_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let child = ChildProcess::new(child);
        assert!(child.is_running());
        child.terminate().unwrap();
        assert!(!child.is_running());
    }

    #[test]
    fn terminate_after_exit_is_a_no_op() {
        let child = Command::new("true").spawn().unwrap();
        let child = ChildProcess::new(child);
        let _ = child.wait();
        child.terminate().unwrap();
        child.terminate().unwrap();
    }

    #[test]
    fn terminate_is_safe_from_a_clone_while_waiting() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let child = ChildProcess::new(child);
        let waiter = child.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(50));
        child.terminate().unwrap();
        assert!(matches!(
            handle.join().unwrap(),
            Err(BridgeError::ChildKilled)
        ));
    }
}
