//! Process-wide signal coordinator.
//!
//! Signal delivery is global to the process, so the handler is installed at
//! most once and every supervisor registers its child with the same
//! coordinator instead of racing to install handlers of its own. The handler
//! only writes the signal number to a self-pipe; the coordinator thread does
//! the actual work: terminate every registered guest, restore the default
//! disposition, and re-raise so the host exits with conventional semantics.

use std::fs::File;
use std::io::Read;
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{mpsc, OnceLock};
use std::thread;

use crate::process::ChildProcess;

static REGISTRY: OnceLock<mpsc::Sender<ChildProcess>> = OnceLock::new();

/// Write end of the self-pipe; -1 until the handler is installed.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Registers a guest for termination when the host receives SIGINT or
/// SIGTERM. The first registration installs the handler and starts the
/// coordinator thread.
pub(crate) fn register(child: ChildProcess) {
    let tx = REGISTRY.get_or_init(|| {
        let (tx, rx) = mpsc::channel::<ChildProcess>();
        match install_handler() {
            Ok(wake) => {
                let _ = thread::Builder::new()
                    .name("pybridge-signal".to_string())
                    .spawn(move || coordinator_loop(wake, rx));
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
            }
        }
        tx
    });
    let _ = tx.send(child);
}

extern "C" fn on_signal(signal: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signal as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn install_handler() -> std::io::Result<File> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe {
        libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
        libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
    }
    WAKE_FD.store(fds[1], Ordering::Relaxed);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(File::from_raw_fd(fds[0]))
    }
}

fn coordinator_loop(mut wake: File, rx: mpsc::Receiver<ChildProcess>) {
    let mut byte = [0u8; 1];
    loop {
        match wake.read(&mut byte) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
        let signal = byte[0] as libc::c_int;
        tracing::debug!(signal, "signal received, terminating registered guests");

        for child in rx.try_iter() {
            let _ = child.terminate();
        }

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut());
            libc::raise(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn register_accepts_children_without_raising() {
        // Registration must neither install-fail nor signal the test
        // process; actual delivery is exercised end to end.
        let child = Command::new("true").spawn().unwrap();
        let child = ChildProcess::new(child);
        register(child.clone());
        register(child.clone());
        let _ = child.wait();
    }
}
