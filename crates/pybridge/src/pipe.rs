use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// First descriptor number an inherited resource lands on in the child;
/// 0..=2 are the standard streams.
pub(crate) const FIRST_INHERITED_FD: RawFd = 3;

/// Read end of an anonymous pipe. Close-on-exec in the parent; made
/// inheritable per-child by the launcher's descriptor mapping.
pub struct PipeReader(File);

/// Write end of an anonymous pipe.
pub struct PipeWriter(File);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Creates a pipe pair with close-on-exec set on both ends.
pub fn pipe() -> io::Result<(PipeReader, PipeWriter)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    unsafe {
        Ok((
            PipeReader(File::from_raw_fd(fds[0])),
            PipeWriter(File::from_raw_fd(fds[1])),
        ))
    }
}

/// Maps `sources` onto consecutive child descriptors starting at
/// `FIRST_INHERITED_FD`. Runs between fork and exec, so only
/// async-signal-safe calls are allowed and `scratch` must already have the
/// needed capacity.
///
/// Two passes: every source is first duplicated above the target range so a
/// dup2 onto an early target can never clobber a later source, then each
/// duplicate is dup2'ed onto its target (which clears close-on-exec).
pub(crate) fn map_inherited_fds(sources: &[RawFd], scratch: &mut Vec<RawFd>) -> io::Result<()> {
    let above = FIRST_INHERITED_FD + sources.len() as RawFd;

    scratch.clear();
    for &fd in sources {
        let tmp = unsafe { libc::fcntl(fd, libc::F_DUPFD, above) };
        if tmp < 0 {
            return Err(io::Error::last_os_error());
        }
        scratch.push(tmp);
    }

    for (index, &tmp) in scratch.iter().enumerate() {
        let target = FIRST_INHERITED_FD + index as RawFd;
        if unsafe { libc::dup2(tmp, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    for &tmp in scratch.iter() {
        unsafe {
            libc::close(tmp);
        }
    }
    Ok(())
}

/// Child-side descriptor number for the `index`-th inherited resource.
pub(crate) fn child_fd(index: usize) -> i32 {
    FIRST_INHERITED_FD + index as i32
}
