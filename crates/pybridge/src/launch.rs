use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt as _;
use std::process::{ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;

use anyhow::Context as _;

use crate::bundle::{CodeBundle, SourceModule, SourcePackage, Wiring};
use crate::error::Result;
use crate::pipe::{self, pipe, PipeReader, PipeWriter};
use crate::process::ChildProcess;
use crate::runtime::GuestRuntime;
use crate::signal;
use crate::status::StatusReader;

const PRIMARY_LOADER: &str = include_str!("../scripts/bootstrap.py");
const SECONDARY_LOADER: &str = include_str!("../scripts/secondary_loader.py");

const RUNTIME_INIT: &str = include_str!("../python/pybridge/__init__.py");
const RUNTIME_BUFFERPOOL: &str = include_str!("../python/pybridge/bufferpool.py");
const RUNTIME_MSGPACKQUEUE: &str = include_str!("../python/pybridge/msgpackqueue.py");

/// Placeholder the loader templates leave for their pipe number.
const FD_PLACEHOLDER: &str = "__PYBRIDGE_FD__";

/// Per-launch knobs beyond the runtime descriptor.
#[derive(Default)]
pub struct LaunchOptions {
    /// Extra environment entries overlaid after the runtime's own.
    pub env: std::collections::BTreeMap<String, String>,
    /// Arguments the guest program observes after the descriptor list.
    pub args: Vec<String>,
    /// Additional descriptors to inherit after the five runtime pipes.
    pub extra_files: Vec<OwnedFd>,
}

/// The runtime support package every bundle ships, so guest code can
/// `import pybridge`.
fn runtime_package() -> SourcePackage {
    SourcePackage::new(
        "pybridge",
        "python/pybridge",
        vec![
            SourceModule::from_source("__init__.py", "python/pybridge/__init__.py", RUNTIME_INIT),
            SourceModule::from_source(
                "bufferpool.py",
                "python/pybridge/bufferpool.py",
                RUNTIME_BUFFERPOOL,
            ),
            SourceModule::from_source(
                "msgpackqueue.py",
                "python/pybridge/msgpackqueue.py",
                RUNTIME_MSGPACKQUEUE,
            ),
        ],
    )
}

/// A launched guest: the child process, its standard streams, the two data
/// pipes, and the always-running status reader.
pub struct GuestProcess {
    child: ChildProcess,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    data_in: Option<PipeReader>,
    data_out: Option<PipeWriter>,
    status: StatusReader,
}

impl GuestProcess {
    pub fn child(&self) -> &ChildProcess {
        &self.child
    }

    pub fn status(&self) -> &StatusReader {
        &self.status
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// The guest→host data pipe. Each facade claims it exactly once.
    pub fn take_data_in(&mut self) -> Option<PipeReader> {
        self.data_in.take()
    }

    /// The host→guest data pipe.
    pub fn take_data_out(&mut self) -> Option<PipeWriter> {
        self.data_out.take()
    }

    pub fn wait(&self) -> Result<i32> {
        self.child.wait()
    }

    pub fn terminate(&self) -> Result<()> {
        self.child.terminate()
    }
}

impl Drop for GuestProcess {
    fn drop(&mut self) {
        // Teardown must never orphan a guest, whatever state the pipes are in.
        if self.child.is_running() {
            tracing::warn!(pid = self.child.pid(), "guest still running at teardown, terminating");
            let _ = self.child.terminate();
        }
    }
}

impl GuestRuntime {
    /// Launches the guest with the full two-stage bootstrap and returns the
    /// wired process. This is the primitive under every facade.
    pub fn spawn_program(&self, bundle: CodeBundle, options: LaunchOptions) -> Result<GuestProcess> {
        launch(self, bundle, options)
    }
}

fn launch(
    runtime: &GuestRuntime,
    mut bundle: CodeBundle,
    options: LaunchOptions,
) -> Result<GuestProcess> {
    bundle.packages.insert(0, runtime_package());

    // One-shot bootstrap pipes and the three runtime pipes.
    let (bootstrap_r, mut bootstrap_w) = pipe()?;
    let (program_r, mut program_w) = pipe()?;
    let (data_in_r, data_in_w) = pipe()?;
    let (data_out_r, data_out_w) = pipe()?;
    let (status_r, status_w) = pipe()?;

    // Inheritance order fixes the child-side numbering: the three runtime
    // pipes land on 3/4/5, the loader pipes on 6/7, extras after that.
    let mut inherited: Vec<RawFd> = vec![
        data_in_w.as_raw_fd(),
        data_out_r.as_raw_fd(),
        status_w.as_raw_fd(),
        bootstrap_r.as_raw_fd(),
        program_r.as_raw_fd(),
    ];
    inherited.extend(options.extra_files.iter().map(|fd| fd.as_raw_fd()));

    bundle.wiring = Wiring {
        pipe_out: pipe::child_fd(0),
        pipe_in: pipe::child_fd(1),
        status: pipe::child_fd(2),
    };
    let bootstrap_fd = pipe::child_fd(3);
    let program_fd = pipe::child_fd(4);

    // Descriptors listed on the command line so the loader can strip them
    // from the guest's argv: the loader pipes plus any extras.
    let argv_fds: Vec<i32> = std::iter::once(bootstrap_fd)
        .chain(std::iter::once(program_fd))
        .chain((0..options.extra_files.len()).map(|i| pipe::child_fd(5 + i)))
        .collect();

    let primary = PRIMARY_LOADER.replace(FD_PLACEHOLDER, &bootstrap_fd.to_string());
    let secondary = SECONDARY_LOADER.replace(FD_PLACEHOLDER, &program_fd.to_string());

    let program_data = serde_json::to_vec(&bundle)
        .with_context(|| format!("serialize code bundle {:?}", bundle.name))?;

    let mut command = Command::new(&runtime.python);
    command.arg("-u").arg("-c").arg(&primary);
    command.arg(argv_fds.len().to_string());
    for fd in &argv_fds {
        command.arg(fd.to_string());
    }
    command.args(&options.args);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    for (key, value) in runtime.env.iter().chain(options.env.iter()) {
        command.env(key, value);
    }

    let mut scratch: Vec<RawFd> = Vec::with_capacity(inherited.len());
    let sources = inherited;
    unsafe {
        command.pre_exec(move || pipe::map_inherited_fds(&sources, &mut scratch));
    }

    let mut spawned = command
        .spawn()
        .with_context(|| format!("spawn guest interpreter {}", runtime.python.display()))?;

    let stdin = spawned.stdin.take();
    let stdout = spawned.stdout.take();
    let stderr = spawned.stderr.take();
    let child = ChildProcess::new(spawned);
    tracing::debug!(pid = child.pid(), name = %bundle.name, "guest spawned");

    // Child-side ends are duplicated into the guest; the parent's copies
    // close now so guest-side EOF semantics work.
    drop(data_in_w);
    drop(data_out_r);
    drop(status_w);
    drop(bootstrap_r);
    drop(program_r);
    drop(options.extra_files);

    // Writer tasks close their pipe when done; the stage-two loader reads
    // to EOF, so close-after-write is what un-blocks it.
    spawn_writer("pybridge-bootstrap-writer", move || {
        bootstrap_w.write_all(secondary.as_bytes())
    });
    spawn_writer("pybridge-program-writer", move || {
        program_w.write_all(&program_data)
    });

    let status = StatusReader::spawn(status_r);
    signal::register(child.clone());

    Ok(GuestProcess {
        child,
        stdin,
        stdout,
        stderr,
        data_in: Some(data_in_r),
        data_out: Some(data_out_w),
        status,
    })
}

fn spawn_writer(name: &str, write: impl FnOnce() -> std::io::Result<()> + Send + 'static) {
    let thread_name = name.to_string();
    let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
        if let Err(err) = write() {
            // The guest sees EOF early and treats the bootstrap as failed;
            // nothing to do on this side but record it.
            tracing::warn!(task = %thread_name, error = %err, "bootstrap write failed");
        }
    });
    if let Err(err) = spawned {
        tracing::error!(task = name, error = %err, "failed to start bootstrap writer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_package_carries_the_queue_module() {
        let package = runtime_package();
        assert_eq!(package.name, "pybridge");
        let names: Vec<_> = package.modules.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"__init__.py"));
        assert!(names.contains(&"msgpackqueue.py"));
        for module in &package.modules {
            assert!(!module.decode_source().unwrap().is_empty());
        }
    }

    #[test]
    fn loader_templates_render_their_pipe_number() {
        let rendered = PRIMARY_LOADER.replace(FD_PLACEHOLDER, "6");
        assert!(rendered.contains("= 6"));
        assert!(!rendered.contains(FD_PLACEHOLDER));

        let rendered = SECONDARY_LOADER.replace(FD_PLACEHOLDER, "7");
        assert!(rendered.contains("= 7"));
        assert!(!rendered.contains(FD_PLACEHOLDER));
    }

    #[test]
    fn wiring_follows_the_inheritance_order() {
        // data_in_writer, data_out_reader, status_writer land on 3/4/5.
        assert_eq!(pipe::child_fd(0), 3);
        assert_eq!(pipe::child_fd(1), 4);
        assert_eq!(pipe::child_fd(2), 5);
        assert_eq!(pipe::child_fd(3), 6);
        assert_eq!(pipe::child_fd(4), 7);
    }
}
