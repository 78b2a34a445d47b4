use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError};

use crate::bundle::{CodeBundle, SourceModule, SourcePackage};
use crate::error::{map_pipe_err, BridgeError, Result};
use crate::exception::GuestException;
use crate::launch::{GuestProcess, LaunchOptions};
use crate::pipe::{PipeReader, PipeWriter};
use crate::runtime::GuestRuntime;
use crate::status::StatusEvent;

const REPL_SCRIPT: &str = include_str!("../scripts/repl.py");

/// Marks the end of each interactive output burst. Unprintable control
/// bytes, so line-oriented guest output can never contain the prefix.
pub const SENTINEL: &[u8] = b"\x01\x02\x03\n";
/// Variant for guests that emit CRLF line endings.
pub const SENTINEL_CRLF: &[u8] = b"\x01\x02\x03\r\n";

const MODE_PREFIX: &str = "__CAPTURE_COMBINED__ =";

/// One completed submission: everything the guest printed, plus the
/// exception it raised, if any.
#[derive(Debug)]
pub struct ReplOutput {
    pub output: String,
    pub exception: Option<GuestException>,
}

/// Stateful interactive channel. Submissions are serialized by an internal
/// mutex; interpreter state persists between them.
///
/// A deadline miss in `execute_with_timeout` terminates the guest and
/// poisons the channel: there is no reliable way to interrupt arbitrary
/// guest code short of killing the process.
pub struct ReplChannel {
    state: Mutex<ReplState>,
    exceptions: Receiver<GuestException>,
    statuses: Receiver<StatusEvent>,
    guest: GuestProcess,
}

struct ReplState {
    writer: PipeWriter,
    reader: Option<BufReader<PipeReader>>,
    combined: bool,
    closed: bool,
}

impl GuestRuntime {
    /// Launches an interactive guest. `kv_pairs` surface to guest code, and
    /// extra modules and packages become importable.
    pub fn spawn_repl(
        &self,
        kv_pairs: std::collections::BTreeMap<String, serde_json::Value>,
        modules: Vec<SourceModule>,
        packages: Vec<SourcePackage>,
        options: LaunchOptions,
    ) -> Result<ReplChannel> {
        let cwd = std::env::current_dir()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        let mut bundle = CodeBundle::new(
            "pybridge-repl",
            &cwd,
            SourceModule::from_source("__main__", &format!("{cwd}/modules/repl.py"), REPL_SCRIPT),
        );
        bundle.modules = modules;
        bundle.packages = packages;
        bundle.kv_pairs = kv_pairs;

        let guest = self.spawn_program(bundle, options)?;
        ReplChannel::new(guest)
    }
}

impl ReplChannel {
    pub(crate) fn new(mut guest: GuestProcess) -> Result<Self> {
        let reader = guest
            .take_data_in()
            .ok_or_else(|| anyhow::anyhow!("guest data pipes already claimed"))?;
        let writer = guest
            .take_data_out()
            .ok_or_else(|| anyhow::anyhow!("guest data pipes already claimed"))?;
        let exceptions = guest.status().exceptions().clone();
        let statuses = guest.status().statuses().clone();
        Ok(Self {
            state: Mutex::new(ReplState {
                writer,
                reader: Some(BufReader::new(reader)),
                // The guest starts with stdout and stderr merged.
                combined: true,
                closed: false,
            }),
            exceptions,
            statuses,
            guest,
        })
    }

    /// Runs `code` in the guest and returns its output once the sentinel
    /// arrives. `combined` selects whether stderr is merged into the output.
    pub fn execute(&self, code: &str, combined: bool) -> Result<ReplOutput> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BridgeError::ChannelClosed);
        }

        self.submit(&mut state, code, combined)?;

        // The guest reports completion or an exception on the status pipe
        // before it seals the output burst.
        let exception = self.wait_event()?;

        let reader = state.reader.as_mut().ok_or(BridgeError::ChannelClosed)?;
        let output = read_until_sentinel(reader)?;
        Ok(ReplOutput { output, exception })
    }

    /// `execute` with a wall-clock deadline. On expiry the guest is
    /// terminated and the channel transitions to closed for good.
    pub fn execute_with_timeout(
        &self,
        code: &str,
        combined: bool,
        timeout: Duration,
    ) -> Result<ReplOutput> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BridgeError::ChannelClosed);
        }
        let deadline = Instant::now() + timeout;

        self.submit(&mut state, code, combined)?;

        let exception = match self.wait_event_until(deadline) {
            Ok(exception) => exception,
            Err(BridgeError::Timeout(_)) => return self.kill_on_deadline(&mut state),
            Err(err) => return Err(err),
        };

        // Race the sentinel read against what is left of the deadline.
        let mut reader = state.reader.take().ok_or(BridgeError::ChannelClosed)?;
        let (tx, rx) = bounded(1);
        let spawned = std::thread::Builder::new()
            .name("pybridge-repl-read".to_string())
            .spawn(move || {
                let result = read_until_sentinel(&mut reader);
                let _ = tx.send((result, reader));
            });
        if let Err(err) = spawned {
            return Err(anyhow::anyhow!("failed to start repl read task: {err}").into());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((result, reader)) => {
                state.reader = Some(reader);
                result.map(|output| ReplOutput { output, exception })
            }
            Err(RecvTimeoutError::Timeout) => self.kill_on_deadline(&mut state),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::PipeClosed),
        }
    }

    /// Terminates the guest and releases resources. The channel cannot be
    /// reused afterwards.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BridgeError::ChannelClosed);
        }
        state.closed = true;
        self.guest.child().terminate()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn kill_on_deadline(&self, state: &mut ReplState) -> Result<ReplOutput> {
        state.closed = true;
        let _ = self.guest.child().terminate();
        Err(BridgeError::Timeout(
            "interactive execution exceeded its deadline; guest terminated".to_string(),
        ))
    }

    fn submit(&self, state: &mut ReplState, code: &str, combined: bool) -> Result<()> {
        // The mode switch shares the output channel with the code payload;
        // writing both under the channel mutex keeps them ordered.
        if state.combined != combined {
            let toggle = format!("{MODE_PREFIX} {}", if combined { "True" } else { "False" });
            state
                .writer
                .write_all(toggle.as_bytes())
                .map_err(map_pipe_err)?;
            state.writer.write_all(SENTINEL).map_err(map_pipe_err)?;
            state.combined = combined;
        }

        let code = normalize_code(code);
        state
            .writer
            .write_all(code.as_bytes())
            .map_err(map_pipe_err)?;
        state.writer.write_all(SENTINEL).map_err(map_pipe_err)?;
        state.writer.flush().map_err(map_pipe_err)?;
        Ok(())
    }

    fn wait_event(&self) -> Result<Option<GuestException>> {
        let exceptions = &self.exceptions;
        let statuses = &self.statuses;
        select! {
            recv(exceptions) -> message => match message {
                Ok(exception) => Ok(Some(exception)),
                Err(_) => statuses
                    .recv()
                    .map(|_| None)
                    .map_err(|_| BridgeError::PipeClosed),
            },
            recv(statuses) -> message => match message {
                Ok(_) => Ok(None),
                Err(_) => exceptions
                    .recv()
                    .map(Some)
                    .map_err(|_| BridgeError::PipeClosed),
            },
        }
    }

    fn wait_event_until(&self, deadline: Instant) -> Result<Option<GuestException>> {
        let timeout =
            || BridgeError::Timeout("waiting for guest completion status".to_string());
        let exceptions = &self.exceptions;
        let statuses = &self.statuses;
        select! {
            recv(exceptions) -> message => match message {
                Ok(exception) => Ok(Some(exception)),
                Err(_) => statuses
                    .recv_deadline(deadline)
                    .map(|_| None)
                    .map_err(|_| timeout()),
            },
            recv(statuses) -> message => match message {
                Ok(_) => Ok(None),
                Err(_) => exceptions
                    .recv_deadline(deadline)
                    .map(Some)
                    .map_err(|_| timeout()),
            },
            default(deadline.saturating_duration_since(Instant::now())) => Err(timeout()),
        }
    }
}

/// CRLF becomes LF, blank lines collapse, trailing whitespace goes.
pub(crate) fn normalize_code(code: &str) -> String {
    let code = code.replace("\r\n", "\n").replace("\n\n", "\n");
    code.trim_end_matches([' ', '\t', '\n', '\r']).to_string()
}

fn read_until_sentinel(reader: &mut BufReader<PipeReader>) -> Result<String> {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut buffer).map_err(map_pipe_err)?;
        if read == 0 {
            return Err(BridgeError::PipeClosed);
        }
        if let Some(stripped) = strip_sentinel(&buffer) {
            return Ok(String::from_utf8_lossy(stripped).into_owned());
        }
    }
}

/// Strips the trailing sentinel (either line-ending variant) and any
/// trailing newline bytes; `None` while the burst is incomplete.
pub(crate) fn strip_sentinel(buffer: &[u8]) -> Option<&[u8]> {
    let body = if buffer.ends_with(SENTINEL_CRLF) {
        &buffer[..buffer.len() - SENTINEL_CRLF.len()]
    } else if buffer.ends_with(SENTINEL) {
        &buffer[..buffer.len() - SENTINEL.len()]
    } else {
        return None;
    };
    let trimmed_len = body
        .iter()
        .rposition(|byte| *byte != b'\n' && *byte != b'\r')
        .map_or(0, |index| index + 1);
    Some(&body[..trimmed_len])
}
