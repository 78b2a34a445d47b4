use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::bundle::{CodeBundle, SourceModule};
use crate::error::{map_pipe_err, BridgeError, Result};
use crate::launch::{GuestProcess, LaunchOptions};
use crate::pipe::{PipeReader, PipeWriter};
use crate::runtime::GuestRuntime;

const EXEC_SCRIPT: &str = include_str!("../scripts/exec_main.py");

#[derive(Serialize)]
struct ExecRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct ExecResponse {
    #[serde(rename = "type")]
    kind: String,
    output: String,
}

/// Simple line-JSON execution facade: each `exec` sends one request and
/// reads one response. State persists in the guest between requests, but
/// there is no bidirectional dispatch; use the queue channel for that.
pub struct ExecChannel {
    state: Mutex<ExecState>,
    guest: GuestProcess,
}

struct ExecState {
    writer: PipeWriter,
    reader: BufReader<PipeReader>,
    closed: bool,
}

impl GuestRuntime {
    pub fn spawn_exec(&self, options: LaunchOptions) -> Result<ExecChannel> {
        let cwd = std::env::current_dir()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|_| ".".to_string());
        let bundle = CodeBundle::new(
            "pybridge-exec",
            &cwd,
            SourceModule::from_source("__main__", &format!("{cwd}/modules/main.py"), EXEC_SCRIPT),
        );
        let guest = self.spawn_program(bundle, options)?;
        ExecChannel::new(guest)
    }
}

impl ExecChannel {
    pub(crate) fn new(mut guest: GuestProcess) -> Result<Self> {
        let reader = guest
            .take_data_in()
            .ok_or_else(|| anyhow::anyhow!("guest data pipes already claimed"))?;
        let writer = guest
            .take_data_out()
            .ok_or_else(|| anyhow::anyhow!("guest data pipes already claimed"))?;
        Ok(Self {
            state: Mutex::new(ExecState {
                writer,
                reader: BufReader::new(reader),
                closed: false,
            }),
            guest,
        })
    }

    /// Executes `code` in the guest and returns its output. A guest
    /// exception surfaces as `BridgeError::Guest` carrying the traceback.
    pub fn exec(&self, code: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(BridgeError::ChannelClosed);
        }

        send_request(&mut state.writer, "exec", code)?;

        let mut line = String::new();
        let read = state.reader.read_line(&mut line).map_err(map_pipe_err)?;
        if read == 0 {
            return Err(BridgeError::PipeClosed);
        }
        let response: ExecResponse = serde_json::from_str(&line)
            .map_err(|err| BridgeError::Framing(format!("malformed exec response: {err}")))?;
        if response.kind == "error" {
            return Err(BridgeError::Guest(response.output));
        }
        Ok(response.output)
    }

    /// Asks the guest loop to exit, then runs the usual graceful-then-forced
    /// termination as a backstop.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Err(err) = send_request(&mut state.writer, "exit", "") {
            tracing::debug!(error = %err, "exit request not delivered");
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        self.guest.terminate()
    }
}

fn send_request(writer: &mut PipeWriter, kind: &str, code: &str) -> Result<()> {
    let mut line = serde_json::to_vec(&ExecRequest { kind, code })
        .map_err(|err| BridgeError::Framing(format!("encode exec request: {err}")))?;
    line.push(b'\n');
    writer.write_all(&line).map_err(map_pipe_err)?;
    writer.flush().map_err(map_pipe_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_encode_as_single_json_lines() {
        let encoded = serde_json::to_string(&ExecRequest {
            kind: "exec",
            code: "print('x')\nprint('y')",
        })
        .unwrap();
        assert!(!encoded.contains('\n'));
        let round: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(round["type"], "exec");
        assert_eq!(round["code"], "print('x')\nprint('y')");
    }

    #[test]
    fn error_responses_decode() {
        let response: ExecResponse =
            serde_json::from_str(r#"{"type":"error","output":"Traceback..."}"#).unwrap();
        assert_eq!(response.kind, "error");
        assert_eq!(response.output, "Traceback...");
    }
}
