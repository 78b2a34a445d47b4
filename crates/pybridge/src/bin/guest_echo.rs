//! Protocol-faithful mock guest for the integration tests.
//!
//! Accepts the launcher's full command-line contract (`-u -c <loader>
//! <fd count> <fd...> <args...>`), drains the bootstrap pipe, decodes the
//! program bundle from the program pipe, and then serves whichever channel
//! the bundle's entrypoint selects: the MessagePack queue, the sentinel
//! REPL (with a toy integer interpreter), or the line-JSON exec loop.
//! No Python installation is needed to exercise the host end to end.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::fd::FromRawFd;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rmpv::Value;

const SENTINEL: &[u8] = b"\x01\x02\x03\n";

fn main() {
    if let Err(err) = run() {
        eprintln!("pybridge-guest-echo: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let c_index = args
        .iter()
        .position(|arg| arg == "-c")
        .context("missing -c flag")?;
    let mut rest = args[c_index + 2..].iter();
    let count: usize = rest
        .next()
        .context("missing descriptor count")?
        .parse()
        .context("descriptor count is not a number")?;
    let mut fds = Vec::with_capacity(count);
    for _ in 0..count {
        let fd: i32 = rest
            .next()
            .context("descriptor list shorter than its count")?
            .parse()?;
        fds.push(fd);
    }
    if fds.len() < 2 {
        bail!("expected at least the bootstrap and program descriptors");
    }

    // Stage one would read the stage-two loader to EOF; do the same so the
    // host's close-after-write contract is exercised.
    let mut bootstrap = unsafe { File::from_raw_fd(fds[0]) };
    let mut stage_two = String::new();
    bootstrap.read_to_string(&mut stage_two)?;

    let mut program = unsafe { File::from_raw_fd(fds[1]) };
    let mut bundle_json = Vec::new();
    program.read_to_end(&mut bundle_json)?;
    let bundle: serde_json::Value =
        serde_json::from_slice(&bundle_json).context("undecodable program bundle")?;

    let wiring = &bundle["wiring"];
    let fd_of = |name: &str| -> Result<i32> {
        Ok(wiring[name]
            .as_i64()
            .with_context(|| format!("wiring lacks {name}"))? as i32)
    };
    let data_out = unsafe { File::from_raw_fd(fd_of("pipe_out")?) };
    let data_in = unsafe { File::from_raw_fd(fd_of("pipe_in")?) };
    let status = unsafe { File::from_raw_fd(fd_of("status")?) };

    spawn_watchdog();

    let entry_path = bundle["entrypoint"]["path"].as_str().unwrap_or_default();
    if entry_path.ends_with("modules/repl.py") {
        repl_loop(data_in, data_out, status)
    } else if entry_path.ends_with("modules/main.py") {
        exec_loop(data_in, data_out)
    } else {
        queue_loop(data_in, data_out, status)
    }
}

fn spawn_watchdog() {
    thread::spawn(|| loop {
        // Re-parented to init means the host died without cleanup.
        if unsafe { libc::getppid() } == 1 {
            std::process::exit(1);
        }
        thread::sleep(Duration::from_secs(2));
    });
}

fn send_status_line(status: &Mutex<File>, record: &serde_json::Value) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut status = status.lock().unwrap();
    status.write_all(&line)?;
    Ok(())
}

fn send_status(status: &Mutex<File>, message: &str) -> Result<()> {
    send_status_line(
        status,
        &serde_json::json!({"type": "status", "status": message}),
    )
}

// ---------------------------------------------------------------------------
// Queue mode
// ---------------------------------------------------------------------------

struct QueueServer {
    writer: Mutex<File>,
    status: Mutex<File>,
    pending: Mutex<HashMap<String, mpsc::Sender<Value>>>,
    next_id: Mutex<u64>,
}

impl QueueServer {
    fn send_frame(&self, value: &Value) -> Result<()> {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, value)?;
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.write_all(&payload)?;
        Ok(())
    }

    fn respond(&self, request_id: &str, outcome: std::result::Result<Value, String>) {
        let mut response = Vec::with_capacity(2);
        match outcome {
            Ok(result) => response.push((Value::from("result"), result)),
            Err(error) => response.push((Value::from("error"), Value::from(error))),
        }
        response.push((Value::from("request_id"), Value::from(request_id)));
        if let Err(err) = self.send_frame(&Value::Map(response)) {
            eprintln!("pybridge-guest-echo: response write failed: {err}");
        }
    }

    /// Invoke a host-side handler and wait for its response.
    fn call_host(&self, command: &str, data: Value) -> std::result::Result<Value, String> {
        let request_id = {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("py-{}", *next)
        };
        let (tx, rx) = mpsc::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);
        let request = Value::Map(vec![
            (Value::from("command"), Value::from(command)),
            (Value::from("data"), data),
            (Value::from("request_id"), Value::from(request_id.as_str())),
        ]);
        self.send_frame(&request).map_err(|err| err.to_string())?;
        let response = rx
            .recv_timeout(Duration::from_secs(30))
            .map_err(|_| "host response never arrived".to_string())?;
        let entries = response
            .as_map()
            .ok_or_else(|| "host response is not a map".to_string())?;
        for (key, value) in entries {
            if key.as_str() == Some("error") {
                return Err(value.as_str().unwrap_or("unknown").to_string());
            }
        }
        for (key, value) in entries {
            if key.as_str() == Some("result") {
                return Ok(value.clone());
            }
        }
        Ok(Value::Nil)
    }
}

fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = reader.read(&mut header[filled..])?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            bail!("unexpected EOF inside frame header");
        }
        filled += read;
    }
    let len = u32::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn field(value: &Value, name: &str) -> Option<Value> {
    value.as_map().and_then(|entries| {
        entries
            .iter()
            .find(|(key, _)| key.as_str() == Some(name))
            .map(|(_, value)| value.clone())
    })
}

fn queue_loop(data_in: File, data_out: File, status: File) -> Result<()> {
    let server = Arc::new(QueueServer {
        writer: Mutex::new(data_out),
        status: Mutex::new(status),
        pending: Mutex::new(HashMap::new()),
        next_id: Mutex::new(0),
    });
    send_status(&server.status, "ready")?;

    let mut reader = BufReader::new(data_in);
    while let Some(frame) = read_frame(&mut reader)? {
        let message = match rmpv::decode::read_value(&mut &frame[..]) {
            Ok(message) => message,
            Err(err) => {
                eprintln!("pybridge-guest-echo: undecodable frame: {err}");
                continue;
            }
        };

        let request_id = field(&message, "request_id")
            .and_then(|id| id.as_str().map(str::to_string))
            .unwrap_or_default();
        if request_id.starts_with("py-") {
            if let Some(tx) = server.pending.lock().unwrap().remove(&request_id) {
                let _ = tx.send(message);
            }
            continue;
        }

        let Some(command) = field(&message, "command").and_then(|c| c.as_str().map(str::to_string))
        else {
            eprintln!("pybridge-guest-echo: frame without command");
            continue;
        };
        let data = field(&message, "data").unwrap_or(Value::Nil);

        let server = Arc::clone(&server);
        thread::spawn(move || handle_command(&server, &command, data, &request_id));
    }

    send_status(&server.status, "exit")?;
    Ok(())
}

fn handle_command(server: &QueueServer, command: &str, data: Value, request_id: &str) {
    match command {
        "echo" => server.respond(request_id, Ok(data)),
        "add" => {
            let outcome = match data.as_array().map(Vec::as_slice) {
                Some([a, b]) => match (a.as_i64(), b.as_i64()) {
                    (Some(a), Some(b)) => Ok(Value::from(a + b)),
                    _ => Err("add expects two integers".to_string()),
                },
                _ => Err("add expects two arguments".to_string()),
            };
            server.respond(request_id, outcome);
        }
        "sleep" => {
            let seconds = data
                .as_array()
                .and_then(|args| args.first().and_then(|v| v.as_u64()))
                .or_else(|| data.as_u64())
                .unwrap_or(0);
            thread::sleep(Duration::from_secs(seconds));
            server.respond(request_id, Ok(Value::Nil));
        }
        "invoke_host" => {
            let target = field(&data, "command")
                .and_then(|c| c.as_str().map(str::to_string))
                .unwrap_or_default();
            let payload = field(&data, "data").unwrap_or(Value::Nil);
            let outcome = server.call_host(&target, payload);
            server.respond(request_id, outcome);
        }
        "raise_chained" => {
            let record = serde_json::json!({
                "type": "exception",
                "exception": "DatabaseError",
                "message": "query failed",
                "traceback": "Traceback (most recent call last):\n  DatabaseError: query failed\n",
                "cause": {
                    "exception": "ConnectionError",
                    "message": "connection refused",
                    "traceback": "Traceback (most recent call last):\n  ConnectionError: connection refused\n",
                },
            });
            let _ = send_status_line(&server.status, &record);
            server.respond(
                request_id,
                Err("DatabaseError: query failed".to_string()),
            );
        }
        "__get_methods__" => {
            let methods = serde_json::json!({
                "methods": {
                    "echo": {
                        "parameters": [{"name": "x", "required": true}],
                        "doc": "Return the argument unchanged.",
                    },
                    "add": {
                        "parameters": [
                            {"name": "a", "required": true, "type": "int"},
                            {"name": "b", "required": true, "type": "int"},
                        ],
                        "doc": "Add two integers.",
                    },
                    "sleep": {
                        "parameters": [{"name": "seconds", "required": true}],
                        "doc": "Sleep before answering.",
                    },
                },
            });
            server.respond(request_id, Ok(json_to_msgpack(&methods)));
        }
        "shutdown" => {
            server.respond(request_id, Ok(Value::from("ok")));
            let _ = send_status(&server.status, "exit");
            std::process::exit(0);
        }
        "exit" => {
            std::process::exit(0);
        }
        other => {
            server.respond(request_id, Err(format!("unknown command: {other}")));
        }
    }
}

fn json_to_msgpack(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(json_to_msgpack).collect())
        }
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, value)| (Value::from(key.as_str()), json_to_msgpack(value)))
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// REPL mode: a toy integer interpreter, enough to prove state persistence
// and the sentinel protocol.
// ---------------------------------------------------------------------------

fn repl_loop(data_in: File, mut data_out: File, status: File) -> Result<()> {
    let status = Mutex::new(status);
    let mut reader = BufReader::new(data_in);
    let mut variables: HashMap<String, i64> = HashMap::new();
    let mut _combined = true;

    loop {
        let Some(chunk) = read_chunk(&mut reader)? else {
            break;
        };
        let text = String::from_utf8_lossy(&chunk).into_owned();

        if text.starts_with("__CAPTURE_COMBINED__ =") {
            _combined = text.trim_end().ends_with("True");
            continue;
        }
        if text.contains("while True") {
            // Busy guest: never completes, never writes a status.
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }

        let mut output = String::new();
        let mut exception: Option<(String, String)> = None;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("raise ") {
                let kind = rest.split('(').next().unwrap_or("Exception").trim();
                exception = Some((kind.to_string(), rest.to_string()));
                break;
            }
            if let Some(inner) = line
                .strip_prefix("print(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                match eval(inner, &variables) {
                    Ok(result) => output.push_str(&format!("{result}\n")),
                    Err(message) => {
                        exception = Some(("NameError".to_string(), message));
                        break;
                    }
                }
                continue;
            }
            if let Some((name, expr)) = line.split_once('=') {
                if let Ok(value) = eval_int(expr.trim(), &variables) {
                    variables.insert(name.trim().to_string(), value);
                }
                continue;
            }
        }

        match &exception {
            Some((kind, message)) => {
                let record = serde_json::json!({
                    "type": "exception",
                    "exception": kind,
                    "message": message,
                    "traceback": format!("Traceback (most recent call last):\n  {kind}: {message}\n"),
                });
                send_status_line(&status, &record)?;
            }
            None => send_status(&status, "ok")?,
        }

        data_out.write_all(output.as_bytes())?;
        data_out.write_all(SENTINEL)?;
    }
    Ok(())
}

fn read_chunk(reader: &mut impl BufRead) -> Result<Option<Vec<u8>>> {
    let mut data = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut data)?;
        if read == 0 {
            return Ok(None);
        }
        if data.ends_with(SENTINEL) {
            data.truncate(data.len() - SENTINEL.len());
            return Ok(Some(data));
        }
    }
}

/// Evaluates string literals, integer expressions, and variables.
fn eval(expr: &str, variables: &HashMap<String, i64>) -> std::result::Result<String, String> {
    let expr = expr.trim();
    if (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
        || (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
    {
        return Ok(expr[1..expr.len() - 1].to_string());
    }
    eval_int(expr, variables).map(|value| value.to_string())
}

/// Sums of integer literals and known variables, e.g. `x + 1`.
fn eval_int(expr: &str, variables: &HashMap<String, i64>) -> std::result::Result<i64, String> {
    let mut total = 0i64;
    for term in expr.split('+') {
        let term = term.trim();
        if let Ok(value) = term.parse::<i64>() {
            total += value;
        } else if let Some(value) = variables.get(term) {
            total += value;
        } else {
            return Err(format!("name '{term}' is not defined"));
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Exec mode
// ---------------------------------------------------------------------------

fn exec_loop(data_in: File, mut data_out: File) -> Result<()> {
    let reader = BufReader::new(data_in);
    let variables: HashMap<String, i64> = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let request: serde_json::Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                eprintln!("pybridge-guest-echo: undecodable exec request: {err}");
                continue;
            }
        };
        if request["type"] == "exit" {
            break;
        }
        let code = request["code"].as_str().unwrap_or_default();

        let response = if let Some(inner) = code
            .trim()
            .strip_prefix("print(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            match eval(inner, &variables) {
                Ok(output) => serde_json::json!({"type": "output", "output": output}),
                Err(message) => serde_json::json!({
                    "type": "error",
                    "output": format!("NameError: {message}"),
                }),
            }
        } else if code.trim_start().starts_with("raise ") {
            serde_json::json!({
                "type": "error",
                "output": "Traceback (most recent call last):\n  Exception\n",
            })
        } else {
            serde_json::json!({"type": "output", "output": ""})
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        data_out.write_all(&out)?;
    }
    Ok(())
}
