use std::collections::{BTreeMap, HashMap};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::bundle::CodeBundle;
use crate::error::{BridgeError, Result};
use crate::exception::GuestException;
use crate::launch::{GuestProcess, LaunchOptions};
use crate::runtime::GuestRuntime;
use crate::service::ServiceBinder;
use crate::status::StatusEvent;
use crate::transport::{FrameReader, FrameWriter, FramedTransport, MsgpackSerializer, Serializer};

/// Request ids minted by the host.
pub const HOST_ID_PREFIX: &str = "req-";
/// Request ids minted by the guest; disjoint by protocol contract.
pub const GUEST_ID_PREFIX: &str = "py-";

const INTROSPECTION_COMMAND: &str = "__get_methods__";
const CLOSE_FLUSH_DELAY: Duration = Duration::from_millis(50);

/// Handles a guest-originated command: receives the decoded `data` and the
/// request id, returns the result to encode or an error to relay.
pub type CommandHandler = Arc<dyn Fn(Value, &str) -> Result<Value> + Send + Sync>;

/// Metadata for one guest-exposed method, learned via introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    #[serde(default)]
    pub parameters: Vec<ParameterInfo>,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub return_info: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub doc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub required: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    command: &'a str,
    data: &'a Value,
    request_id: &'a str,
}

/// Bidirectional RPC channel over the framed transport.
///
/// `call` is safe from many threads at once: request ids and single-shot
/// pending slots keep responses correlated. Guest-originated commands are
/// dispatched to registered handlers on short-lived worker threads that run
/// concurrently with outbound calls.
pub struct QueueChannel {
    shared: Arc<QueueShared>,
    guest: GuestProcess,
}

struct QueueShared {
    writer: Mutex<FrameWriter>,
    serializer: MsgpackSerializer,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    inflight: Inflight,
    child: crate::process::ChildProcess,
}

#[derive(Default)]
struct QueueState {
    running: bool,
    pending: HashMap<String, crossbeam_channel::Sender<Value>>,
    handlers: HashMap<String, CommandHandler>,
    default_handler: Option<CommandHandler>,
    methods: BTreeMap<String, MethodInfo>,
}

/// Counts in-flight handler workers so shutdown can drain them.
#[derive(Default)]
struct Inflight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Inflight {
    fn enter(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn exit(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }
}

/// Decrements the in-flight gauge even if the worker unwinds.
struct InflightGuard<'a>(&'a Inflight);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.exit();
    }
}

impl GuestRuntime {
    /// Launches the guest and starts the RPC channel over its data pipes.
    /// Host-side services are registered before the first frame can arrive.
    pub fn spawn_queue(
        &self,
        bundle: CodeBundle,
        service: Option<ServiceBinder>,
        options: LaunchOptions,
    ) -> Result<QueueChannel> {
        let guest = self.spawn_program(bundle, options)?;
        QueueChannel::start(guest, service)
    }
}

impl QueueChannel {
    pub fn start(mut guest: GuestProcess, service: Option<ServiceBinder>) -> Result<Self> {
        let data_in = guest
            .take_data_in()
            .ok_or_else(|| anyhow::anyhow!("guest data pipes already claimed"))?;
        let data_out = guest
            .take_data_out()
            .ok_or_else(|| anyhow::anyhow!("guest data pipes already claimed"))?;

        forward_stream("pybridge-stdout", guest.take_stdout(), io::stdout);
        forward_stream("pybridge-stderr", guest.take_stderr(), io::stderr);

        let (reader, writer) = FramedTransport::new(data_in, data_out).split();

        let shared = Arc::new(QueueShared {
            writer: Mutex::new(writer),
            serializer: MsgpackSerializer,
            state: Mutex::new(QueueState {
                running: true,
                ..Default::default()
            }),
            next_id: AtomicU64::new(1),
            inflight: Inflight::default(),
            child: guest.child().clone(),
        });

        if let Some(binder) = service {
            let mut state = shared.state.lock().unwrap();
            for (command, handler) in binder.into_handlers() {
                state.handlers.insert(command, handler);
            }
        }

        let loop_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("pybridge-queue-rx".to_string())
            .spawn(move || receive_loop(loop_shared, reader));
        if let Err(err) = spawned {
            return Err(anyhow::anyhow!("failed to start queue receive loop: {err}").into());
        }

        let channel = QueueChannel { shared, guest };
        if let Err(err) = channel.discover_methods() {
            tracing::warn!(error = %err, "failed to discover guest methods");
        }
        Ok(channel)
    }

    /// Stream of structured exceptions the guest reported out-of-band.
    pub fn exceptions(&self) -> &Receiver<GuestException> {
        self.guest.status().exceptions()
    }

    /// Stream of guest status events.
    pub fn statuses(&self) -> &Receiver<StatusEvent> {
        self.guest.status().statuses()
    }

    pub fn register_handler<F>(&self, command: &str, handler: F)
    where
        F: Fn(Value, &str) -> Result<Value> + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.handlers.insert(command.to_string(), Arc::new(handler));
    }

    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(Value, &str) -> Result<Value> + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.default_handler = Some(Arc::new(handler));
    }

    /// Names of every guest method learned during introspection.
    pub fn methods(&self) -> Vec<String> {
        let state = self.shared.state.lock().unwrap();
        state.methods.keys().cloned().collect()
    }

    pub fn method_info(&self, name: &str) -> Option<MethodInfo> {
        let state = self.shared.state.lock().unwrap();
        state.methods.get(name).cloned()
    }

    /// Number of calls currently blocked on a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().unwrap().pending.len()
    }

    /// Sends a command frame. With `wait_for_response` the call blocks on a
    /// single-shot slot installed before the frame hits the wire; `timeout`
    /// of `None` waits indefinitely. A timed-out slot is removed so a late
    /// response is discarded, not misdelivered.
    pub fn send_command(
        &self,
        command: &str,
        data: Value,
        timeout: Option<Duration>,
        wait_for_response: bool,
    ) -> Result<Option<Value>> {
        let request_id = self.next_request_id();

        let slot = if wait_for_response {
            let (tx, rx) = bounded(1);
            let mut state = self.shared.state.lock().unwrap();
            if !state.running {
                return Err(BridgeError::ChannelClosed);
            }
            state.pending.insert(request_id.clone(), tx);
            Some(rx)
        } else {
            if !self.shared.state.lock().unwrap().running {
                return Err(BridgeError::ChannelClosed);
            }
            None
        };

        if let Err(err) = self.send_frame(command, &data, &request_id) {
            if wait_for_response {
                self.shared
                    .state
                    .lock()
                    .unwrap()
                    .pending
                    .remove(&request_id);
            }
            return Err(err);
        }

        let Some(slot) = slot else {
            return Ok(None);
        };

        match timeout {
            None => slot.recv().map(Some).map_err(|_| BridgeError::PipeClosed),
            Some(timeout) => match slot.recv_timeout(timeout) {
                Ok(response) => Ok(Some(response)),
                Err(RecvTimeoutError::Timeout) => {
                    self.shared
                        .state
                        .lock()
                        .unwrap()
                        .pending
                        .remove(&request_id);
                    Err(BridgeError::Timeout(format!(
                        "waiting for response to command {command}"
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => Err(BridgeError::PipeClosed),
            },
        }
    }

    /// Invokes a guest method and extracts its result. A response carrying
    /// `error` surfaces as `BridgeError::Guest`.
    pub fn call(&self, method: &str, timeout: Option<Duration>, args: Value) -> Result<Value> {
        let response = self
            .send_command(method, args, timeout, true)?
            .ok_or_else(|| anyhow::anyhow!("response missing for awaited command"))?;
        response_result(response)
    }

    /// Graceful stop: ask the guest to shut down, drain in-flight handlers,
    /// then reap the child.
    pub fn shutdown(&self) -> Result<i32> {
        let response = self.send_command("shutdown", Value::Nil, None, true)?;
        tracing::debug!(?response, "guest acknowledged shutdown");
        self.shared.inflight.wait_idle();
        self.shared.child.wait()
    }

    /// Hard stop: fire-and-forget `exit`, a brief flush delay, then
    /// graceful-then-forced termination.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.running {
                return Ok(());
            }
            state.running = false;
        }
        if let Err(err) = self.send_frame("exit", &Value::Nil, &self.next_request_id()) {
            tracing::debug!(error = %err, "exit command not delivered");
        }
        thread::sleep(CLOSE_FLUSH_DELAY);
        self.shared.child.terminate()
    }

    fn next_request_id(&self) -> String {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{HOST_ID_PREFIX}{id}")
    }

    fn send_frame(&self, command: &str, data: &Value, request_id: &str) -> Result<()> {
        let frame = rmp_serde::to_vec_named(&RpcRequest {
            command,
            data,
            request_id,
        })
        .map_err(|err| BridgeError::Framing(format!("msgpack encode: {err}")))?;
        let mut writer = self.shared.writer.lock().unwrap();
        writer.send(&frame)
    }

    fn discover_methods(&self) -> Result<()> {
        let response = self
            .send_command(INTROSPECTION_COMMAND, Value::Nil, None, true)?
            .ok_or_else(|| anyhow::anyhow!("introspection returned no response"))?;
        let methods = parse_method_table(&response)?;
        let mut state = self.shared.state.lock().unwrap();
        state.methods = methods;
        tracing::debug!(count = state.methods.len(), "guest methods discovered");
        Ok(())
    }
}

fn forward_stream<R, W>(name: &str, source: Option<R>, sink: impl Fn() -> W + Send + 'static)
where
    R: io::Read + Send + 'static,
    W: io::Write,
{
    let Some(mut source) = source else {
        return;
    };
    let _ = thread::Builder::new().name(name.to_string()).spawn(move || {
        let _ = io::copy(&mut source, &mut sink());
    });
}

/// Outcome of classifying one inbound frame. A frame is exclusively a
/// response to a pending call or a guest-originated request; anything
/// ambiguous is dropped.
#[derive(Debug, PartialEq)]
enum Inbound {
    Response { request_id: String, body: Value },
    Request {
        command: String,
        data: Value,
        request_id: String,
    },
    Invalid(String),
}

fn classify(value: Value) -> Inbound {
    let Some(entries) = value.as_map() else {
        return Inbound::Invalid("frame is not a map".to_string());
    };

    let field = |name: &str| {
        entries
            .iter()
            .find(|(key, _)| key.as_str() == Some(name))
            .map(|(_, value)| value)
    };
    let request_id = field("request_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let command = field("command").and_then(|v| v.as_str()).map(str::to_string);
    let data = field("data").cloned();

    match (request_id, command) {
        (Some(id), Some(_)) if id.starts_with(HOST_ID_PREFIX) => Inbound::Invalid(format!(
            "frame {id} carries both a host request id and a command"
        )),
        (Some(id), None) if id.starts_with(HOST_ID_PREFIX) => Inbound::Response {
            request_id: id,
            body: value,
        },
        (Some(id), Some(command)) => Inbound::Request {
            command,
            data: data.unwrap_or(Value::Nil),
            request_id: id,
        },
        (Some(id), None) => Inbound::Invalid(format!("request {id} lacks a command")),
        (None, Some(command)) => {
            Inbound::Invalid(format!("command {command} lacks a request id"))
        }
        (None, None) => Inbound::Invalid("frame is neither a response nor a request".to_string()),
    }
}

/// Extracts the caller-visible result from a response map, including the
/// back-compat path for guests that place the result at top level.
fn response_result(response: Value) -> Result<Value> {
    let Some(entries) = response.as_map() else {
        return Ok(response);
    };

    for (key, value) in entries {
        if key.as_str() == Some("error") {
            let message = value.as_str().unwrap_or("unspecified guest error");
            return Err(BridgeError::Guest(message.to_string()));
        }
    }
    for (key, value) in entries {
        if key.as_str() == Some("result") {
            return Ok(value.clone());
        }
    }

    let rest: Vec<(Value, Value)> = entries
        .iter()
        .filter(|(key, _)| key.as_str() != Some("request_id"))
        .cloned()
        .collect();
    if rest.len() == 1 {
        return Ok(rest.into_iter().next().map(|(_, value)| value).unwrap_or(Value::Nil));
    }
    Ok(Value::Map(rest))
}

fn parse_method_table(response: &Value) -> Result<BTreeMap<String, MethodInfo>> {
    let lookup = |value: &Value, name: &str| -> Option<Value> {
        value.as_map().and_then(|entries| {
            entries
                .iter()
                .find(|(key, _)| key.as_str() == Some(name))
                .map(|(_, value)| value.clone())
        })
    };
    // Either {"result": {"methods": ...}} or the historical top-level shape.
    let methods = lookup(response, "result")
        .and_then(|result| lookup(&result, "methods"))
        .or_else(|| lookup(response, "methods"))
        .ok_or_else(|| anyhow::anyhow!("introspection response lacks a methods table"))?;
    rmpv::ext::from_value(methods)
        .map_err(|err| BridgeError::Framing(format!("undecodable method table: {err}")))
}

fn receive_loop(shared: Arc<QueueShared>, mut reader: FrameReader) {
    loop {
        if !shared.state.lock().unwrap().running {
            break;
        }

        let frame = match reader.receive() {
            Ok(frame) => frame,
            Err(BridgeError::PipeClosed) => {
                tracing::debug!("queue pipe closed");
                break;
            }
            Err(err) => {
                tracing::error!(error = %err, "queue receive failed");
                break;
            }
        };

        let value = match shared.serializer.unmarshal(&frame) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable queue frame");
                continue;
            }
        };

        match classify(value) {
            Inbound::Response { request_id, body } => {
                let slot = shared.state.lock().unwrap().pending.remove(&request_id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => {
                        tracing::debug!(%request_id, "discarding late or unknown response");
                    }
                }
            }
            Inbound::Request {
                command,
                data,
                request_id,
            } => {
                shared.inflight.enter();
                let worker_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name("pybridge-handler".to_string())
                    .spawn(move || {
                        let _guard = InflightGuard(&worker_shared.inflight);
                        run_handler(&worker_shared, &command, data, &request_id);
                    });
                if let Err(err) = spawned {
                    shared.inflight.exit();
                    tracing::error!(error = %err, "failed to start handler worker");
                }
            }
            Inbound::Invalid(reason) => {
                tracing::warn!(%reason, "dropping frame");
            }
        }
    }

    // Fail every waiter and refuse new sends.
    let mut state = shared.state.lock().unwrap();
    state.running = false;
    state.pending.clear();
}

fn run_handler(shared: &QueueShared, command: &str, data: Value, request_id: &str) {
    let (handler, default_handler) = {
        let state = shared.state.lock().unwrap();
        (
            state.handlers.get(command).cloned(),
            state.default_handler.clone(),
        )
    };

    let outcome = match handler.or(default_handler) {
        Some(handler) => catch_unwind(AssertUnwindSafe(|| handler(data, request_id)))
            .unwrap_or_else(|_| {
                Err(BridgeError::Handler(format!(
                    "handler for {command} panicked"
                )))
            }),
        None => Err(BridgeError::UnknownCommand(command.to_string())),
    };

    let mut response: Vec<(Value, Value)> = Vec::with_capacity(2);
    match outcome {
        Ok(result) => response.push((Value::from("result"), result)),
        Err(err) => response.push((Value::from("error"), Value::from(err.to_string()))),
    }
    response.push((Value::from("request_id"), Value::from(request_id)));

    match shared.serializer.marshal(&Value::Map(response)) {
        Ok(frame) => {
            let mut writer = shared.writer.lock().unwrap();
            if let Err(err) = writer.send(&frame) {
                tracing::warn!(error = %err, command, "failed to send handler response");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, command, "failed to encode handler response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::from(key), value))
                .collect(),
        )
    }

    #[test]
    fn host_prefixed_id_is_a_response() {
        let frame = map(vec![
            ("request_id", Value::from("req-7")),
            ("result", Value::from(1)),
        ]);
        match classify(frame) {
            Inbound::Response { request_id, .. } => assert_eq!(request_id, "req-7"),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn guest_id_with_command_is_a_request() {
        let frame = map(vec![
            ("command", Value::from("log")),
            ("data", Value::Array(vec![Value::from("hi")])),
            ("request_id", Value::from("py-3")),
        ]);
        match classify(frame) {
            Inbound::Request {
                command,
                request_id,
                ..
            } => {
                assert_eq!(command, "log");
                assert_eq!(request_id, "py-3");
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn host_id_with_command_is_rejected() {
        // Strict protocol invariant: a frame may not claim both origins.
        let frame = map(vec![
            ("command", Value::from("evil")),
            ("request_id", Value::from("req-1")),
        ]);
        assert!(matches!(classify(frame), Inbound::Invalid(_)));
    }

    #[test]
    fn missing_request_id_is_dropped() {
        let frame = map(vec![("command", Value::from("orphan"))]);
        assert!(matches!(classify(frame), Inbound::Invalid(_)));
    }

    #[test]
    fn response_error_surfaces_as_guest_error() {
        let response = map(vec![
            ("error", Value::from("boom")),
            ("request_id", Value::from("req-1")),
        ]);
        match response_result(response) {
            Err(BridgeError::Guest(message)) => assert_eq!(message, "boom"),
            other => panic!("expected guest error, got {other:?}"),
        }
    }

    #[test]
    fn response_result_key_wins() {
        let response = map(vec![
            ("result", Value::from(42)),
            ("request_id", Value::from("req-1")),
        ]);
        assert_eq!(response_result(response).unwrap(), Value::from(42));
    }

    #[test]
    fn top_level_single_value_is_the_back_compat_result() {
        let response = map(vec![
            ("methods", Value::from("table")),
            ("request_id", Value::from("req-2")),
        ]);
        assert_eq!(response_result(response).unwrap(), Value::from("table"));
    }

    #[test]
    fn top_level_multi_value_returns_the_remaining_map() {
        let response = map(vec![
            ("a", Value::from(1)),
            ("b", Value::from(2)),
            ("request_id", Value::from("req-2")),
        ]);
        let result = response_result(response).unwrap();
        assert_eq!(result.as_map().unwrap().len(), 2);
    }

    #[test]
    fn method_table_parses_from_either_shape() {
        let table = map(vec![(
            "echo",
            map(vec![
                (
                    "parameters",
                    Value::Array(vec![map(vec![
                        ("name", Value::from("x")),
                        ("required", Value::from(true)),
                    ])]),
                ),
                ("doc", Value::from("echo a value")),
            ]),
        )]);

        let nested = map(vec![
            ("result", map(vec![("methods", table.clone())])),
            ("request_id", Value::from("req-1")),
        ]);
        let methods = parse_method_table(&nested).unwrap();
        assert_eq!(methods["echo"].parameters[0].name, "x");
        assert!(methods["echo"].parameters[0].required);

        let top_level = map(vec![
            ("methods", table),
            ("request_id", Value::from("req-1")),
        ]);
        let methods = parse_method_table(&top_level).unwrap();
        assert_eq!(methods["echo"].doc, "echo a value");
    }

    #[test]
    fn request_encoding_is_a_named_map() {
        let frame = rmp_serde::to_vec_named(&RpcRequest {
            command: "echo",
            data: &Value::from(5),
            request_id: "req-9",
        })
        .unwrap();
        let decoded = MsgpackSerializer.unmarshal(&frame).unwrap();
        let entries = decoded.as_map().unwrap().clone();
        let get = |name: &str| {
            entries
                .iter()
                .find(|(key, _)| key.as_str() == Some(name))
                .map(|(_, value)| value.clone())
                .unwrap()
        };
        assert_eq!(get("command"), Value::from("echo"));
        assert_eq!(get("data"), Value::from(5));
        assert_eq!(get("request_id"), Value::from("req-9"));
    }

    #[test]
    fn inflight_gauge_drains_to_zero() {
        let inflight = Arc::new(Inflight::default());
        for _ in 0..8 {
            inflight.enter();
            let inflight = Arc::clone(&inflight);
            thread::spawn(move || {
                let _guard = InflightGuard(&inflight);
                thread::sleep(Duration::from_millis(10));
            });
        }
        inflight.wait_idle();
        assert_eq!(*inflight.count.lock().unwrap(), 0);
    }
}
