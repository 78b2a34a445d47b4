//! End-to-end RPC tests against the protocol-echo guest binary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rmpv::Value;

use pybridge::{BridgeError, CodeBundle, GuestRuntime, LaunchOptions, SourceModule};

fn echo_runtime() -> GuestRuntime {
    GuestRuntime::from_path(env!("CARGO_BIN_EXE_pybridge-guest-echo"))
}

fn queue_bundle() -> CodeBundle {
    CodeBundle::new(
        "echo-app",
        "/srv/echo",
        SourceModule::from_source("__main__", "/srv/echo/app.py", "import pybridge\n"),
    )
}

fn value_map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::from(key), value))
            .collect(),
    )
}

#[test]
fn echo_round_trips_scalars_and_maps() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let result = queue
        .call("echo", Some(Duration::from_secs(10)), Value::from(42))
        .unwrap();
    assert_eq!(result, Value::from(42));

    let nested = value_map(vec![(
        "a",
        Value::Array(vec![Value::from(1), Value::from(2), Value::from(3)]),
    )]);
    let result = queue
        .call("echo", Some(Duration::from_secs(10)), nested.clone())
        .unwrap();
    assert_eq!(result, nested);

    queue.close().unwrap();
}

#[test]
fn guest_invokes_host_handler() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let observed: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    queue.register_handler("log", move |data, _request_id| {
        sink.lock().unwrap().push(data);
        Ok(Value::from("ok"))
    });

    let request = value_map(vec![
        ("command", Value::from("log")),
        (
            "data",
            value_map(vec![
                ("lvl", Value::from("info")),
                ("msg", Value::from("hi")),
            ]),
        ),
    ]);
    let result = queue
        .call("invoke_host", Some(Duration::from_secs(10)), request)
        .unwrap();
    assert_eq!(result, Value::from("ok"));

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 1);
    let entries = observed[0].as_map().unwrap();
    assert!(entries
        .iter()
        .any(|(key, value)| key.as_str() == Some("msg") && value.as_str() == Some("hi")));

    queue.close().unwrap();
}

#[test]
fn most_recent_handler_registration_wins() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    queue.register_handler("version", |_data, _id| Ok(Value::from("one")));
    queue.register_handler("version", |_data, _id| Ok(Value::from("two")));

    let request = value_map(vec![
        ("command", Value::from("version")),
        ("data", Value::Nil),
    ]);
    let result = queue
        .call("invoke_host", Some(Duration::from_secs(10)), request)
        .unwrap();
    assert_eq!(result, Value::from("two"));

    queue.close().unwrap();
}

#[test]
fn unknown_host_command_is_reported_to_the_guest() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let request = value_map(vec![
        ("command", Value::from("never_registered")),
        ("data", Value::Nil),
    ]);
    let err = queue
        .call("invoke_host", Some(Duration::from_secs(10)), request)
        .unwrap_err();
    match err {
        BridgeError::Guest(message) => {
            assert!(message.contains("unknown command: never_registered"));
        }
        other => panic!("expected guest error, got {other:?}"),
    }

    queue.close().unwrap();
}

#[test]
fn timed_out_call_leaves_the_channel_usable() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let err = queue
        .call(
            "sleep",
            Some(Duration::from_secs(1)),
            Value::Array(vec![Value::from(5)]),
        )
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));
    assert_eq!(queue.pending_requests(), 0);

    let result = queue
        .call("echo", Some(Duration::from_secs(10)), Value::from(1))
        .unwrap();
    assert_eq!(result, Value::from(1));

    queue.close().unwrap();
}

#[test]
fn chained_guest_exception_reaches_the_host() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let err = queue
        .call("raise_chained", Some(Duration::from_secs(10)), Value::Nil)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Guest(_)));

    let exception = queue
        .exceptions()
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(exception.kind, "DatabaseError");
    let cause = exception.cause.as_deref().unwrap();
    assert_eq!(cause.kind, "ConnectionError");

    let rendered = exception.to_string();
    assert!(rendered.contains("DatabaseError"));
    assert!(rendered.contains("ConnectionError"));

    queue.close().unwrap();
}

#[test]
fn concurrent_calls_correlate_without_crosstalk() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    std::thread::scope(|scope| {
        for i in 0..32i64 {
            let queue = &queue;
            scope.spawn(move || {
                let result = queue
                    .call("echo", Some(Duration::from_secs(30)), Value::from(i))
                    .unwrap();
                assert_eq!(result, Value::from(i));
            });
        }
    });

    queue.close().unwrap();
}

#[test]
fn fire_and_forget_installs_no_pending_slot() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let response = queue
        .send_command("echo", Value::from(9), None, false)
        .unwrap();
    assert!(response.is_none());
    assert_eq!(queue.pending_requests(), 0);

    // The discarded late response must not disturb a subsequent call.
    let result = queue
        .call("echo", Some(Duration::from_secs(10)), Value::from(10))
        .unwrap();
    assert_eq!(result, Value::from(10));

    queue.close().unwrap();
}

#[test]
fn introspection_populates_the_method_cache() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();

    let mut methods = queue.methods();
    methods.sort();
    assert_eq!(methods, ["add", "echo", "sleep"]);

    let info = queue.method_info("add").unwrap();
    assert_eq!(info.parameters.len(), 2);
    assert_eq!(info.parameters[0].name, "a");
    assert!(info.parameters[0].required);
    assert_eq!(info.parameters[0].type_name.as_deref(), Some("int"));
    assert_eq!(info.doc, "Add two integers.");

    assert!(queue.method_info("missing").is_none());

    queue.close().unwrap();
}

#[test]
fn typed_service_answers_guest_calls() {
    let service = pybridge::ServiceBinder::new()
        .method("double", |x: i64| Ok(x * 2))
        .method("greet", |name: String| Ok(format!("hello {name}")));

    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), Some(service), LaunchOptions::default())
        .unwrap();

    let request = value_map(vec![
        ("command", Value::from("double")),
        ("data", Value::Array(vec![Value::from(21)])),
    ]);
    let result = queue
        .call("invoke_host", Some(Duration::from_secs(10)), request)
        .unwrap();
    assert_eq!(result, Value::from(42));

    // Arity mismatch surfaces to the guest as a handler error, not a crash.
    let request = value_map(vec![
        ("command", Value::from("greet")),
        ("data", Value::Array(vec![])),
    ]);
    let err = queue
        .call("invoke_host", Some(Duration::from_secs(10)), request)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Guest(_)));

    queue.close().unwrap();
}

#[test]
fn shutdown_waits_for_a_clean_exit() {
    let queue = echo_runtime()
        .spawn_queue(queue_bundle(), None, LaunchOptions::default())
        .unwrap();
    assert_eq!(queue.shutdown().unwrap(), 0);
}
