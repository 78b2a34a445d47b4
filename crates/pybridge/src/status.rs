use std::io::{BufRead, BufReader, Read};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::exception::GuestException;

/// One status record from the guest, e.g. `{"type":"status","status":"ok"}`
/// minus nothing: the full object is preserved.
pub type StatusEvent = serde_json::Map<String, serde_json::Value>;

/// Consumes newline-delimited JSON records from the status pipe and routes
/// them onto two bounded streams: structured exceptions and status events.
///
/// Both streams have capacity one; callers drain them before the next
/// operation that can produce an event. The reader runs until EOF or an
/// `exit` status, whichever comes first. Malformed records are logged and
/// skipped so a single bad line cannot silence the guest.
pub struct StatusReader {
    exceptions: Receiver<GuestException>,
    statuses: Receiver<StatusEvent>,
}

impl StatusReader {
    pub fn spawn(pipe: impl Read + Send + 'static) -> Self {
        let (exception_tx, exceptions) = bounded(1);
        let (status_tx, statuses) = bounded(1);
        let spawned = thread::Builder::new()
            .name("pybridge-status".to_string())
            .spawn(move || read_loop(pipe, exception_tx, status_tx));
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to start status reader");
        }
        Self {
            exceptions,
            statuses,
        }
    }

    pub fn exceptions(&self) -> &Receiver<GuestException> {
        &self.exceptions
    }

    pub fn statuses(&self) -> &Receiver<StatusEvent> {
        &self.statuses
    }
}

fn read_loop(
    pipe: impl Read,
    exception_tx: Sender<GuestException>,
    status_tx: Sender<StatusEvent>,
) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "status pipe read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let record: serde_json::Value = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, raw = %line, "malformed status record");
                continue;
            }
        };

        match record.get("type").and_then(|t| t.as_str()) {
            Some("exception") => match serde_json::from_value::<GuestException>(record.clone()) {
                Ok(exception) => {
                    tracing::debug!(kind = %exception.kind, "guest exception");
                    if exception_tx.send(exception).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, raw = %line, "undecodable guest exception");
                }
            },
            Some("status") => {
                let event = match record.as_object() {
                    Some(event) => event.clone(),
                    None => continue,
                };
                let exit = is_exit(&event);
                if status_tx.send(event).is_err() {
                    return;
                }
                if exit {
                    return;
                }
            }
            other => {
                tracing::warn!(kind = ?other, raw = %line, "unknown status record type");
            }
        }
    }
}

fn is_exit(event: &StatusEvent) -> bool {
    ["status", "message"]
        .iter()
        .any(|key| event.get(*key).and_then(|v| v.as_str()) == Some("exit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use std::io::Write;
    use std::time::Duration;

    const RECV_WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn routes_exceptions_and_statuses() {
        let (rx, mut tx) = pipe().unwrap();
        let reader = StatusReader::spawn(rx);

        writeln!(
            tx,
            r#"{{"type":"exception","exception":"ValueError","message":"nope","traceback":"tb"}}"#
        )
        .unwrap();
        writeln!(tx, r#"{{"type":"status","status":"ok"}}"#).unwrap();

        let exception = reader.exceptions().recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(exception.kind, "ValueError");

        let status = reader.statuses().recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(status.get("status").unwrap(), "ok");
    }

    #[test]
    fn malformed_records_are_skipped() {
        let (rx, mut tx) = pipe().unwrap();
        let reader = StatusReader::spawn(rx);

        writeln!(tx, "this is not json").unwrap();
        writeln!(tx, r#"{{"type":"bogus","x":1}}"#).unwrap();
        writeln!(tx, r#"{{"type":"status","status":"still alive"}}"#).unwrap();

        let status = reader.statuses().recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(status.get("status").unwrap(), "still alive");
    }

    #[test]
    fn exit_status_ends_the_reader() {
        let (rx, mut tx) = pipe().unwrap();
        let reader = StatusReader::spawn(rx);

        writeln!(tx, r#"{{"type":"status","status":"exit"}}"#).unwrap();
        let status = reader.statuses().recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(status.get("status").unwrap(), "exit");

        // The loop has ended even though the write end is still open.
        writeln!(tx, r#"{{"type":"status","status":"ignored"}}"#).unwrap();
        assert!(reader
            .statuses()
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }

    #[test]
    fn eof_ends_the_reader() {
        let (rx, tx) = pipe().unwrap();
        let reader = StatusReader::spawn(rx);
        drop(tx);
        assert!(reader.exceptions().recv_timeout(RECV_WAIT).is_err());
    }

    #[test]
    fn exit_in_message_field_also_ends_the_reader() {
        let (rx, mut tx) = pipe().unwrap();
        let reader = StatusReader::spawn(rx);
        writeln!(tx, r#"{{"type":"status","message":"exit"}}"#).unwrap();
        let status = reader.statuses().recv_timeout(RECV_WAIT).unwrap();
        assert_eq!(status.get("message").unwrap(), "exit");
        writeln!(tx, r#"{{"type":"status","status":"late"}}"#).unwrap();
        assert!(reader
            .statuses()
            .recv_timeout(Duration::from_millis(200))
            .is_err());
    }
}
