use std::io;

use thiserror::Error;

use crate::exception::GuestException;

/// Errors surfaced by the IPC core.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A pipe reached EOF before the expected payload arrived. Fatal to the
    /// channel that observed it.
    #[error("pipe closed before expected data arrived")]
    PipeClosed,

    /// The declared frame length exceeded the ceiling, or an encoder or
    /// decoder rejected a payload.
    #[error("framing error: {0}")]
    Framing(String),

    /// A deadline expired. The channel itself remains usable.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The guest answered a request with an `error` field.
    #[error("guest error: {0}")]
    Guest(String),

    /// The guest reported a structured exception on the status pipe.
    #[error(transparent)]
    GuestException(#[from] GuestException),

    /// A host-registered handler failed; the message is relayed to the guest.
    #[error("handler error: {0}")]
    Handler(String),

    /// No handler and no default handler matched an inbound command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The channel was torn down, or poisoned by an earlier timeout.
    #[error("channel closed")]
    ChannelClosed,

    /// The child exited abnormally (signal, or forced kill).
    #[error("child process was killed")]
    ChildKilled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// EOF-like I/O failures on a pipe collapse into `PipeClosed` so every
/// channel reports a closed peer the same way.
pub(crate) fn map_pipe_err(err: io::Error) -> BridgeError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => BridgeError::PipeClosed,
        _ => BridgeError::Io(err),
    }
}
