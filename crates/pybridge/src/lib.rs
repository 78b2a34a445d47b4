//! Embed a Python interpreter in a host application as a supervised child
//! process, without FFI.
//!
//! The guest is launched through a two-stage bootstrap: a minimal stage-one
//! loader passed on the command line opens an inherited pipe and executes
//! the stage-two loader it reads there; stage two reads the [`CodeBundle`]
//! from a second one-shot pipe, installs an importer over the embedded
//! sources, wires the runtime pipes, and runs the entrypoint. From then on
//! three channels are available over the inherited descriptors:
//!
//! - [`QueueChannel`]: bidirectional RPC. Length-framed MessagePack
//!   requests and responses, correlated by request id, with host-side
//!   handlers the guest can invoke and an introspected method cache.
//! - [`ReplChannel`]: stateful interactive execution. Code goes down one
//!   raw pipe; output comes back on another, bounded by an out-of-band
//!   sentinel sequence.
//! - [`ExecChannel`]: fire-one-request, read-one-response JSON execution.
//!
//! A [`StatusReader`] always runs in the background, turning the guest's
//! newline-delimited status pipe into exception and status streams, and a
//! process-wide signal coordinator makes sure no guest outlives its host.
//!
//! ```no_run
//! use pybridge::{GuestRuntime, LaunchOptions};
//!
//! # fn main() -> pybridge::Result<()> {
//! let runtime = GuestRuntime::from_system()?;
//! let repl = runtime.spawn_repl(
//!     Default::default(),
//!     Vec::new(),
//!     Vec::new(),
//!     LaunchOptions::default(),
//! )?;
//! repl.execute("x = 41", true)?;
//! let result = repl.execute("print(x + 1)", true)?;
//! assert_eq!(result.output, "42");
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("pybridge drives POSIX pipes, descriptors, and signals; non-Unix hosts are not supported");

pub mod bufferpool;
pub mod bundle;
pub mod error;
pub mod exception;
pub mod exec;
pub mod launch;
pub mod pipe;
pub mod process;
pub mod queue;
pub mod repl;
pub mod runtime;
pub mod service;
pub mod status;
pub mod transport;

mod signal;

pub use bufferpool::BufferPool;
pub use bundle::{CodeBundle, SourceModule, SourcePackage, Wiring};
pub use error::{BridgeError, Result};
pub use exception::GuestException;
pub use exec::ExecChannel;
pub use launch::{GuestProcess, LaunchOptions};
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use process::ChildProcess;
pub use queue::{CommandHandler, MethodInfo, ParameterInfo, QueueChannel};
pub use repl::{ReplChannel, ReplOutput, SENTINEL, SENTINEL_CRLF};
pub use runtime::GuestRuntime;
pub use service::{FromWire, IntoWire, ServiceBinder};
pub use status::{StatusEvent, StatusReader};
pub use transport::{
    FrameReader, FrameWriter, FramedTransport, MsgpackSerializer, Serializer, MAX_FRAME_LEN,
};
