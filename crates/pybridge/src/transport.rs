use std::io::{Read, Write};

use crate::bufferpool::BufferPool;
use crate::error::{map_pipe_err, BridgeError, Result};

/// Hard ceiling on a declared frame length. A header above this is treated
/// as stream corruption, not a legitimate payload.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const RECV_BUF_SIZE: usize = 8192;
const RECV_POOL_BUFFERS: usize = 10;

/// Encodes and decodes the binary payload carried inside each frame.
pub trait Serializer: Send + Sync {
    fn marshal(&self, value: &rmpv::Value) -> Result<Vec<u8>>;
    fn unmarshal(&self, data: &[u8]) -> Result<rmpv::Value>;
}

/// MessagePack payload encoding, matching the guest queue module.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn marshal(&self, value: &rmpv::Value) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value)
            .map_err(|err| BridgeError::Framing(format!("msgpack encode: {err}")))?;
        Ok(buf)
    }

    fn unmarshal(&self, data: &[u8]) -> Result<rmpv::Value> {
        rmpv::decode::read_value(&mut &data[..])
            .map_err(|err| BridgeError::Framing(format!("msgpack decode: {err}")))
    }
}

/// Write half of the framed wire: 4-byte big-endian length, then payload.
pub struct FrameWriter {
    writer: Box<dyn Write + Send>,
}

impl FrameWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Box::new(writer),
        }
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                BridgeError::Framing(format!(
                    "outbound frame of {} bytes exceeds the {MAX_FRAME_LEN}-byte ceiling",
                    data.len()
                ))
            })?;
        self.writer
            .write_all(&len.to_be_bytes())
            .map_err(map_pipe_err)?;
        // The guest reads the header with its own deadline; it must never be
        // coalesced behind a previous frame's body by stream buffering.
        self.writer.flush().map_err(map_pipe_err)?;
        self.writer.write_all(data).map_err(map_pipe_err)?;
        self.writer.flush().map_err(map_pipe_err)?;
        Ok(())
    }
}

/// Read half of the framed wire. Small frames are read into pooled buffers.
pub struct FrameReader {
    reader: Box<dyn Read + Send>,
    pool: BufferPool,
}

impl FrameReader {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            pool: BufferPool::new(RECV_BUF_SIZE, RECV_POOL_BUFFERS),
        }
    }

    /// Reads exactly one frame. Short reads are retried by `read_exact`;
    /// EOF at any point surfaces as `PipeClosed`.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.reader.read_exact(&mut header).map_err(map_pipe_err)?;
        let len = u32::from_be_bytes(header);
        if len > MAX_FRAME_LEN {
            return Err(BridgeError::Framing(format!(
                "declared frame length {len} exceeds the {MAX_FRAME_LEN}-byte ceiling"
            )));
        }

        let len = len as usize;
        if len <= self.pool.buf_size() {
            let mut buf = self.pool.get();
            if let Err(err) = self.reader.read_exact(&mut buf[..len]) {
                self.pool.put(buf);
                return Err(map_pipe_err(err));
            }
            let frame = buf[..len].to_vec();
            self.pool.put(buf);
            Ok(frame)
        } else {
            let mut data = vec![0u8; len];
            self.reader.read_exact(&mut data).map_err(map_pipe_err)?;
            Ok(data)
        }
    }
}

/// Length-prefixed byte framing over a pipe pair.
pub struct FramedTransport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl FramedTransport {
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.send(data)
    }

    pub fn receive(&mut self) -> Result<Vec<u8>> {
        self.reader.receive()
    }

    /// Splits into independently owned halves so a receive loop and
    /// concurrent senders do not contend on one lock.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    /// Closes both halves.
    pub fn close(self) {}
}
