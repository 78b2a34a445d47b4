use std::sync::Mutex;

/// Bounded pool of fixed-size byte buffers for the frame receive path.
///
/// The pool only exists to reduce allocator pressure on small frames; it is
/// never allowed to block the receive path. `get` allocates when the pool is
/// empty and `put` drops buffers once the pool is full again.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, count: usize) -> Self {
        let buffers = (0..count).map(|_| vec![0u8; buf_size]).collect();
        Self {
            buffers: Mutex::new(buffers),
            buf_size,
            capacity: count,
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Returns a buffer of exactly `buf_size` bytes, allocating a fresh one
    /// when the pool is empty.
    pub fn get(&self) -> Vec<u8> {
        if let Some(mut buf) = self.buffers.lock().unwrap().pop() {
            buf.resize(self.buf_size, 0);
            return buf;
        }
        vec![0u8; self.buf_size]
    }

    /// Returns a buffer to the pool. Buffers with a foreign capacity are
    /// dropped, as is anything arriving while the pool is already full.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() < self.buf_size {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}
