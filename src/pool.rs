use parking_lot::Mutex;
use std::sync::Arc;

/// Pool of reusable datagram buffers.
///
/// Buffers are handed out at full length and returned on drop. The UDP
/// ingress draws its read buffers from here so bursty traffic does not
/// allocate per datagram.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(Vec::with_capacity(max_buffers)),
                buffer_size,
                max_buffers,
            }),
        }
    }

    /// Get a zero-filled buffer of `buffer_size` bytes.
    pub fn get(&self) -> PooledBuf {
        let buf = self.inner.buffers.lock().pop().unwrap_or_else(|| {
            vec![0u8; self.inner.buffer_size]
        });
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A buffer that returns itself to the pool when dropped.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            let mut buffers = self.pool.buffers.lock();
            if buffers.len() < self.pool.max_buffers {
                buf.resize(self.pool.buffer_size, 0);
                buffers.push(buf);
            }
        }
    }
}
