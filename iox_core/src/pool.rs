use std::sync::Mutex;

/// A pool of fixed-size buffers. Entries are plain `Vec<u8>`s returned on
/// drop; there is no unsafe slice-header manipulation here, just a LIFO
/// stack behind a mutex.
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Checks out a buffer of this pool's fixed size, reusing a returned one
    /// if available, allocating a fresh one otherwise.
    pub fn acquire(&self) -> PooledBuffer<'_> {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }
}

/// A checked-out buffer. The "used length" of a read is simply the return
/// value of the `Read` call into `as_mut_slice()`; callers slice `[..n]`
/// themselves rather than this guard tracking it.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Vec<u8>>,
}

impl PooledBuffer<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = BufferPool::new(16);
        let ptr_first = {
            let mut buf = pool.acquire();
            buf.as_mut_slice().as_mut_ptr()
        };
        let ptr_second = {
            let mut buf = pool.acquire();
            buf.as_mut_slice().as_mut_ptr()
        };
        assert_eq!(ptr_first, ptr_second);
    }

    #[test]
    fn fresh_buffers_are_zeroed_and_sized() {
        let pool = BufferPool::new(8);
        let mut buf = pool.acquire();
        assert_eq!(buf.as_mut_slice().len(), 8);
        assert_eq!(buf.as_slice(), &[0u8; 8]);
    }
}
