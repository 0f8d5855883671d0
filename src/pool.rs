//! Fixed-size packet buffers.
//!
//! Every [`Buffer`] goes back to the [`BufferPool`] it came from exactly
//! once, whether it is released explicitly or dropped.
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::*;

pub const UDP_BUFFER_SIZE: usize = 65535;
const MAX_IDLE: usize = 256;

#[derive(Debug)]
struct Shared {
    size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                size,
                idle: Mutex::new(vec![]),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn get(&self) -> Buffer {
        let data = self
            .shared
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop())
            .unwrap_or_else(|| vec![0u8; self.shared.size]);
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        Buffer {
            data: Some(data),
            len: self.shared.size,
            pool: self.shared.clone(),
        }
    }

    /// Number of buffers handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(UDP_BUFFER_SIZE)
    }
}

pub struct Buffer {
    data: Option<Vec<u8>>,
    len: usize,
    pool: Arc<Shared>,
}

impl Buffer {
    /// Shrink the visible part to the first `len` bytes
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    pub fn release(mut self) {
        self.put_back();
    }

    fn put_back(&mut self) {
        if let Some(mut data) = self.data.take() {
            self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
            data.resize(self.pool.size, 0);
            match self.pool.idle.lock() {
                Ok(mut idle) if idle.len() < MAX_IDLE => idle.push(data),
                Ok(_) => {}
                Err(err) => warn!("buffer pool poisoned: {}", err),
            }
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(data) => &mut data[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.put_back();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn returned_exactly_once() {
        let pool = BufferPool::new(16);
        let mut buf = pool.get();
        assert_eq!(pool.outstanding(), 1);
        buf[..4].copy_from_slice(b"ping");
        buf.truncate(4);
        assert_eq!(&buf[..], b"ping");

        buf.release();
        assert_eq!(pool.outstanding(), 0);

        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.outstanding(), 2);
        // recycled buffer is restored to full size
        assert_eq!(a.len(), 16);
        drop(a);
        b.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn truncate_never_grows() {
        let pool = BufferPool::new(8);
        let mut buf = pool.get();
        buf.truncate(4);
        buf.truncate(6);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn concurrent_get_and_release() {
        let pool = BufferPool::new(32);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.get();
                        drop(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
