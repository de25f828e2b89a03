
use crate::core::constants::{PAGE_SIZE, WAL_FRAME_SIZE};
use std::sync::Mutex;

/// Recycles fixed-length byte buffers used for page images and WAL frames.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_len: usize,
    max_size: usize,
}

impl BufferPool {
    pub fn new(buffer_len: usize, max_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_len,
            max_size,
        }
    }

    pub fn get(&self) -> Vec<u8> {
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.pop().unwrap_or_else(|| vec![0u8; self.buffer_len])
        } else {
            vec![0u8; self.buffer_len]
        }
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.buffer_len {
            return;
        }

        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_size {
                buf.fill(0);
                buffers.push(buf);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

static PAGE_BUFFER_POOL: once_cell::sync::Lazy<BufferPool> =
    once_cell::sync::Lazy::new(|| BufferPool::new(PAGE_SIZE, 256));

static FRAME_BUFFER_POOL: once_cell::sync::Lazy<BufferPool> =
    once_cell::sync::Lazy::new(|| BufferPool::new(WAL_FRAME_SIZE, 64));

pub fn get_page_buffer() -> Vec<u8> {
    PAGE_BUFFER_POOL.get()
}

pub fn put_page_buffer(buf: Vec<u8>) {
    PAGE_BUFFER_POOL.put(buf);
}

pub fn get_frame_buffer() -> Vec<u8> {
    FRAME_BUFFER_POOL.get()
}

pub fn put_frame_buffer(buf: Vec<u8>) {
    FRAME_BUFFER_POOL.put(buf);
}
