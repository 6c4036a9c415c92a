//! # Bounded diagnostic buffer.
//!
//! Keeps only the most recent diagnostic output of a decoder (its stderr), so a
//! verbose or long-running process cannot grow memory without bound.
//!
//! ## Rules
//! - A write that would push the total past the capacity resets the buffer first.
//! - A single write larger than the capacity keeps only its last `capacity` bytes.
//! - Safe for concurrent writers and readers.

use std::sync::Mutex;

/// Capacity used for decoder stderr.
pub const DIAGNOSTICS_CAPACITY: usize = 4 * 1024;

/// Fixed-capacity byte sink retaining the most recent output.
#[derive(Debug)]
pub struct BoundedBuffer {
    capacity: usize,
    buf: Mutex<Vec<u8>>,
}

impl BoundedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Appends `data` under the capacity rules and returns the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() + data.len() > self.capacity {
            buf.clear();
        }
        let keep = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        buf.extend_from_slice(keep);
        data.len()
    }

    /// Returns the retained content as text (lossy).
    pub fn read(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.buf.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for BoundedBuffer {
    fn default() -> Self {
        Self::new(DIAGNOSTICS_CAPACITY)
    }
}
