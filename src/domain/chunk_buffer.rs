//! Reusable row buffer moved between the extractor and the serializer.

use crate::domain::entities::Record;

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const MIN_CHUNK_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 1_000_000;

/// A bounded batch of rows. Reset between chunks rather than reallocated.
#[derive(Debug)]
pub struct ChunkBuffer {
    rows: Vec<Record>,
    capacity: usize,
}

impl ChunkBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a row. Callers check `is_full()` to decide when to flush.
    pub fn push(&mut self, row: Record) {
        self.rows.push(row);
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Rows still accepted before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.rows.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// Drops the rows but keeps the allocation.
    pub fn reset(&mut self) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Value;

    #[test]
    fn test_reset_keeps_allocation() {
        let mut buf = ChunkBuffer::with_capacity(3);
        for i in 0..3 {
            let mut r = Record::new();
            r.insert("id".into(), Value::Int(i));
            buf.push(r);
        }
        assert!(buf.is_full());
        assert_eq!(buf.remaining(), 0);

        let ptr = buf.rows().as_ptr();
        let cap = buf.rows.capacity();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.rows.capacity(), cap);

        buf.push(Record::new());
        assert_eq!(buf.rows().as_ptr(), ptr);
    }
}
