use crate::{EngineError, Result, Sample};

/// Fixed-capacity circular store holding the most recent samples of a channel.
///
/// Storage is allocated once at construction; pushing never reallocates.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<Sample>,
    write_pos: usize,
    filled: bool,
}

impl RingBuffer {
    /// Creates a buffer holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(EngineError::invalid("ring buffer capacity must be non-zero"));
        }

        Ok(Self {
            data: vec![0.0; capacity],
            write_pos: 0,
            filled: false,
        })
    }

    /// Appends one sample, overwriting the oldest when full.
    #[inline]
    pub fn push(&mut self, sample: Sample) {
        self.data[self.write_pos] = sample;
        self.write_pos += 1;
        if self.write_pos == self.data.len() {
            self.write_pos = 0;
            self.filled = true;
        }
    }

    /// Appends `samples` in order. Only the last `capacity` of them survive
    /// when the slice is longer than the buffer.
    pub fn push_slice(&mut self, samples: &[Sample]) {
        for &sample in samples {
            self.push(sample);
        }
    }

    /// Maximum number of samples held.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of samples currently held, never more than the capacity.
    pub fn len(&self) -> usize {
        if self.filled {
            self.data.len()
        } else {
            self.write_pos
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once `capacity` samples have been pushed. Stays true until
    /// [`RingBuffer::clear`].
    pub fn is_full(&self) -> bool {
        self.filled
    }

    /// Most recently pushed sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        if self.is_empty() {
            return None;
        }
        let index = self.write_pos.checked_sub(1).unwrap_or(self.data.len() - 1);
        Some(self.data[index])
    }

    /// Iterates the stored samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        let (older, newer) = if self.filled {
            (&self.data[self.write_pos..], &self.data[..self.write_pos])
        } else {
            (&self.data[..self.write_pos], &self.data[..0])
        };
        older.iter().chain(newer.iter())
    }

    /// Copies the stored samples out in chronological order.
    pub fn contents(&self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.len());
        out.extend(self.iter().copied());
        out
    }

    /// Empties the buffer. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.filled = false;
    }
}
