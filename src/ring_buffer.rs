//! Bounded byte ring for raw PTY output.
//!
//! Each PTY session keeps its most recent output here for byte-fidelity
//! streaming to browsers. Writers append freely; once the ring is full,
//! new bytes overwrite the oldest in place. The backing storage never
//! exceeds the configured bound.

/// Circular byte buffer with a fixed upper bound.
///
/// Backed by a flat `Vec<u8>` that fills once and then wraps: `head`
/// marks the oldest byte, and writes past the bound land on top of it.
pub struct RingBuffer {
    storage: Vec<u8>,
    /// Index of the oldest byte once the storage has wrapped.
    head: usize,
    bound: usize,
}

impl RingBuffer {
    /// Create a ring bounded at `bound` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bound == 0`.
    #[must_use]
    pub fn new(bound: usize) -> Self {
        assert!(bound > 0, "ring bound must be positive");
        Self {
            storage: Vec::new(),
            head: 0,
            bound,
        }
    }

    /// Append `data`, overwriting the oldest bytes once the ring is full.
    ///
    /// A single write larger than the whole ring keeps only its tail.
    pub fn push(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data.len() >= self.bound {
            // Nothing already buffered can survive this write.
            data = &data[data.len() - self.bound..];
            self.storage.clear();
            self.storage.extend_from_slice(data);
            self.head = 0;
            return;
        }

        // Fill phase: storage grows until it reaches the bound.
        if self.storage.len() < self.bound {
            let room = self.bound - self.storage.len();
            let take = room.min(data.len());
            self.storage.extend_from_slice(&data[..take]);
            data = &data[take..];
            if data.is_empty() {
                return;
            }
        }

        // Wrap phase: each byte lands on the current oldest position.
        for &byte in data {
            self.storage[self.head] = byte;
            self.head = (self.head + 1) % self.storage.len();
        }
    }

    /// All buffered bytes in arrival order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.storage.len());
        out.extend_from_slice(&self.storage[self.head..]);
        out.extend_from_slice(&self.storage[..self.head]);
        out
    }

    /// Take all buffered bytes in arrival order, leaving the ring empty.
    #[must_use]
    pub fn drain(&mut self) -> Vec<u8> {
        let out = self.to_vec();
        self.storage.clear();
        self.head = 0;
        out
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// The configured byte bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.bound
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("len", &self.storage.len())
            .field("bound", &self.bound)
            .field("wrapped", &(self.head != 0 || self.storage.len() == self.bound))
            .finish()
    }
}
