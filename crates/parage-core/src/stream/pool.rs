//! Pooled chunk buffers and per-job result slots.
//!
//! Both pools are bounded channels preloaded with their whole population:
//! taking blocks until a slot frees up, returning never blocks. A buffer is
//! handed to the accumulator or pump, flows through a worker and the ordered
//! delivery stage, and comes back here, so a stream of any length runs on a
//! fixed set of allocations.

use crossbeam_channel::{Receiver, Sender, bounded};

use super::ENCRYPTED_CHUNK_SIZE;

/// Fixed population of chunk-sized scratch buffers.
///
/// Every buffer has capacity for one ciphertext chunk, so sealing in place
/// never reallocates.
#[derive(Clone)]
pub(crate) struct BufferPool {
    slots: Receiver<Vec<u8>>,
    returns: Sender<Vec<u8>>,
}

impl BufferPool {
    pub(crate) fn new(population: usize) -> Self {
        let (returns, slots) = bounded(population);
        for _ in 0..population {
            returns
                .send(Vec::with_capacity(ENCRYPTED_CHUNK_SIZE))
                .expect("pool channel has capacity for its own population");
        }
        Self { slots, returns }
    }

    /// Takes a cleared buffer, blocking until one is available.
    pub(crate) fn take(&self) -> Vec<u8> {
        self.slots
            .recv()
            .expect("pool holds its own return sender, channel cannot disconnect")
    }

    /// Returns a buffer to the pool.
    pub(crate) fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        // The channel is sized for the whole population, so this cannot fill.
        let _ = self.returns.try_send(buffer);
    }
}

/// A reusable dispatch handle with a single-slot result channel.
///
/// The receiving half is cloned into the ordered queue at dispatch time;
/// the worker publishes through the sending half once the chunk is sealed
/// or opened. The slot holds one result, so a job reused before its previous
/// result was consumed simply backpressures the worker.
pub(crate) struct Job<T> {
    pub(crate) result_tx: Sender<T>,
    pub(crate) result_rx: Receiver<T>,
}

impl<T> Job<T> {
    fn new() -> Self {
        let (result_tx, result_rx) = bounded(1);
        Self {
            result_tx,
            result_rx,
        }
    }
}

/// Fixed population of [`Job`]s.
pub(crate) struct JobPool<T> {
    slots: Receiver<Job<T>>,
    returns: Sender<Job<T>>,
}

// Derived Clone would require T: Clone; the channels themselves do not.
impl<T> Clone for JobPool<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            returns: self.returns.clone(),
        }
    }
}

impl<T> JobPool<T> {
    pub(crate) fn new(population: usize) -> Self {
        let (returns, slots) = bounded(population);
        for _ in 0..population {
            returns
                .send(Job::new())
                .expect("pool channel has capacity for its own population");
        }
        Self { slots, returns }
    }

    /// Takes a job, blocking until one is available.
    pub(crate) fn take(&self) -> Job<T> {
        self.slots
            .recv()
            .expect("pool holds its own return sender, channel cannot disconnect")
    }

    /// Returns a job to the pool.
    pub(crate) fn put(&self, job: Job<T>) {
        let _ = self.returns.try_send(job);
    }
}
