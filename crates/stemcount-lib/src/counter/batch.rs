//! Batches and the loader -> shard queue mesh
//!
//! Every (shard, loader) pair gets its own bounded lock-free queue. Each
//! queue has exactly one producer (the loader's [`Outbox`]) and one consumer
//! (the shard's [`Inbox`]); [`QueueMesh::endpoints`] hands out exactly one of
//! each per id, and the handles are moved into their owning threads.
//!
//! A full queue is backpressure: the producer keeps retrying with an
//! exponential [`Backoff`] until the consumer frees a slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use crate::counts::SampleKind;
use crate::kmer::Key;

/// Minimum backoff in microseconds (yield instead of sleeping)
const MIN_BACKOFF_US: u64 = 1;

/// Maximum backoff in microseconds
const MAX_BACKOFF_US: u64 = 1000;

/// One observation of a stem inside a k-mer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StemUpdate {
    /// Encoded stem
    pub key: Key,
    /// Code of the k-mer's first base
    pub first: u8,
    /// Code of the k-mer's last base
    pub last: u8,
    /// Sample the read came from
    pub kind: SampleKind,
}

/// Updates travelling together to one shard
pub type Batch = Vec<StemUpdate>;

/// Exponential backoff for idle or blocked workers
#[derive(Debug)]
pub struct Backoff {
    backoff_us: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            backoff_us: MIN_BACKOFF_US,
        }
    }
}

impl Backoff {
    /// Reset after useful work
    #[inline]
    pub fn reset(&mut self) {
        self.backoff_us = MIN_BACKOFF_US;
    }

    /// Wait for the current backoff, then double it
    pub fn snooze(&mut self) {
        if self.backoff_us <= MIN_BACKOFF_US {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(self.backoff_us));
        }
        self.backoff_us = (self.backoff_us * 2).min(MAX_BACKOFF_US);
    }
}

/// All (shard, loader) queues of one run
pub struct QueueMesh {
    num_shards: usize,
    num_loaders: usize,
    /// Row-major by shard: `queues[shard * num_loaders + loader]`
    queues: Vec<ArrayQueue<Batch>>,
}

impl QueueMesh {
    /// Allocate `num_shards * num_loaders` queues of `capacity` batches
    pub fn new(num_shards: usize, num_loaders: usize, capacity: usize) -> Self {
        let queues = (0..num_shards * num_loaders)
            .map(|_| ArrayQueue::new(capacity))
            .collect();
        Self {
            num_shards,
            num_loaders,
            queues,
        }
    }

    /// One producer handle per loader and one consumer handle per shard
    pub fn endpoints(&mut self, batch_size: usize) -> (Vec<Outbox<'_>>, Vec<Inbox<'_>>) {
        let mesh: &QueueMesh = self;
        let outboxes = (0..mesh.num_loaders)
            .map(|loader| Outbox::new(mesh, loader, batch_size))
            .collect();
        let inboxes = mesh
            .queues
            .chunks(mesh.num_loaders)
            .enumerate()
            .map(|(shard, queues)| Inbox { shard, queues })
            .collect();
        (outboxes, inboxes)
    }

    /// Number of shards
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Number of loaders
    pub fn num_loaders(&self) -> usize {
        self.num_loaders
    }

    fn queue(&self, shard: usize, loader: usize) -> &ArrayQueue<Batch> {
        &self.queues[shard * self.num_loaders + loader]
    }
}

/// Producer side owned by one loader: a pending batch per shard
pub struct Outbox<'a> {
    mesh: &'a QueueMesh,
    loader: usize,
    batch_size: usize,
    pending: Vec<Batch>,
    batches_sent: u64,
}

impl<'a> Outbox<'a> {
    fn new(mesh: &'a QueueMesh, loader: usize, batch_size: usize) -> Self {
        Self {
            mesh,
            loader,
            batch_size,
            pending: (0..mesh.num_shards).map(|_| Vec::with_capacity(batch_size)).collect(),
            batches_sent: 0,
        }
    }

    /// Loader id this outbox belongs to
    pub fn loader(&self) -> usize {
        self.loader
    }

    /// Append an update for `shard`, handing the batch off once it is full
    #[inline]
    pub fn push(&mut self, shard: usize, update: StemUpdate) {
        let batch = &mut self.pending[shard];
        batch.push(update);
        if batch.len() >= self.batch_size {
            self.flush_shard(shard);
        }
    }

    /// Hand off every non-empty pending batch
    pub fn flush(&mut self) {
        for shard in 0..self.pending.len() {
            if !self.pending[shard].is_empty() {
                self.flush_shard(shard);
            }
        }
    }

    /// Number of batches handed off so far
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    fn flush_shard(&mut self, shard: usize) {
        let batch = std::mem::replace(&mut self.pending[shard], Vec::with_capacity(self.batch_size));
        let queue = self.mesh.queue(shard, self.loader);
        let mut backoff = Backoff::default();
        let mut item = batch;
        while let Err(returned) = queue.push(item) {
            item = returned;
            backoff.snooze();
        }
        self.batches_sent += 1;
    }
}

/// Consumer side owned by one shard: its queue from every loader
pub struct Inbox<'a> {
    shard: usize,
    queues: &'a [ArrayQueue<Batch>],
}

impl Inbox<'_> {
    /// Shard id this inbox belongs to
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// One round-robin pass over the loaders' queues
    ///
    /// Pops at most one queue-capacity of batches per loader so a fast
    /// loader cannot starve the others. Returns the number of updates seen.
    pub fn drain<F>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(&StemUpdate),
    {
        let mut seen = 0;
        for queue in self.queues {
            for _ in 0..queue.capacity() {
                let Some(batch) = queue.pop() else {
                    break;
                };
                seen += batch.len();
                batch.iter().for_each(&mut apply);
            }
        }
        seen
    }

    /// True when every inbound queue is empty
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(ArrayQueue::is_empty)
    }

    /// Throw batches away until `done` is set and the queues are empty
    ///
    /// Keeps loaders from blocking on a shard whose counter has failed.
    pub fn discard_until(&mut self, done: &AtomicBool) {
        let mut backoff = Backoff::default();
        loop {
            let finished = done.load(Ordering::Acquire);
            if self.drain(|_| {}) > 0 {
                backoff.reset();
            } else if finished {
                break;
            } else {
                backoff.snooze();
            }
        }
    }
}
