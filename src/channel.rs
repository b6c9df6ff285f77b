// src/channel.rs
//
// Bounded sample conduit between the receive loop (sole producer) and the
// chart updater (sole consumer). Pushes never block; when full, the
// backpressure policy decides which sample is lost. Each push or drain holds
// the lock for one short critical section.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::decoder::Sample;

/// What to drop when the channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Evict the oldest queued sample to make room
    DropOldest,
    /// Refuse the incoming sample
    DropNewest,
}

impl Default for Backpressure {
    fn default() -> Self {
        Backpressure::DropOldest
    }
}

struct Inner {
    items: VecDeque<Sample>,
    capacity: usize,
    policy: Backpressure,
    dropped: u64,
    closed: bool,
    /// Bumped on every reopen so the consumer can tell link sessions apart
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    drained: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a channel holding at most `capacity` samples.
pub fn sample_channel(capacity: usize, policy: Backpressure) -> (SampleSender, SampleReceiver) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::with_capacity(capacity.min(65_536)),
            capacity: capacity.max(1),
            policy,
            dropped: 0,
            closed: false,
            generation: 0,
        }),
        drained: Notify::new(),
    });
    (
        SampleSender {
            shared: shared.clone(),
        },
        SampleReceiver { shared },
    )
}

// ============================================================================
// Producer side
// ============================================================================

#[derive(Clone)]
pub struct SampleSender {
    shared: Arc<Shared>,
}

impl SampleSender {
    /// Queue one sample. Returns false if it was refused (full under
    /// drop-newest, or the channel is closed).
    pub fn push(&self, sample: Sample) -> bool {
        let mut inner = self.shared.lock();
        Self::push_locked(&mut inner, sample)
    }

    /// Queue every sample of one frame under a single lock.
    pub fn push_all(&self, samples: Vec<Sample>) {
        let mut inner = self.shared.lock();
        for sample in samples {
            Self::push_locked(&mut inner, sample);
        }
    }

    fn push_locked(inner: &mut Inner, sample: Sample) -> bool {
        if inner.closed {
            return false;
        }
        if inner.items.len() >= inner.capacity {
            inner.dropped += 1;
            match inner.policy {
                Backpressure::DropOldest => {
                    inner.items.pop_front();
                }
                Backpressure::DropNewest => return false,
            }
        }
        inner.items.push_back(sample);
        true
    }

    /// Seal the channel. Queued samples remain available to the consumer.
    pub fn close(&self) {
        let empty = {
            let mut inner = self.shared.lock();
            inner.closed = true;
            inner.items.is_empty()
        };
        if empty {
            self.shared.drained.notify_waiters();
        }
    }

    /// Start a new link session: drop leftovers, unseal and bump the generation.
    pub fn reopen(&self) {
        let mut inner = self.shared.lock();
        inner.items.clear();
        inner.closed = false;
        inner.dropped = 0;
        inner.generation += 1;
    }

    /// Samples lost to backpressure since the last reopen.
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }

    pub fn is_drained(&self) -> bool {
        let inner = self.shared.lock();
        inner.closed && inner.items.is_empty()
    }

    /// Wait until the channel is sealed and empty, or `timeout` passes.
    /// Returns whether it drained.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a drain in between is not missed
            notified.as_mut().enable();
            if self.is_drained() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_drained();
            }
        }
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// One drain, with the channel state read under the same lock.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedBatch {
    /// Link session the samples belong to
    pub generation: u64,
    pub samples: Vec<Sample>,
    /// Sealed and empty once these samples were taken
    pub drained: bool,
}

pub struct SampleReceiver {
    shared: Arc<Shared>,
}

impl SampleReceiver {
    /// Take up to `max` samples in FIFO order. Never blocks on producers.
    pub fn drain(&self, max: usize) -> Vec<Sample> {
        self.drain_batch(max).samples
    }

    /// Like `drain`, also reporting which link session the samples came from.
    pub fn drain_batch(&self, max: usize) -> DrainedBatch {
        let batch = {
            let mut inner = self.shared.lock();
            let count = inner.items.len().min(max);
            DrainedBatch {
                generation: inner.generation,
                samples: inner.items.drain(..count).collect(),
                drained: inner.closed && inner.items.is_empty(),
            }
        };
        if batch.drained {
            self.shared.drained.notify_waiters();
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sealed by the producer and fully consumed.
    pub fn is_drained(&self) -> bool {
        let inner = self.shared.lock();
        inner.closed && inner.items.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }
}
