// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded sample accumulator between the capture path and the flush timer.
//!
//! The capture path calls [`Buffer::push`] with whatever sample counts the graph
//! produces; the flush timer calls [`Buffer::pop_batch`] and only ever sees
//! complete batches of exactly [`Buffer::batch_size`] samples.
//!
//! Samples live in a `ringbuf` heap ring split into producer and consumer
//! halves. Only the batch start times are kept beside it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::warn;
use ringbuf::{Consumer, HeapRb, Producer};

/// Completed batches kept while the consumer is behind; older ones are dropped.
const MAX_READY_BATCHES: usize = 8;

/// One flushed batch and the capture time of its first sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch<T> {
    pub samples: Vec<T>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BatchTimes {
    /// Samples in the ring after the last complete batch.
    pending: usize,
    pending_since: Option<DateTime<Utc>>,
    ready: VecDeque<DateTime<Utc>>,
    dropped: u64,
}

/// Thread-safe fixed-batch accumulator.
///
/// Lock order is `times` first, then `producer` or `consumer`.
pub struct Buffer<T> {
    label: String,
    batch_size: usize,
    times: Mutex<BatchTimes>,
    producer: Mutex<Producer<T, Arc<HeapRb<T>>>>,
    consumer: Mutex<Consumer<T, Arc<HeapRb<T>>>>,
}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label)
            .field("batch_size", &self.batch_size)
            .field("times", &self.times)
            .finish_non_exhaustive()
    }
}

impl<T: Copy> Buffer<T> {
    /// Create a buffer delivering batches of `batch_size` samples.
    pub fn new(label: impl Into<String>, batch_size: usize) -> Self {
        assert!(batch_size > 0, "buffer batch size must be positive");
        // Room for the full backlog plus one partial batch.
        let ring = HeapRb::<T>::new(batch_size * (MAX_READY_BATCHES + 1));
        let (producer, consumer) = ring.split();
        Self {
            label: label.into(),
            batch_size,
            times: Mutex::new(BatchTimes::default()),
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append samples captured at `timestamp`.
    ///
    /// Pushing an empty slice is a programming error.
    pub fn push(&self, samples: &[T], timestamp: DateTime<Utc>) {
        assert!(!samples.is_empty(), "push to '{}' with no samples", self.label);

        let mut times = self.times();
        let mut producer = relock(&self.producer, &self.label);
        for &sample in samples {
            if times.pending == 0 {
                times.pending_since = Some(timestamp);
            }
            if producer.push(sample).is_err() {
                warn!("{}: sample ring full, sample lost", self.label);
                continue;
            }
            times.pending += 1;

            if times.pending == self.batch_size {
                times.pending = 0;
                let since = times.pending_since.take().unwrap_or(timestamp);
                times.ready.push_back(since);

                if times.ready.len() > MAX_READY_BATCHES {
                    self.discard_oldest(&mut times);
                }
            }
        }
    }

    fn discard_oldest(&self, times: &mut BatchTimes) {
        let mut consumer = relock(&self.consumer, &self.label);
        for _ in 0..self.batch_size {
            consumer.pop();
        }
        times.ready.pop_front();
        times.dropped += 1;
        warn!("{}: consumer behind, dropped oldest batch ({} total)", self.label, times.dropped);
    }

    /// Deliver the oldest complete batch to `callback`, if there is one.
    ///
    /// Returns `true` when a batch was delivered. The callback runs after the
    /// batch has been removed, so the producer is never blocked by it.
    pub fn pop_batch<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&[T], usize, DateTime<Utc>),
    {
        let batch = {
            let mut times = self.times();
            times.ready.pop_front().map(|timestamp| {
                let mut consumer = relock(&self.consumer, &self.label);
                let samples: Vec<T> = (0..self.batch_size).filter_map(|_| consumer.pop()).collect();
                SampleBatch { samples, timestamp }
            })
        };
        match batch {
            Some(batch) => {
                callback(&batch.samples, batch.samples.len(), batch.timestamp);
                true
            }
            None => false,
        }
    }

    /// Samples accumulated towards the next batch.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.times().pending
    }

    /// Complete batches waiting for the consumer.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.times().ready.len()
    }

    /// Samples held by the ring, complete batches and the pending tail.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        relock(&self.consumer, &self.label).len()
    }

    #[must_use]
    pub fn dropped_batches(&self) -> u64 {
        self.times().dropped
    }

    fn times(&self) -> MutexGuard<'_, BatchTimes> {
        relock(&self.times, &self.label)
    }
}

fn relock<'a, S>(mutex: &'a Mutex<S>, label: &str) -> MutexGuard<'a, S> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{}: buffer lock poisoned, recovering", label);
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_partial_batch_is_not_delivered() {
        let buffer = Buffer::new("test", 4);
        buffer.push(&[1, 2, 3], Utc::now());
        assert!(!buffer.pop_batch(|_, _, _| panic!("partial batch delivered")));
        assert_eq!(buffer.pending_len(), 3);
    }

    #[test]
    fn test_batch_delivered_once() {
        let buffer = Buffer::new("test", 4);
        let first = Utc::now();
        buffer.push(&[1, 2], first);
        buffer.push(&[3, 4, 5], Utc::now());

        let mut delivered = Vec::new();
        assert!(buffer.pop_batch(|data, size, timestamp| {
            assert_eq!(size, 4);
            assert_eq!(timestamp, first);
            delivered.extend_from_slice(data);
        }));
        assert_eq!(delivered, vec![1, 2, 3, 4]);
        assert!(!buffer.pop_batch(|_, _, _| panic!("batch delivered twice")));
        assert_eq!(buffer.pending_len(), 1);
    }

    #[test]
    fn test_large_push_splits_into_batches() {
        let buffer = Buffer::new("test", 3);
        buffer.push(&[0u8; 10], Utc::now());
        assert_eq!(buffer.ready_len(), 3);
        assert_eq!(buffer.pending_len(), 1);
        assert_eq!(buffer.stored_len(), 10);
    }

    #[test]
    fn test_backlog_drops_oldest() {
        let buffer = Buffer::new("test", 1);
        for i in 0..(MAX_READY_BATCHES + 2) {
            buffer.push(&[i], Utc::now());
        }
        assert_eq!(buffer.ready_len(), MAX_READY_BATCHES);
        assert_eq!(buffer.dropped_batches(), 2);
        buffer.pop_batch(|data, _, _| assert_eq!(data, &[2]));
    }

    #[test]
    fn test_backlog_keeps_partial_batch_and_order() {
        let buffer = Buffer::new("test", 4);
        let values: Vec<u16> = (0..4 * (MAX_READY_BATCHES as u16 + 3) + 2).collect();
        buffer.push(&values, Utc::now());

        assert_eq!(buffer.ready_len(), MAX_READY_BATCHES);
        assert_eq!(buffer.dropped_batches(), 3);
        assert_eq!(buffer.pending_len(), 2);
        assert_eq!(buffer.stored_len(), 4 * MAX_READY_BATCHES + 2);

        let mut first = Vec::new();
        buffer.pop_batch(|data, _, _| first.extend_from_slice(data));
        assert_eq!(first, vec![12, 13, 14, 15]);

        // the partial tail completes in place after a pop frees ring space
        buffer.push(&[900, 901], Utc::now());
        let mut batches = Vec::new();
        while buffer.pop_batch(|data, _, _| batches.push(data.to_vec())) {}
        assert_eq!(batches.last().unwrap(), &vec![values[values.len() - 2], values[values.len() - 1], 900, 901]);
        assert_eq!(buffer.stored_len(), 0);
    }

    #[test]
    #[should_panic(expected = "no samples")]
    fn test_empty_push_panics() {
        let buffer: Buffer<u8> = Buffer::new("test", 4);
        buffer.push(&[], Utc::now());
    }

    #[test]
    fn test_concurrent_push_and_pop() {
        let buffer = Arc::new(Buffer::new("test", 64));
        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for chunk in (0u32..64 * 8).collect::<Vec<_>>().chunks(7) {
                    buffer.push(chunk, Utc::now());
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 64 * 8 {
            buffer.pop_batch(|data, size, _| {
                assert_eq!(size, 64);
                seen.extend_from_slice(data);
            });
            if producer.is_finished() && buffer.ready_len() == 0 {
                break;
            }
        }
        producer.join().unwrap();
        while buffer.pop_batch(|data, _, _| seen.extend_from_slice(data)) {}

        assert_eq!(seen, (0u32..64 * 8).collect::<Vec<_>>());
    }
}
