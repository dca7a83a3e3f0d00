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

//! In-process publish/subscribe of complex sample streams.
//!
//! Every subscriber owns a ring buffer fed by [`StreamHub::publish`]. A slow
//! subscriber loses the samples that do not fit; publishers never block.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futuresdr::num_complex::Complex;
use log::{debug, warn};
use ringbuf::{Consumer, HeapRb, Producer};

/// Samples buffered per subscriber (about 128 ms at 2 MS/s).
pub const SUBSCRIBER_CAPACITY: usize = 256 * 1024;

type SampleProducer = Producer<Complex<f32>, Arc<HeapRb<Complex<f32>>>>;
type SampleConsumer = Consumer<Complex<f32>, Arc<HeapRb<Complex<f32>>>>;

struct Subscriber {
    id: u64,
    producer: SampleProducer,
    dropped: u64,
}

#[derive(Default)]
pub struct StreamHub {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHub")
            .field("topics", &self.topics().len())
            .finish_non_exhaustive()
    }
}

impl StreamHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `samples` to every subscriber of `address`; returns how many received them.
    pub fn publish(&self, address: &str, samples: &[Complex<f32>]) -> usize {
        let mut topics = self.topics();
        let Some(subscribers) = topics.get_mut(address) else {
            return 0;
        };
        for subscriber in subscribers.iter_mut() {
            let mut pushed = 0;
            for sample in samples {
                if subscriber.producer.push(*sample).is_err() {
                    break;
                }
                pushed += 1;
            }
            if pushed < samples.len() {
                subscriber.dropped += (samples.len() - pushed) as u64;
                debug!("{}: subscriber {} behind, {} samples dropped", address, subscriber.id, subscriber.dropped);
            }
        }
        subscribers.len()
    }

    /// Start receiving what is published on `address` from now on.
    pub fn subscribe(self: &Arc<Self>, address: &str) -> Subscription {
        let (producer, consumer) = HeapRb::<Complex<f32>>::new(SUBSCRIBER_CAPACITY).split();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics().entry(address.to_string()).or_default().push(Subscriber {
            id,
            producer,
            dropped: 0,
        });
        Subscription {
            hub: Arc::clone(self),
            address: address.to_string(),
            id,
            consumer,
        }
    }

    #[must_use]
    pub fn subscribers(&self, address: &str) -> usize {
        self.topics().get(address).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, address: &str, id: u64) {
        let mut topics = self.topics();
        if let Some(subscribers) = topics.get_mut(address) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                topics.remove(address);
            }
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.topics.lock().unwrap_or_else(|poisoned| {
            warn!("stream hub lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Receiving end of one subscription; unsubscribes on drop.
pub struct Subscription {
    hub: Arc<StreamHub>,
    address: String,
    id: u64,
    consumer: SampleConsumer,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("address", &self.address)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Move buffered samples into `output`; returns the count moved.
    pub fn pop_into(&mut self, output: &mut [Complex<f32>]) -> usize {
        let mut produced = 0;
        for slot in output.iter_mut() {
            match self.consumer.pop() {
                Some(sample) => {
                    *slot = sample;
                    produced += 1;
                }
                None => break,
            }
        }
        produced
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.address, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<Complex<f32>> {
        (0..n).map(|i| Complex::new(i as f32, 0.0)).collect()
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let hub = Arc::new(StreamHub::new());
        assert_eq!(hub.publish("inproc://a", &ramp(4)), 0);

        let mut first = hub.subscribe("inproc://a");
        let mut second = hub.subscribe("inproc://a");
        let _other = hub.subscribe("inproc://b");
        assert_eq!(hub.publish("inproc://a", &ramp(4)), 2);

        let mut out = vec![Complex::default(); 8];
        assert_eq!(first.pop_into(&mut out), 4);
        assert_eq!(out[3], Complex::new(3.0, 0.0));
        assert_eq!(second.len(), 4);
        assert_eq!(second.pop_into(&mut out[..2]), 2);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = Arc::new(StreamHub::new());
        let subscription = hub.subscribe("inproc://a");
        assert_eq!(hub.subscribers("inproc://a"), 1);
        drop(subscription);
        assert_eq!(hub.subscribers("inproc://a"), 0);
        assert_eq!(hub.publish("inproc://a", &ramp(1)), 0);
    }

    #[test]
    fn test_slow_subscriber_keeps_oldest_samples() {
        let hub = Arc::new(StreamHub::new());
        let mut subscription = hub.subscribe("inproc://a");
        hub.publish("inproc://a", &ramp(SUBSCRIBER_CAPACITY));
        hub.publish("inproc://a", &[Complex::new(-1.0, -1.0)]);
        assert_eq!(subscription.len(), SUBSCRIBER_CAPACITY);

        let mut out = vec![Complex::default(); SUBSCRIBER_CAPACITY];
        subscription.pop_into(&mut out);
        assert_eq!(out[SUBSCRIBER_CAPACITY - 1], Complex::new((SUBSCRIBER_CAPACITY - 1) as f32, 0.0));
        assert!(subscription.is_empty());
    }
}
