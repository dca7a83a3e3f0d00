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

//! Recorder: one recording's sample pipeline, flushed into transmissions.
//!
//! The chain is built from factory blocks:
//!
//! ```text
//! stream source -> translate+decimate -> resample -> AGC -> to char -> vector -> buffer
//!                                            \-> raw file sink (optional)
//! ```
//!
//! [`Recorder::flush`] runs on the flush timer; [`Recorder::stop`] (or drop)
//! stops the graph and waits for it before returning, after which no further
//! transmission is sent.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info};

use crate::block::{BlockFactory, BlockRef, Connector, RunningGraph};
use crate::buffer::Buffer;
use crate::endpoint::StreamEndpoint;
use crate::error::GraphError;
use crate::transmission::{SinkHandle, Transmission, TransmissionSink};
use crate::types::{
    format_frequency, round_up, Device, Frequency, Recording, SimpleComplex, BLOCK_TRANSFER_GRANULARITY,
    RECORDER_FLUSH_INTERVAL, RECORDER_SAMPLE_RATE_DECIMATOR,
};

/// Settings shared by all recorders of a device generation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    pub flush_interval: Duration,
    /// Dump the pre-normalization stream of every recording.
    pub dump_recording: bool,
    pub work_dir: PathBuf,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            flush_interval: RECORDER_FLUSH_INTERVAL,
            dump_recording: false,
            work_dir: PathBuf::from("."),
        }
    }
}

/// Decimation applied before fine filtering.
#[must_use]
pub fn decimation_factor(sample_rate: Frequency) -> u32 {
    u32::try_from(sample_rate / RECORDER_SAMPLE_RATE_DECIMATOR)
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Samples per flushed batch: one flush interval of `bandwidth`, rounded up.
#[must_use]
pub fn batch_size(bandwidth: Frequency, flush_interval: Duration) -> usize {
    let millis = i64::try_from(flush_interval.as_millis()).unwrap_or(i64::MAX);
    let samples = usize::try_from(bandwidth.saturating_mul(millis) / 1000).unwrap_or(0);
    round_up(samples.max(1), BLOCK_TRANSFER_GRANULARITY)
}

/// Raw dump file for a recording.
#[must_use]
pub fn raw_file_name(work_dir: &Path, device: &Device, recording: &Recording) -> PathBuf {
    work_dir.join(format!(
        "recording_{}_{}_{}_{}.wav",
        device.serial,
        Utc::now().format("%Y%m%d_%H%M%S"),
        recording.frequency,
        recording.bandwidth
    ))
}

#[derive(Debug, Clone, Copy)]
struct DataTimes {
    first: Instant,
    last: Instant,
}

pub struct Recorder {
    recording: Recording,
    buffer: Arc<Buffer<SimpleComplex>>,
    send: SinkHandle,
    times: Mutex<DataTimes>,
    /// `None` once stopped; flush holds this lock so teardown waits for it.
    graph: Mutex<Option<RunningGraph>>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("recording", &self.recording)
            .field("batch_size", &self.buffer.batch_size())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Build and start the recorder graph for `recording`.
    ///
    /// `endpoint` is the processor stream carrying `sample_rate` samples per
    /// second centered on `recording.center_frequency`.
    pub fn new(
        factory: &dyn BlockFactory,
        settings: &RecorderSettings,
        device: &Device,
        endpoint: &StreamEndpoint,
        sample_rate: Frequency,
        recording: Recording,
        send: TransmissionSink,
    ) -> Result<Self, GraphError> {
        info!(
            "start recorder, source: {}, name: {}, frequency: {}, bandwidth: {}, modulation: {}",
            recording.source,
            recording.name,
            format_frequency(recording.frequency),
            format_frequency(recording.bandwidth),
            recording.modulation
        );

        let decimation = decimation_factor(sample_rate);
        let samples_size = batch_size(recording.bandwidth, settings.flush_interval);
        let buffer = Arc::new(Buffer::new(
            format!("recorder {}", format_frequency(recording.frequency)),
            samples_size,
        ));

        let graph = factory.graph("recorder");
        let connector = Connector::new(Arc::clone(&graph));

        let resampler = factory.resampler(sample_rate / Frequency::from(decimation), recording.bandwidth)?;
        let blocks: Vec<BlockRef> = vec![
            factory.stream_source(endpoint)?,
            factory.frequency_translator(sample_rate, recording.shift(), decimation)?,
            Arc::clone(&resampler),
            factory.agc()?,
            factory.complex_to_char(127.0)?,
            factory.stream_to_vector(samples_size)?,
            factory.buffer_sink(Arc::clone(&buffer), recording.bandwidth)?,
        ];
        connector.connect_chain(&blocks)?;

        if settings.dump_recording || device.raw_dump {
            let path = raw_file_name(&settings.work_dir, device, &recording);
            info!("dump recording to {}", path.display());
            connector.connect(&resampler, &factory.file_sink(&path, recording.bandwidth)?)?;
        }

        let now = Instant::now();
        let running = RunningGraph::start(graph)?;

        Ok(Self {
            recording,
            buffer,
            send: SinkHandle(send),
            times: Mutex::new(DataTimes { first: now, last: now }),
            graph: Mutex::new(Some(running)),
        })
    }

    #[must_use]
    pub fn recording(&self) -> &Recording {
        &self.recording
    }

    /// Buffer at the end of the chain.
    #[must_use]
    pub fn buffer(&self) -> &Arc<Buffer<SimpleComplex>> {
        &self.buffer
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.graph().is_some()
    }

    /// Send every complete batch. Never waits for data.
    ///
    /// Returns the number of transmissions sent; a stopped recorder sends none.
    pub fn flush(&self) -> usize {
        let graph = self.graph();
        if graph.is_none() {
            return 0;
        }
        self.times().last = Instant::now();

        let mut sent = 0;
        while self.buffer.pop_batch(|data, _size, timestamp| {
            self.send.send(Transmission::new(&self.recording, timestamp, data));
        }) {
            sent += 1;
        }
        drop(graph);
        sent
    }

    /// Time between the first and the latest flush.
    #[must_use]
    pub fn duration(&self) -> Duration {
        let times = *self.times();
        times.last.duration_since(times.first)
    }

    /// Stop the graph and wait for it. Sub-batch tails are discarded.
    pub fn stop(&self) {
        let mut graph = self.graph();
        if let Some(running) = graph.take() {
            drop(running);
            info!(
                "stop recorder, frequency: {}, time: {} ms",
                format_frequency(self.recording.frequency),
                self.duration().as_millis()
            );
        }
    }

    fn graph(&self) -> MutexGuard<'_, Option<RunningGraph>> {
        self.graph.lock().unwrap_or_else(|poisoned| {
            error!("recorder {}: lifecycle lock poisoned", self.recording.frequency);
            poisoned.into_inner()
        })
    }

    fn times(&self) -> MutexGuard<'_, DataTimes> {
        self.times.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Graph;
    use crate::sim::SimFactory;

    fn recording(frequency: Frequency, bandwidth: Frequency) -> Recording {
        Recording {
            source: "sim-1".to_string(),
            name: String::new(),
            frequency,
            bandwidth,
            modulation: String::new(),
            center_frequency: 145_000_000,
            min_record_time: Duration::ZERO,
            max_noise_time: Duration::ZERO,
        }
    }

    fn capture() -> (TransmissionSink, Arc<Mutex<Vec<Transmission>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink_sent = Arc::clone(&sent);
        (Arc::new(move |t| sink_sent.lock().unwrap().push(t)), sent)
    }

    fn start(factory: &SimFactory, send: TransmissionSink) -> Recorder {
        let device = Device::new("sim-1", "sim", 2_048_000);
        Recorder::new(
            factory,
            &RecorderSettings::default(),
            &device,
            &StreamEndpoint::for_processor("sim-1", 0),
            2_048_000,
            recording(145_100_000, 48_000),
            send,
        )
        .unwrap()
    }

    #[test]
    fn test_decimation_factor() {
        assert_eq!(decimation_factor(2_048_000), 2);
        assert_eq!(decimation_factor(20_480_000), 20);
        assert_eq!(decimation_factor(250_000), 1);
    }

    #[test]
    fn test_batch_size_rounds_to_granularity() {
        assert_eq!(batch_size(48_000, Duration::from_millis(1000)), 49_152);
        assert_eq!(batch_size(4096, Duration::from_millis(1000)), 4096);
        assert_eq!(batch_size(10, Duration::from_millis(1)), 4096);
    }

    #[test]
    fn test_recorder_builds_chain() {
        let factory = SimFactory::new();
        let (send, _) = capture();
        let recorder = start(&factory, send);

        assert!(recorder.is_running());
        assert_eq!(recorder.recording().shift(), 100_000);
        assert_eq!(recorder.buffer().batch_size(), 49_152);
        let graphs = factory.graphs();
        let graph = graphs.iter().find(|g| g.name() == "recorder").unwrap();
        assert!(graph.is_running());
        assert_eq!(graph.edge_count(), 6);
    }

    #[test]
    fn test_flush_sends_full_batches_only() {
        let factory = SimFactory::new();
        let (send, sent) = capture();
        let recorder = start(&factory, send);
        let batch = recorder.buffer().batch_size();

        assert_eq!(recorder.flush(), 0);
        recorder.buffer().push(&vec![SimpleComplex::new(1, 2); batch + 10], Utc::now());
        assert_eq!(recorder.flush(), 1);
        assert_eq!(recorder.flush(), 0);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frequency, 145_100_000);
        assert_eq!(sent[0].source, "sim-1");
        assert_eq!(sent[0].samples().unwrap().len(), batch);
    }

    #[test]
    fn test_stopped_recorder_does_not_flush() {
        let factory = SimFactory::new();
        let (send, sent) = capture();
        let recorder = start(&factory, send);
        let batch = recorder.buffer().batch_size();
        recorder.buffer().push(&vec![SimpleComplex::new(0, 0); batch], Utc::now());

        recorder.stop();
        assert!(!recorder.is_running());
        assert_eq!(recorder.flush(), 0);
        assert!(sent.lock().unwrap().is_empty());
        assert!(factory.graphs().iter().all(|g| !g.is_running()));
    }

    #[test]
    fn test_raw_dump_taps_resampler() {
        let dir = std::env::temp_dir().join(format!("sdr-core-dump-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let factory = SimFactory::new();
        let (send, _) = capture();
        let settings = RecorderSettings {
            dump_recording: true,
            work_dir: dir.clone(),
            ..RecorderSettings::default()
        };
        let device = Device::new("sim-1", "sim", 2_048_000);
        let recorder = Recorder::new(
            &factory,
            &settings,
            &device,
            &StreamEndpoint::for_processor("sim-1", 0),
            2_048_000,
            recording(145_100_000, 48_000),
            send,
        )
        .unwrap();

        let graphs = factory.graphs();
        let graph = graphs.iter().find(|g| g.name() == "recorder").unwrap();
        assert_eq!(graph.edge_count(), 7);
        drop(recorder);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
