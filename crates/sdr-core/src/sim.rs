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

//! In-process block runtime.
//!
//! [`SimFactory`] builds blocks that carry no DSP. Graphs validate their wiring
//! exactly like a real runtime would (port bounds, single producer per input,
//! rewiring only while locked) and, once started, a driver thread ticks every
//! [`TICK`]. In synthetic mode each tick pushes a test tone into buffer and
//! file sinks and reports the configured [`SimTransmitter`]s from detectors.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, error, warn};

use crate::block::{Block, BlockFactory, BlockId, BlockRef, Graph, Port};
use crate::buffer::Buffer;
use crate::capability::{CapabilityQuery, DeviceArgs, DeviceCapabilities, GainRange};
use crate::endpoint::StreamEndpoint;
use crate::error::{DeviceError, GraphError};
use crate::processor::{Detection, DetectionCallback};
use crate::types::{Frequency, FrequencyRange, Gain, SimpleComplex};

/// Driver thread period.
pub const TICK: Duration = Duration::from_millis(50);

/// A synthetic emitter seen by detectors whose range contains it.
#[derive(Debug, Clone, PartialEq)]
pub struct SimTransmitter {
    pub frequency: Frequency,
    pub level: f32,
    pub active_for: Duration,
    /// Zero means always on.
    pub silent_for: Duration,
}

impl SimTransmitter {
    #[must_use]
    pub fn continuous(frequency: Frequency, level: f32) -> Self {
        Self {
            frequency,
            level,
            active_for: Duration::from_secs(1),
            silent_for: Duration::ZERO,
        }
    }

    fn is_active(&self, elapsed: Duration) -> bool {
        if self.silent_for.is_zero() {
            return true;
        }
        let period = (self.active_for + self.silent_for).as_millis().max(1);
        elapsed.as_millis() % period < self.active_for.as_millis()
    }
}

#[derive(Debug, Clone)]
struct SimConfig {
    synthetic: bool,
    transmitters: Vec<SimTransmitter>,
    failing: BTreeSet<String>,
    epoch: Instant,
}

/// What a simulated block stands in for.
pub enum SimKind {
    WidebandSource {
        serial: String,
        driver: String,
        sample_rate: Frequency,
        center_frequency: Frequency,
        gains: Vec<Gain>,
    },
    Selector {
        outputs: usize,
    },
    FrequencyTranslator {
        sample_rate: Frequency,
        shift: Frequency,
        decimation: u32,
    },
    Resampler {
        input_rate: Frequency,
        output_rate: Frequency,
    },
    Agc,
    ComplexToChar {
        scale: f32,
    },
    StreamToVector {
        items: usize,
    },
    StreamSink {
        endpoint: StreamEndpoint,
    },
    StreamSource {
        endpoint: StreamEndpoint,
    },
    PowerDetector {
        range: FrequencyRange,
        center_frequency: Frequency,
        callback: DetectionCallback,
    },
    FileSink {
        writer: Mutex<Option<WavWriter<BufWriter<File>>>>,
        sample_rate: Frequency,
    },
    BufferSink {
        buffer: Arc<Buffer<SimpleComplex>>,
        sample_rate: Frequency,
    },
}

impl SimKind {
    fn label(&self) -> &'static str {
        match self {
            Self::WidebandSource { .. } => "sdr source",
            Self::Selector { .. } => "selector",
            Self::FrequencyTranslator { .. } => "frequency translator",
            Self::Resampler { .. } => "resampler",
            Self::Agc => "agc",
            Self::ComplexToChar { .. } => "complex to char",
            Self::StreamToVector { .. } => "stream to vector",
            Self::StreamSink { .. } => "stream sink",
            Self::StreamSource { .. } => "stream source",
            Self::PowerDetector { .. } => "power detector",
            Self::FileSink { .. } => "file sink",
            Self::BufferSink { .. } => "buffer sink",
        }
    }

    /// (inputs, outputs)
    fn ports(&self) -> (usize, usize) {
        match self {
            Self::WidebandSource { .. } | Self::StreamSource { .. } => (0, 1),
            Self::Selector { outputs } => (1, *outputs),
            Self::StreamSink { .. } | Self::PowerDetector { .. } | Self::FileSink { .. } | Self::BufferSink { .. } => {
                (1, 0)
            }
            _ => (1, 1),
        }
    }
}

impl fmt::Debug for SimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
pub struct SimBlock {
    id: BlockId,
    name: String,
    kind: SimKind,
}

impl SimBlock {
    #[must_use]
    pub fn kind(&self) -> &SimKind {
        &self.kind
    }
}

impl Block for SimBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn sim_block(block: &BlockRef) -> Result<&SimBlock, GraphError> {
    block
        .as_any()
        .downcast_ref::<SimBlock>()
        .ok_or_else(|| GraphError::ForeignBlock(block.name().to_string()))
}

/// Block factory of the simulated runtime.
#[derive(Debug)]
pub struct SimFactory {
    config: Arc<SimConfig>,
    graphs: Mutex<Vec<Weak<SimGraph>>>,
}

impl Default for SimFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFactory {
    /// A quiet runtime: graphs validate and run but produce no data.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Arc::new(SimConfig {
                synthetic: false,
                transmitters: Vec::new(),
                failing: BTreeSet::new(),
                epoch: Instant::now(),
            }),
            graphs: Mutex::new(Vec::new()),
        }
    }

    /// A runtime producing samples and the detections of `transmitters`.
    #[must_use]
    pub fn synthetic(transmitters: Vec<SimTransmitter>) -> Self {
        let mut factory = Self::new();
        let config = Arc::make_mut(&mut factory.config);
        config.synthetic = true;
        config.transmitters = transmitters;
        factory
    }

    /// Opening the source of `serial` will fail.
    #[must_use]
    pub fn with_failing_device(mut self, serial: &str) -> Self {
        Arc::make_mut(&mut self.config).failing.insert(serial.to_string());
        self
    }

    /// Graphs created by this factory that are still alive.
    #[must_use]
    pub fn graphs(&self) -> Vec<Arc<SimGraph>> {
        let mut graphs = self.graphs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        graphs.retain(|graph| graph.strong_count() > 0);
        graphs.iter().filter_map(Weak::upgrade).collect()
    }

    fn block(name: String, kind: SimKind) -> BlockRef {
        Arc::new(SimBlock {
            id: BlockId::next(),
            name,
            kind,
        })
    }
}

fn invalid(block: &str, reason: impl Into<String>) -> GraphError {
    GraphError::Creation {
        block: block.to_string(),
        reason: reason.into(),
    }
}

impl BlockFactory for SimFactory {
    fn graph(&self, name: &str) -> Arc<dyn Graph> {
        let graph = Arc::new(SimGraph::new(name, Arc::clone(&self.config)));
        self.graphs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::downgrade(&graph));
        graph
    }

    fn wideband_source(
        &self,
        serial: &str,
        driver: &str,
        sample_rate: Frequency,
        center_frequency: Frequency,
        gains: &[Gain],
    ) -> Result<BlockRef, GraphError> {
        if self.config.failing.contains(serial) {
            return Err(invalid("sdr source", format!("open device failed, serial: {serial}")));
        }
        if sample_rate <= 0 {
            return Err(invalid("sdr source", format!("invalid sample rate {sample_rate}")));
        }
        Ok(Self::block(
            format!("sdr source {serial}"),
            SimKind::WidebandSource {
                serial: serial.to_string(),
                driver: driver.to_string(),
                sample_rate,
                center_frequency,
                gains: gains.to_vec(),
            },
        ))
    }

    fn selector(&self, outputs: usize) -> Result<BlockRef, GraphError> {
        if outputs == 0 {
            return Err(invalid("selector", "no outputs"));
        }
        Ok(Self::block("selector".to_string(), SimKind::Selector { outputs }))
    }

    fn frequency_translator(&self, sample_rate: Frequency, shift: Frequency, decimation: u32) -> Result<BlockRef, GraphError> {
        if decimation == 0 || sample_rate <= 0 {
            return Err(invalid("frequency translator", "sample rate and decimation must be positive"));
        }
        Ok(Self::block(
            format!("frequency translator {shift}"),
            SimKind::FrequencyTranslator {
                sample_rate,
                shift,
                decimation,
            },
        ))
    }

    fn resampler(&self, input_rate: Frequency, output_rate: Frequency) -> Result<BlockRef, GraphError> {
        if input_rate <= 0 || output_rate <= 0 {
            return Err(invalid("resampler", format!("invalid rates {input_rate} -> {output_rate}")));
        }
        Ok(Self::block(
            "resampler".to_string(),
            SimKind::Resampler {
                input_rate,
                output_rate,
            },
        ))
    }

    fn agc(&self) -> Result<BlockRef, GraphError> {
        Ok(Self::block("agc".to_string(), SimKind::Agc))
    }

    fn complex_to_char(&self, scale: f32) -> Result<BlockRef, GraphError> {
        Ok(Self::block("complex to char".to_string(), SimKind::ComplexToChar { scale }))
    }

    fn stream_to_vector(&self, items: usize) -> Result<BlockRef, GraphError> {
        if items == 0 {
            return Err(invalid("stream to vector", "empty vector"));
        }
        Ok(Self::block("stream to vector".to_string(), SimKind::StreamToVector { items }))
    }

    fn stream_sink(&self, endpoint: &StreamEndpoint) -> Result<BlockRef, GraphError> {
        Ok(Self::block(
            format!("stream sink {endpoint}"),
            SimKind::StreamSink {
                endpoint: endpoint.clone(),
            },
        ))
    }

    fn stream_source(&self, endpoint: &StreamEndpoint) -> Result<BlockRef, GraphError> {
        Ok(Self::block(
            format!("stream source {endpoint}"),
            SimKind::StreamSource {
                endpoint: endpoint.clone(),
            },
        ))
    }

    fn power_detector(
        &self,
        range: FrequencyRange,
        center_frequency: Frequency,
        _sample_rate: Frequency,
        callback: DetectionCallback,
    ) -> Result<BlockRef, GraphError> {
        if !range.is_valid() {
            return Err(invalid("power detector", format!("invalid range {range}")));
        }
        Ok(Self::block(
            format!("power detector {range}"),
            SimKind::PowerDetector {
                range,
                center_frequency,
                callback,
            },
        ))
    }

    fn file_sink(&self, path: &Path, sample_rate: Frequency) -> Result<BlockRef, GraphError> {
        let spec = WavSpec {
            channels: 2,
            sample_rate: u32::try_from(sample_rate).map_err(|e| invalid("file sink", e.to_string()))?,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec).map_err(|e| invalid("file sink", format!("{}: {e}", path.display())))?;
        Ok(Self::block(
            format!("file sink {}", path.display()),
            SimKind::FileSink {
                writer: Mutex::new(Some(writer)),
                sample_rate,
            },
        ))
    }

    fn buffer_sink(&self, buffer: Arc<Buffer<SimpleComplex>>, sample_rate: Frequency) -> Result<BlockRef, GraphError> {
        if sample_rate <= 0 {
            return Err(invalid("buffer sink", format!("invalid sample rate {sample_rate}")));
        }
        Ok(Self::block(
            format!("buffer sink {}", buffer.label()),
            SimKind::BufferSink { buffer, sample_rate },
        ))
    }
}

#[derive(Debug, Clone)]
struct SimEdge {
    from: BlockRef,
    from_port: Port,
    to: BlockRef,
    to_port: Port,
}

impl SimEdge {
    fn matches(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> bool {
        self.from.id() == from.id() && self.from_port == from_port && self.to.id() == to.id() && self.to_port == to_port
    }
}

#[derive(Debug, Default)]
struct Topology {
    edges: Vec<SimEdge>,
    lock_depth: usize,
    running: bool,
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: Arc<SimConfig>,
    topology: Mutex<Topology>,
}

impl Shared {
    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(|poisoned| {
            error!("{}: topology lock poisoned", self.name);
            poisoned.into_inner()
        })
    }

    /// Blocks with a producer, or `None` while the graph is locked.
    fn fed_blocks(&self) -> Option<Vec<BlockRef>> {
        let topology = self.topology();
        if topology.lock_depth > 0 {
            return None;
        }
        let mut seen = BTreeSet::new();
        Some(
            topology
                .edges
                .iter()
                .filter(|edge| seen.insert(edge.to.id()))
                .map(|edge| Arc::clone(&edge.to))
                .collect(),
        )
    }

    fn drive(&self, block: &BlockRef, phase: &mut f32) {
        let Ok(block) = sim_block(block) else {
            return;
        };
        match &block.kind {
            SimKind::BufferSink { buffer, sample_rate } if self.config.synthetic => {
                let samples = tone(samples_per_tick(*sample_rate), phase);
                if !samples.is_empty() {
                    buffer.push(&samples, Utc::now());
                }
            }
            SimKind::FileSink { writer, sample_rate } if self.config.synthetic => {
                let mut writer = writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(wav) = writer.as_mut() {
                    let written = tone(samples_per_tick(*sample_rate), phase)
                        .iter()
                        .try_for_each(|s| {
                            wav.write_sample(i16::from(s.re) << 8)?;
                            wav.write_sample(i16::from(s.im) << 8)
                        });
                    if let Err(e) = written {
                        warn!("{}: {}: write failed, closing: {}", self.name, block.name, e);
                        *writer = None;
                    }
                }
            }
            SimKind::PowerDetector { range, callback, .. } => {
                let elapsed = self.config.epoch.elapsed();
                let detections: Vec<Detection> = self
                    .config
                    .transmitters
                    .iter()
                    .filter(|t| range.contains(t.frequency) && t.is_active(elapsed))
                    .map(|t| Detection {
                        frequency: t.frequency,
                        level: t.level,
                    })
                    .collect();
                if !detections.is_empty() {
                    callback(&detections);
                }
            }
            _ => {}
        }
    }
}

fn samples_per_tick(sample_rate: Frequency) -> usize {
    let millis = i64::try_from(TICK.as_millis()).unwrap_or(0);
    usize::try_from(sample_rate * millis / 1000).unwrap_or(0)
}

#[allow(clippy::cast_possible_truncation, reason = "tone amplitude fits in i8")]
fn tone(count: usize, phase: &mut f32) -> Vec<SimpleComplex> {
    (0..count)
        .map(|_| {
            *phase = (*phase + 0.05) % std::f32::consts::TAU;
            SimpleComplex::new((phase.cos() * 100.0) as i8, (phase.sin() * 100.0) as i8)
        })
        .collect()
}

fn run(shared: &Shared, stop: &Receiver<()>) {
    let mut phase = 0.0_f32;
    loop {
        match stop.recv_timeout(TICK) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        // Callbacks run without the topology lock held.
        let Some(blocks) = shared.fed_blocks() else {
            continue;
        };
        for block in &blocks {
            shared.drive(block, &mut phase);
        }
    }
    debug!("{}: driver thread exited", shared.name);
}

#[derive(Debug, Default)]
struct Worker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Graph of the simulated runtime.
#[derive(Debug)]
pub struct SimGraph {
    shared: Arc<Shared>,
    worker: Mutex<Worker>,
}

impl SimGraph {
    fn new(name: &str, config: Arc<SimConfig>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                config,
                topology: Mutex::new(Topology::default()),
            }),
            worker: Mutex::new(Worker::default()),
        }
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.shared.topology().edges.len()
    }

    fn worker(&self) -> MutexGuard<'_, Worker> {
        self.worker.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_rewire(&self, topology: &Topology) -> Result<(), GraphError> {
        if topology.running && topology.lock_depth == 0 {
            return Err(GraphError::NotLocked(self.shared.name.clone()));
        }
        Ok(())
    }
}

impl Graph for SimGraph {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn connect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
        let (_, outputs) = sim_block(from)?.kind.ports();
        let (inputs, _) = sim_block(to)?.kind.ports();
        if from_port >= outputs {
            return Err(GraphError::InvalidPort {
                block: from.name().to_string(),
                port: from_port,
            });
        }
        if to_port >= inputs {
            return Err(GraphError::InvalidPort {
                block: to.name().to_string(),
                port: to_port,
            });
        }

        let mut topology = self.shared.topology();
        self.check_rewire(&topology)?;
        if topology.edges.iter().any(|e| e.to.id() == to.id() && e.to_port == to_port) {
            return Err(GraphError::PortInUse {
                block: to.name().to_string(),
                port: to_port,
            });
        }
        topology.edges.push(SimEdge {
            from: Arc::clone(from),
            from_port,
            to: Arc::clone(to),
            to_port,
        });
        Ok(())
    }

    fn disconnect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
        let mut topology = self.shared.topology();
        self.check_rewire(&topology)?;
        let index = topology
            .edges
            .iter()
            .position(|e| e.matches(from, from_port, to, to_port))
            .ok_or_else(|| GraphError::NotConnected {
                from: from.name().to_string(),
                from_port,
                to: to.name().to_string(),
                to_port,
            })?;
        topology.edges.remove(index);
        Ok(())
    }

    fn lock(&self) {
        self.shared.topology().lock_depth += 1;
    }

    fn unlock(&self) -> Result<(), GraphError> {
        let mut topology = self.shared.topology();
        if topology.lock_depth == 0 {
            return Err(GraphError::NotLocked(self.shared.name.clone()));
        }
        topology.lock_depth -= 1;
        if topology.lock_depth == 0 {
            debug!("{}: apply topology, {} connections", self.shared.name, topology.edges.len());
        }
        Ok(())
    }

    fn start(&self) -> Result<(), GraphError> {
        let mut worker = self.worker();
        if worker.stop.is_some() {
            return Err(GraphError::AlreadyRunning(self.shared.name.clone()));
        }
        if let Some(handle) = worker.handle.take() {
            let _ = handle.join();
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("sim-{}", self.shared.name))
            .spawn(move || run(&shared, &stop_rx))
            .map_err(|e| invalid(&self.shared.name, format!("spawn driver thread: {e}")))?;

        self.shared.topology().running = true;
        worker.stop = Some(stop_tx);
        worker.handle = Some(handle);
        debug!("{}: started", self.shared.name);
        Ok(())
    }

    fn stop(&self) {
        if self.worker().stop.take().is_some() {
            self.shared.topology().running = false;
        }
    }

    fn wait(&self) {
        let handle = self.worker().handle.take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("{}: wait called from the driver thread", self.shared.name);
                return;
            }
            if handle.join().is_err() {
                error!("{}: driver thread panicked", self.shared.name);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.worker().stop.is_some()
    }
}

impl Drop for SimGraph {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

/// Capability query answering for virtual devices.
#[derive(Debug, Clone, Default)]
pub struct SimCapabilities {
    devices: Vec<(DeviceArgs, Option<DeviceCapabilities>)>,
}

impl SimCapabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_device(mut self, serial: &str, sample_rates: &[Frequency]) -> Self {
        let capabilities = DeviceCapabilities {
            sample_rates: sample_rates.iter().copied().collect(),
            gains: vec![GainRange {
                name: "TUNER".to_string(),
                minimum: 0.0,
                maximum: 49.6,
                step: 0.1,
            }],
        };
        self.devices.push((sim_args(serial), Some(capabilities)));
        self
    }

    /// Enumerated but failing every capability query.
    #[must_use]
    pub fn with_broken_device(mut self, serial: &str) -> Self {
        self.devices.push((sim_args(serial), None));
        self
    }

    /// Two virtual receivers used by demo mode.
    #[must_use]
    pub fn demo() -> Self {
        Self::new()
            .with_device("sim-0001", &[1_024_000, 2_048_000, 2_400_000])
            .with_device("sim-0002", &[2_000_000, 20_000_000])
    }
}

fn sim_args(serial: &str) -> DeviceArgs {
    DeviceArgs {
        driver: "sim".to_string(),
        serial: serial.to_string(),
    }
}

impl CapabilityQuery for SimCapabilities {
    fn enumerate(&self) -> Result<Vec<DeviceArgs>, DeviceError> {
        Ok(self.devices.iter().map(|(args, _)| args.clone()).collect())
    }

    fn query(&self, args: &DeviceArgs) -> Result<DeviceCapabilities, DeviceError> {
        self.devices
            .iter()
            .find(|(known, _)| known == args)
            .and_then(|(_, capabilities)| capabilities.clone())
            .ok_or_else(|| DeviceError::Open {
                serial: args.serial.clone(),
                reason: "device not responding".to_string(),
            })
    }
}

/// Transmitters heard by the demo devices.
#[must_use]
pub fn demo_transmitters() -> Vec<SimTransmitter> {
    vec![
        SimTransmitter {
            frequency: 145_500_000,
            level: -20.0,
            active_for: Duration::from_secs(6),
            silent_for: Duration::from_secs(10),
        },
        SimTransmitter {
            frequency: 145_800_000,
            level: -25.0,
            active_for: Duration::from_secs(3),
            silent_for: Duration::from_secs(7),
        },
        SimTransmitter {
            frequency: 152_000_000,
            level: -15.0,
            active_for: Duration::from_secs(8),
            silent_for: Duration::from_secs(8),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_selector_ports_are_bounded() {
        let factory = SimFactory::new();
        let graph = factory.graph("test");
        let selector = factory.selector(2).unwrap();
        let agc = factory.agc().unwrap();

        assert!(graph.connect(&selector, 1, &agc, 0).is_ok());
        assert!(matches!(
            graph.connect(&selector, 2, &factory.agc().unwrap(), 0),
            Err(GraphError::InvalidPort { port: 2, .. })
        ));
    }

    #[test]
    fn test_input_port_accepts_one_producer() {
        let factory = SimFactory::new();
        let graph = factory.graph("test");
        let a = factory.agc().unwrap();
        let b = factory.agc().unwrap();
        let sink = factory.agc().unwrap();

        graph.connect(&a, 0, &sink, 0).unwrap();
        assert!(matches!(graph.connect(&b, 0, &sink, 0), Err(GraphError::PortInUse { .. })));
        // Output ports fan out.
        graph.connect(&a, 0, &b, 0).unwrap();
    }

    #[test]
    fn test_running_graph_rewires_only_while_locked() {
        let factory = SimFactory::new();
        let graph = factory.graph("test");
        let a = factory.agc().unwrap();
        let b = factory.agc().unwrap();
        graph.start().unwrap();

        assert!(matches!(graph.connect(&a, 0, &b, 0), Err(GraphError::NotLocked(_))));
        graph.lock();
        graph.lock();
        graph.connect(&a, 0, &b, 0).unwrap();
        graph.unlock().unwrap();
        graph.disconnect(&a, 0, &b, 0).unwrap();
        graph.unlock().unwrap();
        assert!(graph.unlock().is_err());

        graph.stop();
        graph.wait();
        assert!(!graph.is_running());
    }

    #[test]
    fn test_double_start_is_rejected() {
        let factory = SimFactory::new();
        let graph = factory.graph("test");
        graph.start().unwrap();
        assert!(matches!(graph.start(), Err(GraphError::AlreadyRunning(_))));
    }

    #[test]
    fn test_failing_device_source() {
        let factory = SimFactory::new().with_failing_device("bad");
        assert!(factory.wideband_source("bad", "sim", 2_048_000, 145_000_000, &[]).is_err());
        assert!(factory.wideband_source("good", "sim", 2_048_000, 145_000_000, &[]).is_ok());
    }

    #[test]
    fn test_synthetic_buffer_sink_receives_samples() {
        let factory = SimFactory::synthetic(Vec::new());
        let graph = factory.graph("test");
        let buffer = Arc::new(Buffer::new("test", 4096));
        let source = factory.stream_source(&StreamEndpoint::new("inproc://test")).unwrap();
        let sink = factory.buffer_sink(Arc::clone(&buffer), 48_000).unwrap();
        graph.connect(&source, 0, &sink, 0).unwrap();
        graph.start().unwrap();

        assert!(wait_for(|| buffer.ready_len() > 0));
        graph.stop();
        graph.wait();
    }

    #[test]
    fn test_detector_reports_transmitters_in_range() {
        let factory = SimFactory::synthetic(vec![
            SimTransmitter::continuous(145_500_000, -20.0),
            SimTransmitter::continuous(150_000_000, -20.0),
        ]);
        let graph = factory.graph("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);
        let detector = factory
            .power_detector(
                FrequencyRange::new(145_000_000, 146_000_000),
                145_500_000,
                2_048_000,
                Arc::new(move |detections: &[Detection]| seen_by_callback.lock().unwrap().extend_from_slice(detections)),
            )
            .unwrap();
        let source = factory.stream_source(&StreamEndpoint::new("inproc://test")).unwrap();
        graph.connect(&source, 0, &detector, 0).unwrap();
        graph.start().unwrap();

        assert!(wait_for(|| !seen.lock().unwrap().is_empty()));
        graph.stop();
        graph.wait();
        assert!(seen.lock().unwrap().iter().all(|d| d.frequency == 145_500_000));
    }

    #[test]
    fn test_transmitter_duty_cycle() {
        let transmitter = SimTransmitter {
            frequency: 0,
            level: 0.0,
            active_for: Duration::from_secs(2),
            silent_for: Duration::from_secs(3),
        };
        assert!(transmitter.is_active(Duration::from_millis(1500)));
        assert!(!transmitter.is_active(Duration::from_millis(2500)));
        assert!(transmitter.is_active(Duration::from_millis(5100)));
    }

    #[test]
    fn test_foreign_block_is_rejected() {
        #[derive(Debug)]
        struct Foreign(BlockId);
        impl Block for Foreign {
            fn id(&self) -> BlockId {
                self.0
            }
            fn name(&self) -> &str {
                "foreign"
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let factory = SimFactory::new();
        let graph = factory.graph("test");
        let foreign: BlockRef = Arc::new(Foreign(BlockId::next()));
        let agc = factory.agc().unwrap();
        assert!(matches!(graph.connect(&foreign, 0, &agc, 0), Err(GraphError::ForeignBlock(_))));
    }
}
