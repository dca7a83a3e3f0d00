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

//! FutureSDR block runtime.
//!
//! [`FsdrGraph`] records the topology like any [`Graph`] and runs it as a
//! FutureSDR flowgraph on its own thread. FutureSDR flowgraphs are fixed once
//! started, so the last [`Graph::unlock`] of a changed topology builds a fresh
//! flowgraph and retires the old one. Retired flowgraphs are told to stop but
//! not waited for until [`Graph::wait`]; their detector callbacks may still be
//! blocked on the caller.
//!
//! Stream sinks and sources meet on a [`StreamHub`] keyed by endpoint address;
//! the device source publishes there from its [`Capture`] thread.

mod blocks;
pub mod hub;
pub mod rtlsdr;

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futuresdr::runtime::{Flowgraph, Runtime};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::block::{Block, BlockFactory, BlockId, BlockRef, Graph, Port};
use crate::buffer::Buffer;
use crate::endpoint::StreamEndpoint;
use crate::error::GraphError;
use crate::processor::DetectionCallback;
use crate::types::{Frequency, FrequencyRange, Gain, SimpleComplex};

use blocks::{
    selector_port, Agc, BufferSink, ByteForward, ComplexToChar, FileSink, HubSink, HubSource, PowerDetector, Resampler,
    Selector, Translator, WavFile,
};
pub use hub::{StreamHub, Subscription};
pub use rtlsdr::{Capture, RtlSdrCapabilities};

/// How long a new flowgraph may take to come up.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Hub address of the wideband samples of device `serial`.
#[must_use]
pub fn wideband_address(serial: &str) -> String {
    format!("{serial}/wideband")
}

enum Recipe {
    Source {
        hub: Arc<StreamHub>,
        address: String,
        capture: Option<Arc<Capture>>,
    },
    Selector {
        outputs: usize,
    },
    Translator {
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
    StreamToVector,
    Sink {
        hub: Arc<StreamHub>,
        address: String,
    },
    Detector {
        range: FrequencyRange,
        center_frequency: Frequency,
        sample_rate: Frequency,
        callback: DetectionCallback,
    },
    FileSink {
        writer: WavFile,
    },
    BufferSink {
        buffer: Arc<Buffer<SimpleComplex>>,
    },
}

impl Recipe {
    /// (inputs, outputs)
    fn ports(&self) -> (usize, usize) {
        match self {
            Self::Source { .. } => (0, 1),
            Self::Selector { outputs } => (1, *outputs),
            Self::Sink { .. } | Self::Detector { .. } | Self::FileSink { .. } | Self::BufferSink { .. } => (1, 0),
            _ => (1, 1),
        }
    }

    fn is_hardware(&self) -> bool {
        matches!(self, Self::Source { capture: Some(_), .. })
    }

    fn output_name(&self, port: Port) -> String {
        match self {
            Self::Selector { .. } => selector_port(port),
            _ => "out".to_string(),
        }
    }

    /// `connected` lists the output ports in use, ascending.
    fn build(&self, connected: &[Port]) -> futuresdr::runtime::Block {
        match self {
            Self::Source { hub, address, .. } => HubSource::new(hub.subscribe(address)),
            Self::Selector { .. } => Selector::new(connected),
            Self::Translator {
                sample_rate,
                shift,
                decimation,
            } => Translator::new(*sample_rate, *shift, *decimation),
            Self::Resampler {
                input_rate,
                output_rate,
            } => Resampler::new(*input_rate, *output_rate),
            Self::Agc => Agc::new(),
            Self::ComplexToChar { scale } => ComplexToChar::new(*scale),
            Self::StreamToVector => ByteForward::new(),
            Self::Sink { hub, address } => HubSink::new(Arc::clone(hub), address.clone()),
            Self::Detector {
                range,
                center_frequency,
                sample_rate,
                callback,
            } => PowerDetector::new(*range, *center_frequency, *sample_rate, Arc::clone(callback)),
            Self::FileSink { writer } => FileSink::new(Arc::clone(writer)),
            Self::BufferSink { buffer } => BufferSink::new(Arc::clone(buffer)),
        }
    }
}

/// A block of the FutureSDR runtime: the recipe its kernel is built from.
pub struct FsdrBlock {
    id: BlockId,
    name: String,
    recipe: Recipe,
}

impl fmt::Debug for FsdrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsdrBlock")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("hardware", &self.recipe.is_hardware())
            .finish()
    }
}

impl Block for FsdrBlock {
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

fn fsdr_block(block: &BlockRef) -> Result<&FsdrBlock, GraphError> {
    block
        .as_any()
        .downcast_ref::<FsdrBlock>()
        .ok_or_else(|| GraphError::ForeignBlock(block.name().to_string()))
}

fn invalid(block: &str, reason: impl Into<String>) -> GraphError {
    GraphError::Creation {
        block: block.to_string(),
        reason: reason.into(),
    }
}

/// Block factory backed by FutureSDR and RTL-SDR hardware.
#[derive(Debug, Default)]
pub struct FsdrFactory {
    hub: Arc<StreamHub>,
}

impl FsdrFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub carrying every stream endpoint of this factory's graphs.
    #[must_use]
    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    fn block(name: String, recipe: Recipe) -> BlockRef {
        Arc::new(FsdrBlock {
            id: BlockId::next(),
            name,
            recipe,
        })
    }
}

impl BlockFactory for FsdrFactory {
    fn graph(&self, name: &str) -> Arc<dyn Graph> {
        Arc::new(FsdrGraph::new(name))
    }

    fn wideband_source(
        &self,
        serial: &str,
        driver: &str,
        sample_rate: Frequency,
        center_frequency: Frequency,
        gains: &[Gain],
    ) -> Result<BlockRef, GraphError> {
        if driver != rtlsdr::DRIVER {
            return Err(invalid("sdr source", format!("unsupported driver '{driver}', serial: {serial}")));
        }
        if sample_rate <= 0 {
            return Err(invalid("sdr source", format!("invalid sample rate {sample_rate}")));
        }
        let address = wideband_address(serial);
        let capture = Capture::open(Arc::clone(&self.hub), address.clone(), serial, sample_rate, center_frequency, gains)
            .map_err(|e| invalid("sdr source", e.to_string()))?;
        Ok(Self::block(
            format!("sdr source {serial}"),
            Recipe::Source {
                hub: Arc::clone(&self.hub),
                address,
                capture: Some(Arc::new(capture)),
            },
        ))
    }

    fn selector(&self, outputs: usize) -> Result<BlockRef, GraphError> {
        if outputs == 0 {
            return Err(invalid("selector", "no outputs"));
        }
        Ok(Self::block("selector".to_string(), Recipe::Selector { outputs }))
    }

    fn frequency_translator(&self, sample_rate: Frequency, shift: Frequency, decimation: u32) -> Result<BlockRef, GraphError> {
        if decimation == 0 || sample_rate <= 0 {
            return Err(invalid("frequency translator", "sample rate and decimation must be positive"));
        }
        Ok(Self::block(
            format!("frequency translator {shift}"),
            Recipe::Translator {
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
            Recipe::Resampler {
                input_rate,
                output_rate,
            },
        ))
    }

    fn agc(&self) -> Result<BlockRef, GraphError> {
        Ok(Self::block("agc".to_string(), Recipe::Agc))
    }

    fn complex_to_char(&self, scale: f32) -> Result<BlockRef, GraphError> {
        Ok(Self::block("complex to char".to_string(), Recipe::ComplexToChar { scale }))
    }

    fn stream_to_vector(&self, items: usize) -> Result<BlockRef, GraphError> {
        if items == 0 {
            return Err(invalid("stream to vector", "empty vector"));
        }
        Ok(Self::block("stream to vector".to_string(), Recipe::StreamToVector))
    }

    fn stream_sink(&self, endpoint: &StreamEndpoint) -> Result<BlockRef, GraphError> {
        Ok(Self::block(
            format!("stream sink {endpoint}"),
            Recipe::Sink {
                hub: Arc::clone(&self.hub),
                address: endpoint.address().to_string(),
            },
        ))
    }

    fn stream_source(&self, endpoint: &StreamEndpoint) -> Result<BlockRef, GraphError> {
        Ok(Self::block(
            format!("stream source {endpoint}"),
            Recipe::Source {
                hub: Arc::clone(&self.hub),
                address: endpoint.address().to_string(),
                capture: None,
            },
        ))
    }

    fn power_detector(
        &self,
        range: FrequencyRange,
        center_frequency: Frequency,
        sample_rate: Frequency,
        callback: DetectionCallback,
    ) -> Result<BlockRef, GraphError> {
        if !range.is_valid() {
            return Err(invalid("power detector", format!("invalid range {range}")));
        }
        if sample_rate <= 0 {
            return Err(invalid("power detector", format!("invalid sample rate {sample_rate}")));
        }
        Ok(Self::block(
            format!("power detector {range}"),
            Recipe::Detector {
                range,
                center_frequency,
                sample_rate,
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
            Recipe::FileSink {
                writer: Arc::new(Mutex::new(Some(writer))),
            },
        ))
    }

    fn buffer_sink(&self, buffer: Arc<Buffer<SimpleComplex>>, sample_rate: Frequency) -> Result<BlockRef, GraphError> {
        if sample_rate <= 0 {
            return Err(invalid("buffer sink", format!("invalid sample rate {sample_rate}")));
        }
        Ok(Self::block(format!("buffer sink {}", buffer.label()), Recipe::BufferSink { buffer }))
    }
}

#[derive(Debug, Clone)]
struct Edge {
    from: BlockRef,
    from_port: Port,
    to: BlockRef,
    to_port: Port,
}

impl Edge {
    fn matches(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> bool {
        self.from.id() == from.id() && self.from_port == from_port && self.to.id() == to.id() && self.to_port == to_port
    }
}

/// Translate the recorded edges into a FutureSDR flowgraph.
fn build_flowgraph(name: &str, edges: &[Edge]) -> Result<Flowgraph, GraphError> {
    let runtime_error = |reason: String| GraphError::Runtime {
        graph: name.to_string(),
        reason,
    };

    let mut blocks: Vec<&BlockRef> = Vec::new();
    let mut outputs: HashMap<BlockId, BTreeSet<Port>> = HashMap::new();
    for edge in edges {
        for block in [&edge.from, &edge.to] {
            if !blocks.iter().any(|known| known.id() == block.id()) {
                blocks.push(block);
            }
        }
        outputs.entry(edge.from.id()).or_default().insert(edge.from_port);
    }

    let mut fg = Flowgraph::new();
    let mut ids = HashMap::new();
    for block in blocks {
        let connected: Vec<Port> = outputs.get(&block.id()).map(|ports| ports.iter().copied().collect()).unwrap_or_default();
        let kernel = fsdr_block(block)?.recipe.build(&connected);
        ids.insert(block.id(), fg.add_block(kernel));
    }
    for edge in edges {
        let from = fsdr_block(&edge.from)?;
        fg.connect_stream(
            ids[&edge.from.id()],
            from.recipe.output_name(edge.from_port).as_str(),
            ids[&edge.to.id()],
            "in",
        )
        .map_err(|e| runtime_error(format!("{} -> {}: {e}", edge.from.name(), edge.to.name())))?;
    }
    Ok(fg)
}

#[derive(Debug)]
struct Worker {
    stop: Option<oneshot::Sender<()>>,
    thread: JoinHandle<()>,
}

impl Worker {
    /// Run `fg` on a new thread and wait until it is up.
    fn spawn(name: &str, fg: Flowgraph) -> Result<Self, GraphError> {
        let runtime_error = |reason: String| GraphError::Runtime {
            graph: name.to_string(),
            reason,
        };
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let label = name.to_string();
        let thread = thread::Builder::new()
            .name(format!("fsdr-{name}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = init_tx.send(Err(format!("tokio runtime: {e}")));
                        return;
                    }
                };
                rt.block_on(async move {
                    let runtime = Runtime::new();
                    let (task, mut handle) = runtime.start(fg).await;
                    let _ = init_tx.send(Ok(()));
                    let _ = stop_rx.await;
                    // futuresdr 0.0.29 has no `terminate_and_wait`: terminate, then await the flowgraph task.
                    let stopped = match handle.terminate().await {
                        Ok(()) => task.await.map(drop),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = stopped {
                        warn!("{}: flowgraph did not terminate cleanly: {}", label, e);
                    }
                    debug!("{}: flowgraph stopped", label);
                });
            })
            .map_err(|e| runtime_error(format!("spawn flowgraph thread: {e}")))?;

        match init_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                stop: Some(stop_tx),
                thread,
            }),
            Ok(Err(reason)) => Err(runtime_error(reason)),
            Err(RecvTimeoutError::Timeout) => Err(runtime_error("flowgraph did not start in time".to_string())),
            Err(RecvTimeoutError::Disconnected) => Err(runtime_error("flowgraph thread exited".to_string())),
        }
    }

    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[derive(Debug, Default)]
struct State {
    edges: Vec<Edge>,
    lock_depth: usize,
    running: bool,
    /// Topology changed since the current flowgraph was built.
    dirty: bool,
    current: Option<Worker>,
    retired: Vec<Worker>,
}

impl State {
    fn retire_current(&mut self) {
        if let Some(mut worker) = self.current.take() {
            worker.signal_stop();
            self.retired.push(worker);
        }
        self.retired.retain(|worker| !worker.thread.is_finished());
    }
}

/// Graph of the FutureSDR runtime.
#[derive(Debug)]
pub struct FsdrGraph {
    name: String,
    state: Mutex<State>,
}

impl FsdrGraph {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.state().edges.len()
    }

    /// Flowgraphs told to stop that may still be running.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        let mut state = self.state();
        state.retired.retain(|worker| !worker.thread.is_finished());
        state.retired.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("{}: state lock poisoned", self.name);
            poisoned.into_inner()
        })
    }

    fn check_rewire(&self, state: &State) -> Result<(), GraphError> {
        if state.running && state.lock_depth == 0 {
            return Err(GraphError::NotLocked(self.name.clone()));
        }
        Ok(())
    }

    /// Replace the running flowgraph with one built from the current edges.
    fn restart(&self, state: &mut State) -> Result<(), GraphError> {
        state.retire_current();
        state.dirty = false;
        if state.edges.is_empty() {
            return Ok(());
        }
        let fg = build_flowgraph(&self.name, &state.edges)?;
        state.current = Some(Worker::spawn(&self.name, fg)?);
        debug!("{}: flowgraph running, {} connections", self.name, state.edges.len());
        Ok(())
    }
}

impl Graph for FsdrGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
        let (_, outputs) = fsdr_block(from)?.recipe.ports();
        let (inputs, _) = fsdr_block(to)?.recipe.ports();
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

        let mut state = self.state();
        self.check_rewire(&state)?;
        if state.edges.iter().any(|e| e.to.id() == to.id() && e.to_port == to_port) {
            return Err(GraphError::PortInUse {
                block: to.name().to_string(),
                port: to_port,
            });
        }
        state.edges.push(Edge {
            from: Arc::clone(from),
            from_port,
            to: Arc::clone(to),
            to_port,
        });
        state.dirty = true;
        Ok(())
    }

    fn disconnect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
        let mut state = self.state();
        self.check_rewire(&state)?;
        let index = state
            .edges
            .iter()
            .position(|e| e.matches(from, from_port, to, to_port))
            .ok_or_else(|| GraphError::NotConnected {
                from: from.name().to_string(),
                from_port,
                to: to.name().to_string(),
                to_port,
            })?;
        state.edges.remove(index);
        state.dirty = true;
        Ok(())
    }

    fn lock(&self) {
        self.state().lock_depth += 1;
    }

    fn unlock(&self) -> Result<(), GraphError> {
        let mut state = self.state();
        if state.lock_depth == 0 {
            return Err(GraphError::NotLocked(self.name.clone()));
        }
        state.lock_depth -= 1;
        if state.lock_depth == 0 && state.running && state.dirty {
            return self.restart(&mut state);
        }
        Ok(())
    }

    fn start(&self) -> Result<(), GraphError> {
        let mut state = self.state();
        if state.running {
            return Err(GraphError::AlreadyRunning(self.name.clone()));
        }
        self.restart(&mut state)?;
        state.running = true;
        info!("{}: started", self.name);
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state();
        if state.running {
            state.running = false;
            state.retire_current();
        }
    }

    fn wait(&self) {
        let retired = std::mem::take(&mut self.state().retired);
        for worker in retired {
            if worker.thread.thread().id() == thread::current().id() {
                warn!("{}: wait called from the flowgraph thread", self.name);
                continue;
            }
            if worker.thread.join().is_err() {
                error!("{}: flowgraph thread panicked", self.name);
            }
        }
    }

    fn is_running(&self) -> bool {
        self.state().running
    }
}

impl Drop for FsdrGraph {
    fn drop(&mut self) {
        self.stop();
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::TAU;
    use std::time::Instant;

    use futuresdr::num_complex::Complex;

    use super::*;
    use crate::processor::Detection;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// 50 kHz above the center, on an FFT bin at 1.024 MS/s.
    fn tone(n: usize) -> Vec<Complex<f32>> {
        (0..n)
            .map(|i| {
                let phase = TAU * (i % 1024) as f32 * 50.0 / 1024.0;
                Complex::new(phase.cos(), phase.sin()) * 0.5
            })
            .collect()
    }

    fn recorder_chain(factory: &FsdrFactory, address: &str, buffer: &Arc<Buffer<SimpleComplex>>) -> Vec<BlockRef> {
        vec![
            factory.stream_source(&StreamEndpoint::new(address)).unwrap(),
            factory.complex_to_char(127.0).unwrap(),
            factory.stream_to_vector(buffer.batch_size()).unwrap(),
            factory.buffer_sink(Arc::clone(buffer), 48_000).unwrap(),
        ]
    }

    fn connect_chain(graph: &FsdrGraph, chain: &[BlockRef]) {
        for pair in chain.windows(2) {
            graph.connect(&pair[0], 0, &pair[1], 0).unwrap();
        }
    }

    #[test]
    fn test_ports_are_validated() {
        let factory = FsdrFactory::new();
        let graph = FsdrGraph::new("test");
        let selector = factory.selector(2).unwrap();
        let sink = factory.stream_sink(&StreamEndpoint::new("a")).unwrap();
        let agc = factory.agc().unwrap();

        graph.connect(&selector, 1, &agc, 0).unwrap();
        assert!(matches!(graph.connect(&selector, 2, &sink, 0), Err(GraphError::InvalidPort { port: 2, .. })));
        assert!(matches!(graph.connect(&sink, 0, &agc, 0), Err(GraphError::InvalidPort { .. })));
        assert!(matches!(graph.connect(&selector, 0, &agc, 0), Err(GraphError::PortInUse { .. })));
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_factory_rejects_bad_parameters() {
        let factory = FsdrFactory::new();
        assert!(factory.selector(0).is_err());
        assert!(factory.frequency_translator(2_048_000, 0, 0).is_err());
        assert!(factory.resampler(0, 48_000).is_err());
        assert!(factory.stream_to_vector(0).is_err());
        assert!(factory.power_detector(FrequencyRange::new(2, 1), 0, 2_048_000, Arc::new(|_: &[Detection]| {})).is_err());
        assert!(factory
            .wideband_source("00000001", "sim", 2_048_000, 145_000_000, &[])
            .is_err());
    }

    #[test]
    fn test_running_graph_rewires_only_while_locked() {
        let factory = FsdrFactory::new();
        let graph = FsdrGraph::new("test");
        graph.start().unwrap();
        assert!(matches!(graph.start(), Err(GraphError::AlreadyRunning(_))));

        let a = factory.agc().unwrap();
        let b = factory.agc().unwrap();
        assert!(matches!(graph.connect(&a, 0, &b, 0), Err(GraphError::NotLocked(_))));
        graph.lock();
        graph.connect(&a, 0, &b, 0).unwrap();
        graph.disconnect(&a, 0, &b, 0).unwrap();
        graph.unlock().unwrap();
        assert!(graph.unlock().is_err());

        graph.stop();
        graph.wait();
        assert!(!graph.is_running());
    }

    #[test]
    fn test_samples_flow_from_hub_into_buffer() {
        let factory = FsdrFactory::new();
        let graph = FsdrGraph::new("test");
        let buffer = Arc::new(Buffer::new("test", 1024));
        connect_chain(&graph, &recorder_chain(&factory, "in", &buffer));
        graph.start().unwrap();
        assert_eq!(factory.hub().subscribers("in"), 1);

        let samples = tone(4096);
        assert!(wait_for(|| {
            factory.hub().publish("in", &samples);
            buffer.ready_len() > 0
        }));
        let mut batch = Vec::new();
        assert!(buffer.pop_batch(|samples, _, _| batch.extend_from_slice(samples)));
        assert_eq!(batch.len(), 1024);
        assert!(batch.iter().all(|s| i16::from(s.re).abs() <= 64 && i16::from(s.im).abs() <= 64));

        graph.stop();
        graph.wait();
        assert_eq!(factory.hub().subscribers("in"), 0);
    }

    #[test]
    fn test_unlock_rebuilds_without_waiting_for_blocked_callbacks() {
        let factory = FsdrFactory::new();
        let graph = FsdrGraph::new("test");
        let gate = Arc::new(Mutex::new(Vec::<Detection>::new()));
        let seen = Arc::clone(&gate);
        let range = FrequencyRange::new(144_500_000, 145_000_000);
        let source = factory.stream_source(&StreamEndpoint::new("wide")).unwrap();
        let detector = factory
            .power_detector(
                range,
                range.center(),
                1_024_000,
                Arc::new(move |detections: &[Detection]| {
                    seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend_from_slice(detections);
                }),
            )
            .unwrap();
        graph.connect(&source, 0, &detector, 0).unwrap();
        graph.start().unwrap();

        let samples = tone(102_400);
        assert!(wait_for(|| {
            factory.hub().publish("wide", &samples);
            !gate.lock().unwrap().is_empty()
        }));
        assert_eq!(gate.lock().unwrap()[0].frequency, range.center() + 50_000);

        // hold the callback's lock while the detector reports again
        let held = gate.lock().unwrap();
        factory.hub().publish("wide", &samples);
        factory.hub().publish("wide", &samples);
        thread::sleep(Duration::from_millis(200));

        let buffer = Arc::new(Buffer::new("rebuilt", 1024));
        let chain = recorder_chain(&factory, "wide", &buffer);
        graph.lock();
        graph.disconnect(&source, 0, &detector, 0).unwrap();
        connect_chain(&graph, &chain);
        graph.unlock().unwrap();
        assert!(graph.is_running());
        drop(held);

        assert!(wait_for(|| {
            factory.hub().publish("wide", &samples[..4096]);
            buffer.ready_len() > 0
        }));
        assert!(wait_for(|| graph.retired_count() == 0));
        graph.stop();
        graph.wait();
    }
}
