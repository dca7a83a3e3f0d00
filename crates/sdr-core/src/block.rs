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

//! Block and connector interface to the external signal-processing runtime.
//!
//! The orchestration layer never touches samples on the capture path. It asks a
//! [`BlockFactory`] for opaque stages, wires them into a [`Graph`] through a
//! [`Connector`], and controls the graph's lifetime with [`RunningGraph`].
//!
//! A running graph may only be rewired between [`Graph::lock`] and
//! [`Graph::unlock`]; [`Connector::reconfigure`] returns a guard that keeps the
//! bracket balanced even on early return.

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};

use crate::buffer::Buffer;
use crate::endpoint::StreamEndpoint;
use crate::error::GraphError;
use crate::processor::DetectionCallback;
use crate::types::{Frequency, FrequencyRange, Gain, SimpleComplex};

/// Port index on a block.
pub type Port = usize;

/// Process-unique block identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An opaque processing stage: complex samples in, complex or byte samples out.
pub trait Block: Send + Sync + fmt::Debug {
    fn id(&self) -> BlockId;

    fn name(&self) -> &str;

    /// Runtime-specific access to the concrete block.
    fn as_any(&self) -> &dyn Any;
}

pub type BlockRef = Arc<dyn Block>;

/// A directed acyclic graph of blocks (a "top block").
pub trait Graph: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn connect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError>;

    fn disconnect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError>;

    /// Pause a running graph so it can be rewired. Calls nest.
    fn lock(&self);

    /// Resume after rewiring; applies the new topology.
    fn unlock(&self) -> Result<(), GraphError>;

    fn start(&self) -> Result<(), GraphError>;

    /// Ask the worker threads to stop. Does not wait.
    fn stop(&self);

    /// Block until every worker thread has exited.
    fn wait(&self);

    fn is_running(&self) -> bool;
}

/// Creates the stages the orchestration layer builds its graphs from.
pub trait BlockFactory: Send + Sync + fmt::Debug {
    /// An empty graph.
    fn graph(&self, name: &str) -> Arc<dyn Graph>;

    /// Wideband hardware source. Opening the hardware may fail.
    fn wideband_source(
        &self,
        serial: &str,
        driver: &str,
        sample_rate: Frequency,
        center_frequency: Frequency,
        gains: &[Gain],
    ) -> Result<BlockRef, GraphError>;

    /// One input routed to `outputs` independent output ports.
    fn selector(&self, outputs: usize) -> Result<BlockRef, GraphError>;

    /// Shift by `shift` Hz, low-pass and decimate by `decimation`.
    fn frequency_translator(&self, sample_rate: Frequency, shift: Frequency, decimation: u32) -> Result<BlockRef, GraphError>;

    /// Rational resampler from `input_rate` to `output_rate`.
    fn resampler(&self, input_rate: Frequency, output_rate: Frequency) -> Result<BlockRef, GraphError>;

    /// Automatic gain control.
    fn agc(&self) -> Result<BlockRef, GraphError>;

    /// Complex float to interleaved signed bytes, scaled by `scale`.
    fn complex_to_char(&self, scale: f32) -> Result<BlockRef, GraphError>;

    /// Group items into vectors of `items`.
    fn stream_to_vector(&self, items: usize) -> Result<BlockRef, GraphError>;

    /// Publish side of a stream endpoint.
    fn stream_sink(&self, endpoint: &StreamEndpoint) -> Result<BlockRef, GraphError>;

    /// Subscribe side of a stream endpoint.
    fn stream_source(&self, endpoint: &StreamEndpoint) -> Result<BlockRef, GraphError>;

    /// Level detector over `range` fed at `sample_rate` around `center_frequency`;
    /// reports through `callback` from runtime threads.
    fn power_detector(
        &self,
        range: FrequencyRange,
        center_frequency: Frequency,
        sample_rate: Frequency,
        callback: DetectionCallback,
    ) -> Result<BlockRef, GraphError>;

    /// Raw capture to disk.
    fn file_sink(&self, path: &Path, sample_rate: Frequency) -> Result<BlockRef, GraphError>;

    /// Terminal block feeding a [`Buffer`].
    fn buffer_sink(&self, buffer: Arc<Buffer<SimpleComplex>>, sample_rate: Frequency) -> Result<BlockRef, GraphError>;
}

#[derive(Debug, Clone)]
struct Edge {
    from: BlockRef,
    from_port: Port,
    to: BlockRef,
    to_port: Port,
}

impl Edge {
    fn touches(&self, id: BlockId) -> bool {
        self.from.id() == id || self.to.id() == id
    }
}

/// Wires blocks into a graph and remembers the wiring for teardown.
#[derive(Debug)]
pub struct Connector {
    graph: Arc<dyn Graph>,
    edges: Mutex<Vec<Edge>>,
}

impl Connector {
    #[must_use]
    pub fn new(graph: Arc<dyn Graph>) -> Self {
        Self {
            graph,
            edges: Mutex::new(Vec::new()),
        }
    }

    /// Connect output 0 of `from` to input 0 of `to`.
    pub fn connect(&self, from: &BlockRef, to: &BlockRef) -> Result<(), GraphError> {
        self.connect_ports(from, 0, to, 0)
    }

    pub fn connect_ports(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
        self.graph.connect(from, from_port, to, to_port)?;
        debug!("{}: connect {}:{} -> {}:{}", self.graph.name(), from.name(), from_port, to.name(), to_port);
        self.edges().push(Edge {
            from: Arc::clone(from),
            from_port,
            to: Arc::clone(to),
            to_port,
        });
        Ok(())
    }

    /// Connect `blocks` in sequence, port 0 to port 0.
    pub fn connect_chain(&self, blocks: &[BlockRef]) -> Result<(), GraphError> {
        for pair in blocks.windows(2) {
            self.connect(&pair[0], &pair[1])?;
        }
        Ok(())
    }

    /// Remove every connection touching any of `blocks`.
    ///
    /// Every edge is attempted; the first failure is returned.
    pub fn disconnect_all(&self, blocks: &[BlockRef]) -> Result<(), GraphError> {
        let removed: Vec<Edge> = {
            let mut edges = self.edges();
            let (removed, kept): (Vec<Edge>, Vec<Edge>) = edges
                .drain(..)
                .partition(|edge| blocks.iter().any(|block| edge.touches(block.id())));
            *edges = kept;
            removed
        };

        let mut result = Ok(());
        for edge in removed {
            if let Err(e) = self.graph.disconnect(&edge.from, edge.from_port, &edge.to, edge.to_port) {
                error!("{}: disconnect {} -> {} failed: {}", self.graph.name(), edge.from.name(), edge.to.name(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Number of live connections made through this connector.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges().len()
    }

    /// Pause the graph for rewiring until the guard is finished or dropped.
    #[must_use]
    pub fn reconfigure(&self) -> ReconfigureGuard<'_> {
        self.graph.lock();
        ReconfigureGuard {
            graph: self.graph.as_ref(),
            finished: false,
        }
    }

    fn edges(&self) -> MutexGuard<'_, Vec<Edge>> {
        self.edges.lock().unwrap_or_else(|poisoned| {
            error!("{}: connector lock poisoned, recovering", self.graph.name());
            poisoned.into_inner()
        })
    }
}

/// Balances [`Graph::lock`] with [`Graph::unlock`].
#[derive(Debug)]
pub struct ReconfigureGuard<'a> {
    graph: &'a dyn Graph,
    finished: bool,
}

impl ReconfigureGuard<'_> {
    /// Unlock now and surface the result.
    pub fn finish(mut self) -> Result<(), GraphError> {
        self.finished = true;
        self.graph.unlock()
    }
}

impl Drop for ReconfigureGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.graph.unlock() {
                error!("{}: unlock after reconfiguration failed: {}", self.graph.name(), e);
            }
        }
    }
}

/// A started graph; dropping it stops the graph and waits for it to quiesce.
#[derive(Debug)]
pub struct RunningGraph {
    graph: Arc<dyn Graph>,
}

impl RunningGraph {
    pub fn start(graph: Arc<dyn Graph>) -> Result<Self, GraphError> {
        graph.start()?;
        Ok(Self { graph })
    }
}

impl Drop for RunningGraph {
    fn drop(&mut self) {
        self.graph.stop();
        self.graph.wait();
        debug!("{}: graph stopped", self.graph.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Debug)]
    struct NamedBlock {
        id: BlockId,
        name: String,
    }

    impl Block for NamedBlock {
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

    fn block(name: &str) -> BlockRef {
        Arc::new(NamedBlock {
            id: BlockId::next(),
            name: name.to_string(),
        })
    }

    /// Records calls; disconnects of blocks named in `refuse` fail.
    #[derive(Debug, Default)]
    struct LogGraph {
        calls: Mutex<Vec<String>>,
        depth: Mutex<usize>,
        refuse: BTreeSet<String>,
    }

    impl LogGraph {
        fn refusing(names: &[&str]) -> Self {
            Self {
                refuse: names.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn depth(&self) -> usize {
            *self.depth.lock().unwrap()
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Graph for LogGraph {
        fn name(&self) -> &str {
            "log"
        }

        fn connect(&self, from: &BlockRef, _: Port, to: &BlockRef, _: Port) -> Result<(), GraphError> {
            self.log(format!("connect {}->{}", from.name(), to.name()));
            Ok(())
        }

        fn disconnect(&self, from: &BlockRef, _: Port, to: &BlockRef, _: Port) -> Result<(), GraphError> {
            self.log(format!("disconnect {}->{}", from.name(), to.name()));
            if self.refuse.contains(to.name()) {
                return Err(GraphError::Creation {
                    block: to.name().to_string(),
                    reason: "refused".to_string(),
                });
            }
            Ok(())
        }

        fn lock(&self) {
            *self.depth.lock().unwrap() += 1;
        }

        fn unlock(&self) -> Result<(), GraphError> {
            let mut depth = self.depth.lock().unwrap();
            if *depth == 0 {
                return Err(GraphError::NotLocked("log".to_string()));
            }
            *depth -= 1;
            Ok(())
        }

        fn start(&self) -> Result<(), GraphError> {
            self.log("start".to_string());
            Ok(())
        }

        fn stop(&self) {
            self.log("stop".to_string());
        }

        fn wait(&self) {
            self.log("wait".to_string());
        }

        fn is_running(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_connect_chain_records_edges() {
        let graph = Arc::new(LogGraph::default());
        let connector = Connector::new(graph.clone());
        let (a, b, c) = (block("a"), block("b"), block("c"));

        connector.connect_chain(&[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(connector.edge_count(), 2);
        assert_eq!(graph.calls(), vec!["connect a->b", "connect b->c"]);

        connector.disconnect_all(&[c]).unwrap();
        assert_eq!(connector.edge_count(), 1);
        connector.disconnect_all(&[a, b]).unwrap();
        assert_eq!(connector.edge_count(), 0);
    }

    #[test]
    fn test_disconnect_all_tries_every_edge_and_returns_first_error() {
        let graph = Arc::new(LogGraph::refusing(&["x", "y"]));
        let connector = Connector::new(graph.clone());
        let (source, x, y, z) = (block("source"), block("x"), block("y"), block("z"));
        for to in [&x, &y, &z] {
            connector.connect(&source, to).unwrap();
        }

        let result = connector.disconnect_all(&[source]);
        assert!(matches!(result, Err(GraphError::Creation { block, .. }) if block == "x"));
        let disconnects: Vec<String> = graph.calls().into_iter().filter(|c| c.starts_with("disconnect")).collect();
        assert_eq!(disconnects, vec!["disconnect source->x", "disconnect source->y", "disconnect source->z"]);
        assert_eq!(connector.edge_count(), 0);
    }

    #[test]
    fn test_reconfigure_guard_unlocks_on_early_return() {
        fn rewire(connector: &Connector, fail: bool) -> Result<(), GraphError> {
            let guard = connector.reconfigure();
            if fail {
                return Err(GraphError::InvalidPort {
                    block: "early".to_string(),
                    port: 0,
                });
            }
            guard.finish()
        }

        let graph = Arc::new(LogGraph::default());
        let connector = Connector::new(graph.clone());

        assert!(rewire(&connector, true).is_err());
        assert_eq!(graph.depth(), 0);

        rewire(&connector, false).unwrap();
        assert_eq!(graph.depth(), 0);

        let outer = connector.reconfigure();
        let inner = connector.reconfigure();
        assert_eq!(graph.depth(), 2);
        drop(inner);
        assert_eq!(graph.depth(), 1);
        outer.finish().unwrap();
        assert_eq!(graph.depth(), 0);
    }

    #[test]
    fn test_running_graph_stops_and_waits_on_drop() {
        let graph = Arc::new(LogGraph::default());
        let running = RunningGraph::start(graph.clone()).unwrap();
        assert_eq!(graph.calls(), vec!["start"]);
        drop(running);
        assert_eq!(graph.calls(), vec!["start", "stop", "wait"]);
    }
}
