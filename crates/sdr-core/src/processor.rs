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

//! Per-range processing path off the device selector.
//!
//! Each processor re-centers the wideband feed on its range, publishes the
//! result on a [`StreamEndpoint`] for recorders, and runs a level detector
//! whose events go to the owning device. A processor never creates recorders.

use std::fmt;
use std::sync::Arc;

use log::{error, info};

use crate::block::{BlockFactory, BlockRef, Connector};
use crate::endpoint::StreamEndpoint;
use crate::error::GraphError;
use crate::types::{format_frequency, Device, Frequency, FrequencyRange};

/// Signal level observed at one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub frequency: Frequency,
    /// Level in dB.
    pub level: f32,
}

/// Callback handed to detector blocks; invoked from runtime threads.
pub type DetectionCallback = Arc<dyn Fn(&[Detection]) + Send + Sync>;

/// Receiver of detection events for a range.
pub trait DetectionSink: Send + Sync {
    fn on_detections(&self, range: FrequencyRange, detections: &[Detection]);
}

/// Everything a processor needs from its device.
pub struct ProcessorContext<'a> {
    pub factory: &'a dyn BlockFactory,
    pub device: &'a Device,
    /// Frequency the wideband source is tuned to.
    pub center_frequency: Frequency,
    pub notification: Arc<dyn DetectionSink>,
    pub connector: Arc<Connector>,
}

impl fmt::Debug for ProcessorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorContext")
            .field("device", &self.device.serial)
            .field("center_frequency", &self.center_frequency)
            .finish_non_exhaustive()
    }
}

pub struct SdrProcessor {
    range: FrequencyRange,
    slot: usize,
    endpoint: StreamEndpoint,
    sample_rate: Frequency,
    blocks: Vec<BlockRef>,
    connector: Arc<Connector>,
}

impl fmt::Debug for SdrProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdrProcessor")
            .field("range", &self.range)
            .field("slot", &self.slot)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl SdrProcessor {
    /// Build the sub-graph for `range` on output `slot` of `selector`.
    ///
    /// The device graph may be running; wiring happens inside a reconfiguration
    /// bracket and is rolled back if any connection fails.
    pub fn new(ctx: &ProcessorContext<'_>, selector: &BlockRef, slot: usize, range: FrequencyRange) -> Result<Self, GraphError> {
        let endpoint = StreamEndpoint::for_processor(&ctx.device.serial, slot);
        let shift = range.center() - ctx.center_frequency;

        let translator = ctx.factory.frequency_translator(ctx.device.sample_rate, shift, 1)?;
        let sink = ctx.factory.stream_sink(&endpoint)?;
        let notification = Arc::clone(&ctx.notification);
        let detector = ctx.factory.power_detector(
            range,
            range.center(),
            ctx.device.sample_rate,
            Arc::new(move |detections| notification.on_detections(range, detections)),
        )?;
        let blocks = vec![Arc::clone(&translator), Arc::clone(&sink), Arc::clone(&detector)];

        let connector = Arc::clone(&ctx.connector);
        let guard = connector.reconfigure();
        let wired = connector
            .connect_ports(selector, slot, &translator, 0)
            .and_then(|()| connector.connect(&translator, &sink))
            .and_then(|()| connector.connect(&translator, &detector));
        if let Err(e) = wired {
            if let Err(cleanup) = connector.disconnect_all(&blocks) {
                error!("processor {range}: rollback failed: {cleanup}");
            }
            return Err(e);
        }
        guard.finish()?;

        info!(
            "start processor, range: {}, slot: {}, shift: {}, endpoint: {}",
            range,
            slot,
            format_frequency(shift),
            endpoint
        );

        Ok(Self {
            range,
            slot,
            endpoint,
            sample_rate: ctx.device.sample_rate,
            blocks,
            connector,
        })
    }

    #[must_use]
    pub fn range(&self) -> FrequencyRange {
        self.range
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Stream recorders subscribe to.
    #[must_use]
    pub fn endpoint(&self) -> &StreamEndpoint {
        &self.endpoint
    }

    /// Frequency at baseband on the published stream.
    #[must_use]
    pub fn center_frequency(&self) -> Frequency {
        self.range.center()
    }

    /// Sample rate of the published stream.
    #[must_use]
    pub fn sample_rate(&self) -> Frequency {
        self.sample_rate
    }
}

impl Drop for SdrProcessor {
    fn drop(&mut self) {
        let _guard = self.connector.reconfigure();
        if let Err(e) = self.connector.disconnect_all(&self.blocks) {
            error!("stop processor {}: {}", self.range, e);
        }
        info!("stop processor, range: {}, slot: {}", self.range, self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockId, Graph, Port};
    use crate::sim::{SimBlock, SimFactory, SimKind};
    use std::sync::Mutex;

    const RANGE: FrequencyRange = FrequencyRange {
        start: 144_500_000,
        stop: 145_000_000,
    };

    /// Keeps the live edge list; the `fail_at`-th connect (1-based) fails.
    #[derive(Debug, Default)]
    struct EdgeGraph {
        edges: Mutex<Vec<(BlockRef, Port, BlockRef, Port)>>,
        connects: Mutex<usize>,
        depth: Mutex<usize>,
        fail_at: Option<usize>,
    }

    impl EdgeGraph {
        fn edge_ids(&self) -> Vec<(BlockId, BlockId)> {
            self.edges.lock().unwrap().iter().map(|(from, _, to, _)| (from.id(), to.id())).collect()
        }

        fn block_named(&self, prefix: &str) -> Option<BlockRef> {
            self.edges
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, to, _)| Arc::clone(to))
                .find(|block| block.name().starts_with(prefix))
        }
    }

    impl Graph for EdgeGraph {
        fn name(&self) -> &str {
            "edges"
        }

        fn connect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
            let mut connects = self.connects.lock().unwrap();
            *connects += 1;
            if self.fail_at == Some(*connects) {
                return Err(GraphError::PortInUse {
                    block: to.name().to_string(),
                    port: to_port,
                });
            }
            self.edges.lock().unwrap().push((Arc::clone(from), from_port, Arc::clone(to), to_port));
            Ok(())
        }

        fn disconnect(&self, from: &BlockRef, from_port: Port, to: &BlockRef, to_port: Port) -> Result<(), GraphError> {
            let mut edges = self.edges.lock().unwrap();
            let before = edges.len();
            edges.retain(|(f, fp, t, tp)| !(f.id() == from.id() && *fp == from_port && t.id() == to.id() && *tp == to_port));
            if edges.len() == before {
                return Err(GraphError::NotConnected {
                    from: from.name().to_string(),
                    from_port,
                    to: to.name().to_string(),
                    to_port,
                });
            }
            Ok(())
        }

        fn lock(&self) {
            *self.depth.lock().unwrap() += 1;
        }

        fn unlock(&self) -> Result<(), GraphError> {
            let mut depth = self.depth.lock().unwrap();
            *depth = depth.checked_sub(1).ok_or_else(|| GraphError::NotLocked("edges".to_string()))?;
            Ok(())
        }

        fn start(&self) -> Result<(), GraphError> {
            Ok(())
        }

        fn stop(&self) {}

        fn wait(&self) {}

        fn is_running(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<(FrequencyRange, Vec<Detection>)>>);

    impl DetectionSink for Collect {
        fn on_detections(&self, range: FrequencyRange, detections: &[Detection]) {
            self.0.lock().unwrap().push((range, detections.to_vec()));
        }
    }

    struct Setup {
        factory: SimFactory,
        device: Device,
        graph: Arc<EdgeGraph>,
        connector: Arc<Connector>,
        collect: Arc<Collect>,
        selector: BlockRef,
    }

    impl Setup {
        fn new(fail_at: Option<usize>) -> Self {
            let factory = SimFactory::new();
            let graph = Arc::new(EdgeGraph {
                fail_at,
                ..EdgeGraph::default()
            });
            let selector = factory.selector(2).unwrap();
            Self {
                connector: Arc::new(Connector::new(graph.clone())),
                device: Device::new("sim-1", "sim", 2_048_000),
                factory,
                graph,
                collect: Arc::new(Collect::default()),
                selector,
            }
        }

        fn processor(&self, slot: usize) -> Result<SdrProcessor, GraphError> {
            let ctx = ProcessorContext {
                factory: &self.factory,
                device: &self.device,
                center_frequency: 145_000_000,
                notification: self.collect.clone(),
                connector: Arc::clone(&self.connector),
            };
            SdrProcessor::new(&ctx, &self.selector, slot, RANGE)
        }
    }

    #[test]
    fn test_new_wires_three_edges_off_its_slot() {
        let setup = Setup::new(None);
        let processor = setup.processor(1).unwrap();
        assert_eq!(processor.slot(), 1);
        assert_eq!(processor.center_frequency(), 144_750_000);
        assert_eq!(processor.endpoint(), &StreamEndpoint::for_processor("sim-1", 1));
        assert_eq!(setup.graph.edge_ids().len(), 3);
        assert_eq!(setup.graph.edge_ids()[0].0, setup.selector.id());
        assert_eq!(*setup.graph.depth.lock().unwrap(), 0);
    }

    #[test]
    fn test_failed_wiring_is_rolled_back() {
        for fail_at in 1..=3 {
            let setup = Setup::new(Some(fail_at));
            let result = setup.processor(0);
            assert!(matches!(result, Err(GraphError::PortInUse { .. })), "connect {fail_at}");
            assert!(setup.graph.edge_ids().is_empty(), "connect {fail_at} left edges");
            assert_eq!(setup.connector.edge_count(), 0);
            assert_eq!(*setup.graph.depth.lock().unwrap(), 0);
        }
    }

    #[test]
    fn test_drop_removes_its_edges_only() {
        let setup = Setup::new(None);
        let first = setup.processor(0).unwrap();
        let second = setup.processor(1).unwrap();
        assert_eq!(setup.graph.edge_ids().len(), 6);

        drop(first);
        assert_eq!(setup.graph.edge_ids().len(), 3);
        assert_eq!(setup.connector.edge_count(), 3);
        assert_eq!(*setup.graph.depth.lock().unwrap(), 0);
        drop(second);
        assert!(setup.graph.edge_ids().is_empty());
    }

    #[test]
    fn test_detections_forwarded_with_range() {
        let setup = Setup::new(None);
        let _processor = setup.processor(0).unwrap();
        let detector = setup.graph.block_named("power detector").unwrap();
        let block = detector.as_any().downcast_ref::<SimBlock>().unwrap();
        let SimKind::PowerDetector { callback, .. } = block.kind() else {
            panic!("not a detector");
        };

        let detection = Detection {
            frequency: 144_800_000,
            level: -12.0,
        };
        callback(&[detection]);
        assert_eq!(*setup.collect.0.lock().unwrap(), vec![(RANGE, vec![detection])]);
    }
}
