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

//! Device, processor and recorder orchestration for multi-band SDR scanning.
//!
//! The crate maps the frequency ranges of an SDR device onto per-range
//! processing paths, starts recorders when signals appear, flushes their
//! samples as encoded [`Transmission`]s and tears them down once they fall
//! silent. Signal processing itself lives behind the [`block`] traits. The
//! [`fsdr`] runtime implements them with FutureSDR over RTL-SDR hardware
//! (the `hardware` feature); the [`sim`] runtime implements them in-process.
//!
//! - **Buffer**: fixed-size batches between capture and flush ([`Buffer`])
//! - **Recorder**: one recording's pipeline and flush ([`Recorder`])
//! - **Processor**: one range off the device selector ([`SdrProcessor`])
//! - **Device**: the orchestration state machine ([`SdrDevice`])
//!
//! ```
//! use std::sync::Arc;
//! use sdr_core::sim::SimFactory;
//! use sdr_core::{Device, DeviceContext, DeviceSettings, FrequencyRange, SdrDevice, Transmission};
//!
//! let mut device = Device::new("00000001", "sim", 2_048_000);
//! device.ranges = vec![FrequencyRange::new(144_000_000, 146_000_000)];
//!
//! let context = DeviceContext {
//!     factory: Arc::new(SimFactory::new()),
//!     settings: Arc::new(DeviceSettings::default()),
//!     send: Arc::new(|transmission: Transmission| println!("{}", transmission.frequency)),
//!     faults: None,
//! };
//! let sdr = SdrDevice::new(context, device).unwrap();
//! assert_eq!(sdr.slots().len(), 1);
//! ```

pub mod block;
pub mod buffer;
pub mod capability;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod fsdr;
pub mod processor;
pub mod recorder;
pub mod sim;
pub mod transmission;
pub mod types;

pub use block::{Block, BlockFactory, BlockRef, Connector, Graph, RunningGraph};
pub use buffer::{Buffer, SampleBatch};
pub use capability::{nearest_sample_rate, scan_devices, CapabilityQuery, DeviceArgs, DeviceCapabilities};
pub use device::{AssignmentReport, DeviceContext, DeviceSettings, FaultObserver, ProcessorSlot, SdrDevice};
pub use endpoint::StreamEndpoint;
pub use error::{AssignmentError, DeviceError, GraphError, RecordingError};
pub use fsdr::{FsdrFactory, RtlSdrCapabilities};
pub use processor::{Detection, DetectionSink, SdrProcessor};
pub use recorder::{Recorder, RecorderSettings};
pub use transmission::{Transmission, TransmissionSink};
pub use types::{Device, Frequency, FrequencyRange, Gain, Recording, RecordingRequest, SimpleComplex};
