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

//! Error types for device, graph and recording operations.

use thiserror::Error;

use crate::types::{Frequency, FrequencyRange};

/// Failures of the external block graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("block '{0}' was not created by this runtime")]
    ForeignBlock(String),

    #[error("port {port} out of range for block '{block}'")]
    InvalidPort { block: String, port: usize },

    #[error("input port {port} of block '{block}' is already connected")]
    PortInUse { block: String, port: usize },

    #[error("no connection {from}:{from_port} -> {to}:{to_port}")]
    NotConnected {
        from: String,
        from_port: usize,
        to: String,
        to_port: usize,
    },

    #[error("graph '{0}' is already running")]
    AlreadyRunning(String),

    #[error("graph '{0}' is not locked for reconfiguration")]
    NotLocked(String),

    #[error("failed to create block '{block}': {reason}")]
    Creation { block: String, reason: String },

    #[error("graph '{graph}' failed to run: {reason}")]
    Runtime { graph: String, reason: String },
}

/// Fatal failures while opening or constructing a device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("open device failed, serial: {serial}: {reason}")]
    Open { serial: String, reason: String },

    #[error("device {0} was not found by the last scan")]
    Unavailable(String),

    #[error("device {0} has no valid frequency range")]
    NoRanges(String),

    #[error("device {serial} graph error: {source}")]
    Graph {
        serial: String,
        #[source]
        source: GraphError,
    },
}

/// Non-fatal fault for one requested frequency range.
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("invalid range {0}: stop must be above start")]
    InvalidRange(FrequencyRange),

    #[error("range {range} overlaps already requested range {other}")]
    Overlapping {
        range: FrequencyRange,
        other: FrequencyRange,
    },

    #[error("range {range} is outside the captured band {band}")]
    OutOfBand {
        range: FrequencyRange,
        band: FrequencyRange,
    },

    #[error("range {0} is inside an ignored band")]
    Ignored(FrequencyRange),

    #[error("no free selector slot for range {range} (width {width})")]
    SelectorFull { range: FrequencyRange, width: usize },

    #[error("processor for range {range} failed: {source}")]
    Graph {
        range: FrequencyRange,
        #[source]
        source: GraphError,
    },
}

impl AssignmentError {
    /// The range this fault refers to.
    #[must_use]
    pub fn range(&self) -> FrequencyRange {
        match self {
            Self::InvalidRange(range) | Self::Ignored(range) => *range,
            Self::Overlapping { range, .. }
            | Self::OutOfBand { range, .. }
            | Self::SelectorFull { range, .. }
            | Self::Graph { range, .. } => *range,
        }
    }
}

/// Reasons a requested or detected recording was not started.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("frequency {0} is ignored")]
    Ignored(Frequency),

    #[error("frequency {0} is already being recorded")]
    Duplicate(Frequency),

    #[error("no processor covers frequency {0}")]
    NoProcessor(Frequency),

    #[error("bandwidth {0} must be positive")]
    InvalidBandwidth(Frequency),

    #[error("bandwidth {bandwidth} exceeds device sample rate {sample_rate}")]
    BandwidthTooWide {
        bandwidth: Frequency,
        sample_rate: Frequency,
    },

    #[error("recorder limit of {0} reached")]
    LimitReached(usize),

    #[error("recorder graph failed: {0}")]
    Graph(#[from] GraphError),
}
