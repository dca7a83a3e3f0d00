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

//! Shared domain types: frequencies, ranges, device descriptors and recordings.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Frequency in Hz. Signed so that shifts below the local oscillator are representable.
pub type Frequency = i64;

/// Sample type handed from the recorder chain to the flush path.
pub type SimpleComplex = Complex<i8>;

/// Target rate the recorder decimates towards before fine filtering.
pub const RECORDER_SAMPLE_RATE_DECIMATOR: Frequency = 1_000_000;

/// Cadence of the recorder flush timer.
pub const RECORDER_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

/// Batch sizes are rounded up to a multiple of this many samples.
pub const BLOCK_TRANSFER_GRANULARITY: usize = 4096;

/// Default level (dB) above which a detection starts a recording.
pub const DEFAULT_RECORDING_START_LEVEL: f32 = -30.0;

/// Default level (dB) below which a recording is considered silent.
pub const DEFAULT_RECORDING_STOP_LEVEL: f32 = -40.0;

/// A half-open span of spectrum `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub start: Frequency,
    pub stop: Frequency,
}

impl FrequencyRange {
    #[must_use]
    pub fn new(start: Frequency, stop: Frequency) -> Self {
        Self { start, stop }
    }

    /// Range of `bandwidth` centered on `frequency`.
    #[must_use]
    pub fn around(frequency: Frequency, bandwidth: Frequency) -> Self {
        Self::new(frequency - bandwidth / 2, frequency + bandwidth / 2)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.stop > self.start
    }

    #[must_use]
    pub fn center(&self) -> Frequency {
        self.start + (self.stop - self.start) / 2
    }

    #[must_use]
    pub fn bandwidth(&self) -> Frequency {
        self.stop - self.start
    }

    #[must_use]
    pub fn contains(&self, frequency: Frequency) -> bool {
        self.start <= frequency && frequency < self.stop
    }

    /// True if `other` lies entirely inside this range.
    #[must_use]
    pub fn contains_range(&self, other: &FrequencyRange) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    #[must_use]
    pub fn overlaps(&self, other: &FrequencyRange) -> bool {
        self.start < other.stop && other.start < self.stop
    }
}

impl fmt::Display for FrequencyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            format_frequency(self.start),
            format_frequency(self.stop)
        )
    }
}

/// Human readable frequency, e.g. `145.500 MHz`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    reason = "display only, sub-Hz precision is irrelevant"
)]
pub fn format_frequency(frequency: Frequency) -> String {
    let magnitude = frequency.unsigned_abs();
    if magnitude >= 1_000_000_000 {
        format!("{:.3} GHz", frequency as f64 / 1e9)
    } else if magnitude >= 1_000_000 {
        format!("{:.3} MHz", frequency as f64 / 1e6)
    } else if magnitude >= 1_000 {
        format!("{:.3} kHz", frequency as f64 / 1e3)
    } else {
        format!("{frequency} Hz")
    }
}

/// Named gain stage and the value applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gain {
    pub name: String,
    pub value: f64,
}

/// Descriptor of one SDR hardware or network endpoint.
///
/// `driver` and `sample_rates` are filled in by a device scan and are never
/// persisted; an empty driver marks a device that was not found by the last scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub serial: String,

    #[serde(default, skip_serializing)]
    pub driver: String,

    pub sample_rate: Frequency,

    #[serde(default, skip_serializing)]
    pub sample_rates: BTreeSet<Frequency>,

    #[serde(default)]
    pub gains: Vec<Gain>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_start_level")]
    pub start_recording_level: f32,

    #[serde(default = "default_stop_level")]
    pub stop_recording_level: f32,

    #[serde(default)]
    pub ranges: Vec<FrequencyRange>,

    /// Dump the raw pre-normalization stream of every recorder to disk.
    #[serde(default)]
    pub raw_dump: bool,
}

fn default_true() -> bool {
    true
}

fn default_start_level() -> f32 {
    DEFAULT_RECORDING_START_LEVEL
}

fn default_stop_level() -> f32 {
    DEFAULT_RECORDING_STOP_LEVEL
}

impl Device {
    /// Create an enabled device with default thresholds and no ranges.
    #[must_use]
    pub fn new(serial: impl Into<String>, driver: impl Into<String>, sample_rate: Frequency) -> Self {
        Self {
            serial: serial.into(),
            driver: driver.into(),
            sample_rate,
            sample_rates: BTreeSet::new(),
            gains: Vec::new(),
            enabled: true,
            start_recording_level: DEFAULT_RECORDING_START_LEVEL,
            stop_recording_level: DEFAULT_RECORDING_STOP_LEVEL,
            ranges: Vec::new(),
            raw_dump: false,
        }
    }

    /// A device is available when the last scan found it.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.driver.is_empty()
    }

    /// Span of spectrum captured when tuned to `center`.
    #[must_use]
    pub fn captured_band(&self, center: Frequency) -> FrequencyRange {
        FrequencyRange::around(center, self.sample_rate)
    }
}

/// One active or requested capture.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub source: String,
    pub name: String,
    pub frequency: Frequency,
    pub bandwidth: Frequency,
    pub modulation: String,
    /// Center of the processor sub-band feeding this recording.
    pub center_frequency: Frequency,
    pub min_record_time: Duration,
    pub max_noise_time: Duration,
}

impl Recording {
    /// Offset of the recording from the processor's center frequency.
    #[must_use]
    pub fn shift(&self) -> Frequency {
        self.frequency - self.center_frequency
    }
}

/// Externally requested (scheduled) recording.
///
/// `begin` and `end` are Unix seconds bounding the capture window; a missing
/// bound leaves that side open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub name: String,
    pub frequency: Frequency,
    pub bandwidth: Frequency,
    #[serde(default)]
    pub modulation: String,
    #[serde(default)]
    pub begin: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

impl RecordingRequest {
    /// A request without a time window.
    #[must_use]
    pub fn new(name: &str, frequency: Frequency, bandwidth: Frequency) -> Self {
        Self {
            name: name.to_string(),
            frequency,
            bandwidth,
            modulation: String::new(),
            begin: None,
            end: None,
        }
    }

    /// Restrict the request to `[begin, end)`.
    #[must_use]
    pub fn between(mut self, begin: i64, end: i64) -> Self {
        self.begin = Some(begin);
        self.end = Some(end);
        self
    }

    /// The window covers `now`.
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        self.begin.is_none_or(|begin| begin <= now) && !self.is_over(now)
    }

    /// The window closed at or before `now`.
    #[must_use]
    pub fn is_over(&self, now: i64) -> bool {
        self.end.is_some_and(|end| end <= now)
    }
}

/// Round `value` up to the next multiple of `multiple`.
#[must_use]
pub fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// Element of `set` nearest to `value`. Ties resolve to the smaller element.
#[must_use]
pub fn nearest_element(set: &BTreeSet<Frequency>, value: Frequency) -> Option<Frequency> {
    let above = set.range(value..).next().copied();
    let below = set.range(..value).next_back().copied();
    match (below, above) {
        (Some(b), Some(a)) => {
            if a - value < value - b {
                Some(a)
            } else {
                Some(b)
            }
        }
        (Some(b), None) => Some(b),
        (None, a) => a,
    }
}

/// Snap `frequency` to the nearest multiple of `step`; a zero step disables snapping.
#[must_use]
pub fn snap_frequency(frequency: Frequency, step: Frequency) -> Frequency {
    if step <= 0 {
        return frequency;
    }
    let remainder = frequency.rem_euclid(step);
    if remainder * 2 >= step {
        frequency - remainder + step
    } else {
        frequency - remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_window_edges() {
        let open = RecordingRequest::new("beacon", 145_800_000, 48_000);
        assert!(open.is_due(0) && !open.is_over(i64::MAX));

        let pass = RecordingRequest::new("ISS", 145_800_000, 48_000).between(100, 200);
        assert!(!pass.is_due(99));
        assert!(pass.is_due(100));
        assert!(pass.is_due(199));
        assert!(!pass.is_due(200));
        assert!(pass.is_over(200));
        assert!(!pass.is_over(199));
    }

    #[test]
    fn test_request_window_is_optional_in_json() {
        let request: RecordingRequest =
            serde_json::from_str(r#"{"name":"ISS","frequency":145800000,"bandwidth":48000,"begin":100,"end":200}"#).unwrap();
        assert_eq!(request, RecordingRequest::new("ISS", 145_800_000, 48_000).between(100, 200));
        let request: RecordingRequest = serde_json::from_str(r#"{"name":"x","frequency":1,"bandwidth":2}"#).unwrap();
        assert_eq!((request.begin, request.end), (None, None));
    }

    #[test]
    fn test_range_geometry() {
        let range = FrequencyRange::new(144_000_000, 146_000_000);
        assert!(range.is_valid());
        assert_eq!(range.center(), 145_000_000);
        assert_eq!(range.bandwidth(), 2_000_000);
        assert!(range.contains(144_000_000));
        assert!(!range.contains(146_000_000));
        assert!(!range.overlaps(&FrequencyRange::new(146_000_000, 147_000_000)));
        assert!(range.overlaps(&FrequencyRange::new(145_999_999, 147_000_000)));
        assert!(!FrequencyRange::new(10, 10).is_valid());
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(48_000, 4096), 49_152);
    }

    #[test]
    fn test_nearest_element() {
        let rates = BTreeSet::from([1_000_000, 2_000_000, 2_048_000]);
        assert_eq!(nearest_element(&rates, 1_800_000), Some(2_000_000));
        assert_eq!(nearest_element(&rates, 2_048_000), Some(2_048_000));
        assert_eq!(nearest_element(&rates, 100), Some(1_000_000));
        assert_eq!(nearest_element(&rates, 30_000_000), Some(2_048_000));
        // Equidistant: the smaller candidate wins.
        assert_eq!(nearest_element(&rates, 1_500_000), Some(1_000_000));
        assert_eq!(nearest_element(&BTreeSet::new(), 1), None);
    }

    #[test]
    fn test_snap_frequency() {
        assert_eq!(snap_frequency(145_501_200, 1_000), 145_501_000);
        assert_eq!(snap_frequency(145_501_600, 1_000), 145_502_000);
        assert_eq!(snap_frequency(145_501_600, 0), 145_501_600);
    }

    #[test]
    fn test_format_frequency() {
        assert_eq!(format_frequency(145_500_000), "145.500 MHz");
        assert_eq!(format_frequency(12_500), "12.500 kHz");
        assert_eq!(format_frequency(-25), "-25 Hz");
    }
}
