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

//! One SDR device: wideband source, selector, processors and recorders.
//!
//! The wideband source is tuned once per device generation to the center of
//! the configured ranges. Every range is served by a processor on its own
//! selector output; detections reported by a processor start recorders.
//!
//! Processors, recorders and the runtime ignored set live behind a single
//! lock. Reassignment, detection handling, forced recordings and the silence
//! sweep all take it, so a detection can never start a recorder on a range
//! that is being removed, and two recorders never share a frequency.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::block::{BlockFactory, BlockRef, Connector, RunningGraph};
use crate::capability::nearest_sample_rate;
use crate::error::{AssignmentError, DeviceError, RecordingError};
use crate::processor::{Detection, DetectionSink, ProcessorContext, SdrProcessor};
use crate::recorder::{Recorder, RecorderSettings};
use crate::transmission::TransmissionSink;
use crate::types::{
    format_frequency, snap_frequency, Device, Frequency, FrequencyRange, Recording, RecordingRequest,
};

/// Receives every non-fatal assignment fault, with the device serial.
pub type FaultObserver = Arc<dyn Fn(&str, &AssignmentError) + Send + Sync>;

/// Immutable per-generation settings, derived from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Selector outputs, bounding the number of processors.
    pub selector_width: usize,
    pub ignored_ranges: Vec<FrequencyRange>,
    /// Bandwidth of detection-driven recordings.
    pub recording_bandwidth: Frequency,
    pub min_record_time: Duration,
    pub max_noise_time: Duration,
    /// Detection frequencies are snapped to a multiple of this; 0 disables.
    pub tuning_step: Frequency,
    /// Detection-driven recorder budget.
    pub max_recorders: usize,
    pub recorder: RecorderSettings,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            selector_width: 4,
            ignored_ranges: Vec::new(),
            recording_bandwidth: 48_000,
            min_record_time: Duration::from_millis(2000),
            max_noise_time: Duration::from_millis(2000),
            tuning_step: 1000,
            max_recorders: 4,
            recorder: RecorderSettings::default(),
        }
    }
}

/// Collaborators shared by every device of an application.
#[derive(Clone)]
pub struct DeviceContext {
    pub factory: Arc<dyn BlockFactory>,
    pub settings: Arc<DeviceSettings>,
    pub send: TransmissionSink,
    pub faults: Option<FaultObserver>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("factory", &self.factory)
            .field("settings", &self.settings)
            .field("faults", &self.faults.is_some())
            .finish_non_exhaustive()
    }
}

/// A frequency range bound to a selector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorSlot {
    pub range: FrequencyRange,
    pub slot: usize,
}

/// Outcome of [`SdrDevice::set_frequency_ranges`].
#[derive(Debug, Default)]
pub struct AssignmentReport {
    pub assigned: Vec<ProcessorSlot>,
    pub removed: Vec<FrequencyRange>,
    pub unchanged: Vec<FrequencyRange>,
    pub faults: Vec<AssignmentError>,
}

impl AssignmentReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Teardown rule for a recorder: silent for at least `max_noise` and recorded
/// for at least `min_record`.
#[must_use]
pub fn should_stop(silence: Duration, duration: Duration, max_noise: Duration, min_record: Duration) -> bool {
    silence >= max_noise && duration >= min_record
}

#[derive(Debug)]
struct RecorderEntry {
    recorder: Arc<Recorder>,
    range: FrequencyRange,
    started: Instant,
    last_data: Instant,
    /// Requested through `update_recordings`; exempt from the silence sweep.
    forced: bool,
}

#[derive(Debug, Default)]
struct DeviceState {
    processors: BTreeMap<FrequencyRange, SdrProcessor>,
    recorders: BTreeMap<Frequency, RecorderEntry>,
    ignored: BTreeSet<Frequency>,
}

struct DeviceCore {
    device: Device,
    center_frequency: Frequency,
    context: DeviceContext,
    selector: BlockRef,
    connector: Arc<Connector>,
    notification: Arc<dyn DetectionSink>,
    state: Mutex<DeviceState>,
}

/// Forwards processor detections to the device while it is alive.
struct Notifier(Weak<DeviceCore>);

impl DetectionSink for Notifier {
    fn on_detections(&self, range: FrequencyRange, detections: &[Detection]) {
        if let Some(core) = self.0.upgrade() {
            core.on_detections(range, detections);
        }
    }
}

struct NewRecording<'a> {
    frequency: Frequency,
    bandwidth: Frequency,
    name: &'a str,
    modulation: &'a str,
    forced: bool,
}

impl DeviceCore {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("device {}: state lock poisoned", self.device.serial);
            poisoned.into_inner()
        })
    }

    fn settings(&self) -> &DeviceSettings {
        &self.context.settings
    }

    fn band(&self) -> FrequencyRange {
        self.device.captured_band(self.center_frequency)
    }

    fn is_ignored(&self, state: &DeviceState, frequency: Frequency) -> bool {
        state.ignored.contains(&frequency) || self.settings().ignored_ranges.iter().any(|range| range.contains(frequency))
    }

    fn validate(&self, ranges: &[FrequencyRange], report: &mut AssignmentReport) -> Vec<FrequencyRange> {
        let band = self.band();
        let mut accepted: Vec<FrequencyRange> = Vec::new();
        for range in ranges {
            let range = *range;
            if !range.is_valid() {
                report.faults.push(AssignmentError::InvalidRange(range));
            } else if let Some(other) = accepted.iter().copied().find(|other| other.overlaps(&range)) {
                report.faults.push(AssignmentError::Overlapping { range, other });
            } else if self.settings().ignored_ranges.iter().any(|ignored| ignored.contains_range(&range)) {
                report.faults.push(AssignmentError::Ignored(range));
            } else if !band.contains_range(&range) {
                report.faults.push(AssignmentError::OutOfBand { range, band });
            } else {
                accepted.push(range);
            }
        }
        accepted
    }

    fn set_frequency_ranges(&self, ranges: &[FrequencyRange]) -> AssignmentReport {
        let mut report = AssignmentReport::default();
        let requested = self.validate(ranges, &mut report);
        let width = self.settings().selector_width;

        let mut state = self.state();
        let stale: Vec<FrequencyRange> = state
            .processors
            .keys()
            .filter(|range| !requested.contains(range))
            .copied()
            .collect();
        for range in stale {
            let frequencies: Vec<Frequency> = state
                .recorders
                .iter()
                .filter(|(_, entry)| entry.range == range)
                .map(|(frequency, _)| *frequency)
                .collect();
            for frequency in frequencies {
                if let Some(entry) = state.recorders.remove(&frequency) {
                    entry.recorder.stop();
                }
            }
            state.processors.remove(&range);
            report.removed.push(range);
        }

        let ctx = ProcessorContext {
            factory: self.context.factory.as_ref(),
            device: &self.device,
            center_frequency: self.center_frequency,
            notification: Arc::clone(&self.notification),
            connector: Arc::clone(&self.connector),
        };
        for range in requested {
            if state.processors.contains_key(&range) {
                report.unchanged.push(range);
                continue;
            }
            let used: BTreeSet<usize> = state.processors.values().map(SdrProcessor::slot).collect();
            let Some(slot) = (0..width).find(|slot| !used.contains(slot)) else {
                report.faults.push(AssignmentError::SelectorFull { range, width });
                continue;
            };
            match SdrProcessor::new(&ctx, &self.selector, slot, range) {
                Ok(processor) => {
                    state.processors.insert(range, processor);
                    report.assigned.push(ProcessorSlot { range, slot });
                }
                Err(source) => report.faults.push(AssignmentError::Graph { range, source }),
            }
        }
        debug!(
            "device {}: {} processors, {} connections",
            self.device.serial,
            state.processors.len(),
            self.connector.edge_count()
        );
        drop(state);

        for fault in &report.faults {
            warn!("device {}: {}", self.device.serial, fault);
            if let Some(observer) = &self.context.faults {
                observer(&self.device.serial, fault);
            }
        }
        report
    }

    /// Single creation point for recorders; enforces every entry invariant.
    fn start_recorder(&self, state: &mut DeviceState, range: FrequencyRange, request: &NewRecording<'_>) -> Result<(), RecordingError> {
        let frequency = request.frequency;
        if self.is_ignored(state, frequency) {
            return Err(RecordingError::Ignored(frequency));
        }
        if state.recorders.contains_key(&frequency) {
            return Err(RecordingError::Duplicate(frequency));
        }
        if request.bandwidth <= 0 {
            return Err(RecordingError::InvalidBandwidth(request.bandwidth));
        }
        if request.bandwidth > self.device.sample_rate {
            return Err(RecordingError::BandwidthTooWide {
                bandwidth: request.bandwidth,
                sample_rate: self.device.sample_rate,
            });
        }
        let max_recorders = self.settings().max_recorders;
        if !request.forced && state.recorders.values().filter(|e| !e.forced).count() >= max_recorders {
            return Err(RecordingError::LimitReached(max_recorders));
        }
        let processor = state.processors.get(&range).ok_or(RecordingError::NoProcessor(frequency))?;

        let recording = Recording {
            source: self.device.serial.clone(),
            name: request.name.to_string(),
            frequency,
            bandwidth: request.bandwidth,
            modulation: request.modulation.to_string(),
            center_frequency: processor.center_frequency(),
            min_record_time: self.settings().min_record_time,
            max_noise_time: self.settings().max_noise_time,
        };
        let recorder = Recorder::new(
            self.context.factory.as_ref(),
            &self.settings().recorder,
            &self.device,
            processor.endpoint(),
            processor.sample_rate(),
            recording,
            Arc::clone(&self.context.send),
        )?;

        let now = Instant::now();
        state.recorders.insert(
            frequency,
            RecorderEntry {
                recorder: Arc::new(recorder),
                range,
                started: now,
                last_data: now,
                forced: request.forced,
            },
        );
        Ok(())
    }

    fn on_detections(&self, range: FrequencyRange, detections: &[Detection]) {
        let settings = self.settings();
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.processors.contains_key(&range) {
            debug!("device {}: dropping detections for stale range {}", self.device.serial, range);
            return;
        }

        let now = Instant::now();
        for detection in detections {
            let frequency = snap_frequency(detection.frequency, settings.tuning_step);
            if !range.contains(frequency) {
                continue;
            }

            if detection.level >= self.device.start_recording_level {
                if let Some(entry) = state.recorders.get_mut(&frequency) {
                    entry.last_data = now;
                    continue;
                }
                let request = NewRecording {
                    frequency,
                    bandwidth: settings.recording_bandwidth,
                    name: "",
                    modulation: "",
                    forced: false,
                };
                match self.start_recorder(state, range, &request) {
                    Ok(()) | Err(RecordingError::Ignored(_)) => {}
                    Err(e @ RecordingError::LimitReached(_)) => {
                        warn!("device {}: skip {}: {}", self.device.serial, format_frequency(frequency), e);
                    }
                    Err(e) => error!("device {}: start recorder failed: {}", self.device.serial, e),
                }
            } else if detection.level >= self.device.stop_recording_level {
                if let Some(entry) = state.recorders.get_mut(&frequency) {
                    entry.last_data = now;
                }
            }
        }
    }

    fn update_recordings(&self, requests: &[RecordingRequest]) -> Vec<Result<(), RecordingError>> {
        let wanted: BTreeSet<Frequency> = requests.iter().map(|request| request.frequency).collect();

        let mut guard = self.state();
        let state = &mut *guard;
        let finished: Vec<Frequency> = state
            .recorders
            .iter()
            .filter(|(frequency, entry)| entry.forced && !wanted.contains(frequency))
            .map(|(frequency, _)| *frequency)
            .collect();
        for frequency in finished {
            if let Some(entry) = state.recorders.remove(&frequency) {
                entry.recorder.stop();
            }
        }

        requests
            .iter()
            .map(|request| {
                if let Some(entry) = state.recorders.get(&request.frequency) {
                    return if entry.forced {
                        Ok(())
                    } else {
                        Err(RecordingError::Duplicate(request.frequency))
                    };
                }
                let range = state
                    .processors
                    .keys()
                    .find(|range| range.contains(request.frequency))
                    .copied();
                let new = NewRecording {
                    frequency: request.frequency,
                    bandwidth: request.bandwidth,
                    name: &request.name,
                    modulation: &request.modulation,
                    forced: true,
                };
                let result = if self.is_ignored(state, request.frequency) {
                    Err(RecordingError::Ignored(request.frequency))
                } else {
                    match range {
                        Some(range) => self.start_recorder(state, range, &new),
                        None => Err(RecordingError::NoProcessor(request.frequency)),
                    }
                };
                if let Err(e) = &result {
                    warn!("device {}: recording {} rejected: {}", self.device.serial, request.name, e);
                }
                result
            })
            .collect()
    }

    fn sweep_recorders_at(&self, now: Instant) -> usize {
        let mut state = self.state();
        let expired: Vec<Frequency> = state
            .recorders
            .iter()
            .filter(|(_, entry)| {
                let recording = entry.recorder.recording();
                !entry.forced
                    && should_stop(
                        now.saturating_duration_since(entry.last_data),
                        entry.recorder.duration(),
                        recording.max_noise_time,
                        recording.min_record_time,
                    )
            })
            .map(|(frequency, _)| *frequency)
            .collect();
        for frequency in &expired {
            if let Some(entry) = state.recorders.remove(frequency) {
                debug!(
                    "device {}: {} silent, recorded for {} ms",
                    self.device.serial,
                    format_frequency(*frequency),
                    now.saturating_duration_since(entry.started).as_millis()
                );
                entry.recorder.stop();
            }
        }
        expired.len()
    }
}

/// A running device generation.
pub struct SdrDevice {
    core: Arc<DeviceCore>,
    graph: Option<RunningGraph>,
}

impl fmt::Debug for SdrDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdrDevice")
            .field("serial", &self.core.device.serial)
            .field("center_frequency", &self.core.center_frequency)
            .finish_non_exhaustive()
    }
}

impl SdrDevice {
    /// Open `device`, start its wideband graph and assign its ranges.
    ///
    /// Failing to open the source or start the graph is fatal; range faults
    /// are not and are reported through the fault observer.
    pub fn new(context: DeviceContext, mut device: Device) -> Result<Self, DeviceError> {
        let serial = device.serial.clone();
        if !device.is_available() {
            return Err(DeviceError::Unavailable(serial));
        }
        if !device.sample_rates.is_empty() && !device.sample_rates.contains(&device.sample_rate) {
            let sample_rate = nearest_sample_rate(&device.sample_rates, device.sample_rate);
            warn!(
                "device {}: sample rate {} not supported, using {}",
                serial,
                format_frequency(device.sample_rate),
                format_frequency(sample_rate)
            );
            device.sample_rate = sample_rate;
        }

        let valid: Vec<FrequencyRange> = device.ranges.iter().copied().filter(FrequencyRange::is_valid).collect();
        let hull = FrequencyRange::new(
            valid.iter().map(|r| r.start).min().ok_or_else(|| DeviceError::NoRanges(serial.clone()))?,
            valid.iter().map(|r| r.stop).max().ok_or_else(|| DeviceError::NoRanges(serial.clone()))?,
        );
        let center_frequency = hull.center();

        let factory = Arc::clone(&context.factory);
        let graph_error = |source| DeviceError::Graph {
            serial: serial.clone(),
            source,
        };
        let source = factory
            .wideband_source(&serial, &device.driver, device.sample_rate, center_frequency, &device.gains)
            .map_err(|e| DeviceError::Open {
                serial: serial.clone(),
                reason: e.to_string(),
            })?;
        let selector = factory.selector(context.settings.selector_width).map_err(graph_error)?;
        let graph = factory.graph(&format!("device {serial}"));
        let connector = Arc::new(Connector::new(Arc::clone(&graph)));
        connector.connect(&source, &selector).map_err(graph_error)?;
        let running = RunningGraph::start(graph).map_err(graph_error)?;

        info!(
            "start device, serial: {}, driver: {}, center: {}, sample rate: {}",
            serial,
            device.driver,
            format_frequency(center_frequency),
            format_frequency(device.sample_rate)
        );

        let ranges = device.ranges.clone();
        let core = Arc::new_cyclic(|this: &Weak<DeviceCore>| DeviceCore {
            device,
            center_frequency,
            context,
            selector,
            connector,
            notification: Arc::new(Notifier(this.clone())),
            state: Mutex::new(DeviceState::default()),
        });
        let sdr = Self {
            core,
            graph: Some(running),
        };
        sdr.set_frequency_ranges(&ranges);
        Ok(sdr)
    }

    #[must_use]
    pub fn serial(&self) -> &str {
        &self.core.device.serial
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.core.device
    }

    /// Frequency the wideband source is tuned to.
    #[must_use]
    pub fn center_frequency(&self) -> Frequency {
        self.core.center_frequency
    }

    #[must_use]
    pub fn captured_band(&self) -> FrequencyRange {
        self.core.band()
    }

    /// Replace the set of served ranges.
    ///
    /// Unchanged ranges keep their processors and recorders. Removed ranges
    /// lose both. Each rejected range gets a fault in the report; other
    /// assignments are unaffected.
    pub fn set_frequency_ranges(&self, ranges: &[FrequencyRange]) -> AssignmentReport {
        self.core.set_frequency_ranges(ranges)
    }

    /// Handle detections reported by the processor of `range`.
    pub fn on_detections(&self, range: FrequencyRange, detections: &[Detection]) {
        self.core.on_detections(range, detections);
    }

    /// Make `requests` the set of forced recordings.
    ///
    /// Forced recordings missing from `requests` are stopped. Results are in
    /// request order.
    pub fn update_recordings(&self, requests: &[RecordingRequest]) -> Vec<Result<(), RecordingError>> {
        self.core.update_recordings(requests)
    }

    /// Suppress `frequency`, stopping its recorder if one is running.
    ///
    /// Returns `true` if a recorder was stopped.
    pub fn ignore_frequency(&self, frequency: Frequency) -> bool {
        let mut state = self.core.state();
        state.ignored.insert(frequency);
        match state.recorders.remove(&frequency) {
            Some(entry) => {
                entry.recorder.stop();
                true
            }
            None => false,
        }
    }

    pub fn unignore_frequency(&self, frequency: Frequency) -> bool {
        self.core.state().ignored.remove(&frequency)
    }

    #[must_use]
    pub fn is_ignored(&self, frequency: Frequency) -> bool {
        let state = self.core.state();
        self.core.is_ignored(&state, frequency)
    }

    /// Flush every live recorder; returns the number of transmissions sent.
    pub fn flush_recorders(&self) -> usize {
        let recorders: Vec<Arc<Recorder>> = self
            .core
            .state()
            .recorders
            .values()
            .map(|entry| Arc::clone(&entry.recorder))
            .collect();
        recorders.iter().map(|recorder| recorder.flush()).sum()
    }

    /// Stop recorders that went silent; returns how many were stopped.
    pub fn sweep_recorders(&self) -> usize {
        self.sweep_recorders_at(Instant::now())
    }

    pub fn sweep_recorders_at(&self, now: Instant) -> usize {
        self.core.sweep_recorders_at(now)
    }

    #[must_use]
    pub fn slots(&self) -> Vec<ProcessorSlot> {
        self.core
            .state()
            .processors
            .values()
            .map(|processor| ProcessorSlot {
                range: processor.range(),
                slot: processor.slot(),
            })
            .collect()
    }

    #[must_use]
    pub fn recorder_frequencies(&self) -> Vec<Frequency> {
        self.core.state().recorders.keys().copied().collect()
    }

    #[must_use]
    pub fn recorder(&self, frequency: Frequency) -> Option<Arc<Recorder>> {
        self.core
            .state()
            .recorders
            .get(&frequency)
            .map(|entry| Arc::clone(&entry.recorder))
    }
}

impl Drop for SdrDevice {
    fn drop(&mut self) {
        let (recorders, processors) = {
            let mut state = self.core.state();
            (
                std::mem::take(&mut state.recorders),
                std::mem::take(&mut state.processors),
            )
        };
        for entry in recorders.values() {
            entry.recorder.stop();
        }
        drop(recorders);
        drop(processors);
        // Waits for the driver threads; no detection is delivered after this.
        drop(self.graph.take());
        info!("stop device, serial: {}", self.core.device.serial);
    }
}
