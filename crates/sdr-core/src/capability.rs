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

//! Device discovery and capability scanning.

use std::collections::BTreeSet;

use log::{info, warn};

use crate::error::DeviceError;
use crate::types::{format_frequency, nearest_element, Device, Frequency, FrequencyRange, Gain};

/// Identity of an enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceArgs {
    pub driver: String,
    pub serial: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GainRange {
    pub name: String,
    pub minimum: f64,
    pub maximum: f64,
    pub step: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceCapabilities {
    pub sample_rates: BTreeSet<Frequency>,
    pub gains: Vec<GainRange>,
}

/// Hardware enumeration and capability discovery.
pub trait CapabilityQuery {
    fn enumerate(&self) -> Result<Vec<DeviceArgs>, DeviceError>;

    /// Supported rates and gains; opens the hardware briefly.
    fn query(&self, args: &DeviceArgs) -> Result<DeviceCapabilities, DeviceError>;
}

/// Preferred initial (range, sample rate) pairs for newly discovered devices.
const DEFAULT_ASSIGNMENTS: [(Frequency, Frequency, Frequency); 6] = [
    (140_000_000, 160_000_000, 20_480_000),
    (140_000_000, 160_000_000, 20_000_000),
    (144_000_000, 146_000_000, 2_048_000),
    (144_000_000, 146_000_000, 2_000_000),
    (144_000_000, 146_000_000, 1_024_000),
    (144_000_000, 146_000_000, 1_000_000),
];

/// `requested` if supported, else the nearest supported rate.
#[must_use]
pub fn nearest_sample_rate(sample_rates: &BTreeSet<Frequency>, requested: Frequency) -> Frequency {
    if sample_rates.contains(&requested) {
        return requested;
    }
    nearest_element(sample_rates, requested).unwrap_or(requested)
}

fn log_capabilities(capabilities: &DeviceCapabilities) {
    for rate in &capabilities.sample_rates {
        info!("  supported sample rate: {}", format_frequency(*rate));
    }
    for gain in &capabilities.gains {
        info!(
            "  supported gain: {}, min: {}, max: {}, step: {}",
            gain.name, gain.minimum, gain.maximum, gain.step
        );
    }
}

fn update_device(device: &mut Device, args: &DeviceArgs, query: &dyn CapabilityQuery) -> Result<(), DeviceError> {
    info!("update device, driver: {}, serial: {}", args.driver, args.serial);
    let capabilities = query.query(args)?;
    log_capabilities(&capabilities);

    device.driver.clone_from(&args.driver);
    let sample_rate = nearest_sample_rate(&capabilities.sample_rates, device.sample_rate);
    if sample_rate != device.sample_rate {
        warn!(
            "device {}: sample rate {} not supported, using {}",
            device.serial,
            format_frequency(device.sample_rate),
            format_frequency(sample_rate)
        );
        device.sample_rate = sample_rate;
    }
    device.sample_rates = capabilities.sample_rates;
    Ok(())
}

fn create_device(args: &DeviceArgs, query: &dyn CapabilityQuery) -> Result<Device, DeviceError> {
    info!("creating device, driver: {}, serial: {}", args.driver, args.serial);
    let capabilities = query.query(args)?;
    log_capabilities(&capabilities);

    let highest = capabilities.sample_rates.last().copied().ok_or_else(|| DeviceError::Open {
        serial: args.serial.clone(),
        reason: "no supported sample rates".to_string(),
    })?;
    let (start, stop, sample_rate) = DEFAULT_ASSIGNMENTS
        .iter()
        .copied()
        .find(|(_, _, rate)| capabilities.sample_rates.contains(rate))
        .unwrap_or((144_000_000, 146_000_000, highest));

    let mut device = Device::new(args.serial.clone(), args.driver.clone(), sample_rate);
    device.sample_rates = capabilities.sample_rates;
    device.ranges = vec![FrequencyRange::new(start, stop)];
    device.gains = capabilities
        .gains
        .into_iter()
        .map(|gain| Gain {
            name: gain.name,
            value: gain.maximum,
        })
        .collect();
    Ok(device)
}

/// Refresh `devices` from the hardware currently visible to `query`.
///
/// Configured devices that are not found are marked stale by clearing their
/// driver and sample rates; they are never removed. A failing device is
/// logged and skipped.
pub fn scan_devices(devices: &mut Vec<Device>, query: &dyn CapabilityQuery) -> Result<(), DeviceError> {
    info!("scanning connected devices");
    let found = query.enumerate()?;
    info!("found {} devices", found.len());

    for device in devices.iter_mut() {
        device.driver.clear();
        device.sample_rates.clear();
    }

    for args in &found {
        let result = match devices.iter().position(|d| d.serial == args.serial) {
            Some(index) => update_device(&mut devices[index], args, query),
            None => create_device(args, query).map(|device| devices.push(device)),
        };
        if let Err(e) = result {
            warn!("scan device exception, serial: {}: {}", args.serial, e);
        }
    }

    for device in devices.iter().filter(|d| !d.is_available()) {
        warn!("device {} not found, marked stale", device.serial);
    }
    Ok(())
}
