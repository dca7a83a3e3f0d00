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

//! RTL-SDR enumeration and capture.
//!
//! Enable the `hardware` feature to compile with RTL-SDR support. Without it
//! enumeration finds nothing and opening a device fails.

use std::sync::Arc;

use super::hub::StreamHub;
#[cfg(feature = "hardware")]
use crate::capability::GainRange;
use crate::capability::{CapabilityQuery, DeviceArgs, DeviceCapabilities};
use crate::error::DeviceError;
use crate::types::{Frequency, Gain};

/// Driver name recorded for RTL-SDR devices.
pub const DRIVER: &str = "rtlsdr";

/// Rates the RTL2832U delivers without dropping samples.
pub const SAMPLE_RATES: [Frequency; 9] = [
    1_024_000, 1_400_000, 1_800_000, 1_920_000, 2_048_000, 2_400_000, 2_560_000, 2_880_000, 3_200_000,
];

/// USB transfer size of one read, a multiple of 512 bytes.
#[cfg(feature = "hardware")]
const READ_SIZE: usize = 262_144;

/// Convert interleaved unsigned 8-bit I/Q to complex floats in [-1, 1].
#[must_use]
pub fn convert_samples(raw: &[u8]) -> Vec<futuresdr::num_complex::Complex<f32>> {
    raw.chunks_exact(2)
        .map(|iq| futuresdr::num_complex::Complex::new((f32::from(iq[0]) - 127.5) / 127.5, (f32::from(iq[1]) - 127.5) / 127.5))
        .collect()
}

#[cfg(feature = "hardware")]
fn tuner_gains() -> Vec<GainRange> {
    vec![GainRange {
        name: "TUNER".to_string(),
        minimum: 0.0,
        maximum: 49.6,
        step: 0.1,
    }]
}

/// Manual tuner gain in tenths of dB, or `None` for automatic gain.
#[must_use]
#[allow(clippy::cast_possible_truncation, reason = "tuner gains are below 100 dB")]
pub fn manual_gain(gains: &[Gain]) -> Option<i32> {
    gains
        .iter()
        .find(|gain| gain.name.eq_ignore_ascii_case("TUNER"))
        .or_else(|| gains.first())
        .map(|gain| (gain.value * 10.0).round() as i32)
}

/// [`CapabilityQuery`] over the attached RTL-SDR dongles.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtlSdrCapabilities;

#[cfg(feature = "hardware")]
fn device_index(serial: &str) -> Option<i32> {
    (0..rtlsdr::get_device_count()).find(|&i| rtlsdr::get_device_usb_strings(i).is_ok_and(|usb| usb.serial == serial))
}

#[cfg(feature = "hardware")]
impl CapabilityQuery for RtlSdrCapabilities {
    fn enumerate(&self) -> Result<Vec<DeviceArgs>, DeviceError> {
        let mut devices = Vec::new();
        for i in 0..rtlsdr::get_device_count() {
            match rtlsdr::get_device_usb_strings(i) {
                Ok(usb) => {
                    log::info!("found {} serial {}", rtlsdr::get_device_name(i), usb.serial);
                    devices.push(DeviceArgs {
                        driver: DRIVER.to_string(),
                        serial: usb.serial,
                    });
                }
                Err(e) => log::warn!("RTL-SDR device {} has no usb strings: {:?}", i, e),
            }
        }
        Ok(devices)
    }

    fn query(&self, args: &DeviceArgs) -> Result<DeviceCapabilities, DeviceError> {
        if args.driver != DRIVER || device_index(&args.serial).is_none() {
            return Err(DeviceError::Open {
                serial: args.serial.clone(),
                reason: "no such RTL-SDR device".to_string(),
            });
        }
        Ok(DeviceCapabilities {
            sample_rates: SAMPLE_RATES.into_iter().collect(),
            gains: tuner_gains(),
        })
    }
}

#[cfg(not(feature = "hardware"))]
impl CapabilityQuery for RtlSdrCapabilities {
    fn enumerate(&self) -> Result<Vec<DeviceArgs>, DeviceError> {
        log::warn!("RTL-SDR hardware support not compiled (enable 'hardware' feature)");
        Ok(Vec::new())
    }

    fn query(&self, args: &DeviceArgs) -> Result<DeviceCapabilities, DeviceError> {
        Err(DeviceError::Open {
            serial: args.serial.clone(),
            reason: "RTL-SDR hardware support not compiled (enable 'hardware' feature)".to_string(),
        })
    }
}

/// An open dongle whose reader thread publishes samples to the hub.
///
/// Dropping the capture stops the thread and closes the device.
#[cfg(feature = "hardware")]
#[derive(Debug)]
pub struct Capture {
    serial: String,
    stop_flag: Arc<std::sync::atomic::AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

#[cfg(feature = "hardware")]
impl Capture {
    pub fn open(
        hub: Arc<StreamHub>,
        address: String,
        serial: &str,
        sample_rate: Frequency,
        center_frequency: Frequency,
        gains: &[Gain],
    ) -> Result<Self, DeviceError> {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let fail = |reason: String| DeviceError::Open {
            serial: serial.to_string(),
            reason,
        };
        let index = device_index(serial).ok_or_else(|| fail("device not found".to_string()))?;
        let center = u32::try_from(center_frequency).map_err(|e| fail(format!("center frequency {center_frequency}: {e}")))?;
        let rate = u32::try_from(sample_rate).map_err(|e| fail(format!("sample rate {sample_rate}: {e}")))?;
        let gain = manual_gain(gains);

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<(), String>>();
        let stop = Arc::clone(&stop_flag);
        let label = serial.to_string();
        let thread = std::thread::Builder::new()
            .name(format!("rtlsdr-{serial}"))
            .spawn(move || {
                let mut device = match rtlsdr::open(index) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = init_tx.send(Err(format!("open failed: {e:?}")));
                        return;
                    }
                };
                let configured = device
                    .set_center_freq(center)
                    .and_then(|()| device.set_sample_rate(rate))
                    .and_then(|()| device.set_tuner_gain_mode(gain.is_some()))
                    .and_then(|()| gain.map_or(Ok(()), |tenths| device.set_tuner_gain(tenths)))
                    .and_then(|()| device.reset_buffer());
                if let Err(e) = configured {
                    let _ = init_tx.send(Err(format!("configure failed: {e:?}")));
                    return;
                }
                log::info!("{}: center {} Hz, rate {} Hz, gain {:?}", label, center, rate, gain);
                let _ = init_tx.send(Ok(()));

                while !stop.load(Ordering::Relaxed) {
                    match device.read_sync(READ_SIZE) {
                        Ok(raw) => {
                            hub.publish(&address, &convert_samples(&raw));
                        }
                        Err(e) => {
                            log::error!("{}: read failed, stopping capture: {:?}", label, e);
                            break;
                        }
                    }
                }
                if let Err(e) = device.close() {
                    log::warn!("{}: close failed: {:?}", label, e);
                }
            })
            .map_err(|e| fail(format!("spawn reader thread: {e}")))?;

        let capture = Self {
            serial: serial.to_string(),
            stop_flag,
            thread: Some(thread),
        };
        match init_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(capture),
            Ok(Err(reason)) => Err(fail(reason)),
            Err(e) => Err(fail(format!("no answer from reader thread: {e}"))),
        }
    }
}

#[cfg(feature = "hardware")]
impl Drop for Capture {
    fn drop(&mut self) {
        self.stop_flag.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("{}: reader thread panicked", self.serial);
            }
        }
    }
}

/// Stub when hardware support is not compiled.
#[cfg(not(feature = "hardware"))]
#[derive(Debug)]
pub struct Capture;

#[cfg(not(feature = "hardware"))]
impl Capture {
    pub fn open(
        _hub: Arc<StreamHub>,
        _address: String,
        serial: &str,
        _sample_rate: Frequency,
        _center_frequency: Frequency,
        _gains: &[Gain],
    ) -> Result<Self, DeviceError> {
        Err(DeviceError::Open {
            serial: serial.to_string(),
            reason: "RTL-SDR hardware support not compiled (enable 'hardware' feature)".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_samples_centers_unsigned_bytes() {
        let samples = convert_samples(&[0, 255, 128, 127, 9]);
        assert_eq!(samples.len(), 2);
        assert!((samples[0].re + 1.0).abs() < 1e-6 && (samples[0].im - 1.0).abs() < 1e-6);
        assert!(samples[1].re > 0.0 && samples[1].re < 0.01);
        assert!(samples[1].im < 0.0 && samples[1].im > -0.01);
    }

    #[test]
    fn test_manual_gain_prefers_tuner_stage() {
        let gains = vec![
            Gain {
                name: "LNA".to_string(),
                value: 10.0,
            },
            Gain {
                name: "tuner".to_string(),
                value: 29.7,
            },
        ];
        assert_eq!(manual_gain(&gains), Some(297));
        assert_eq!(manual_gain(&gains[..1]), Some(100));
        assert_eq!(manual_gain(&[]), None);
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_without_hardware_nothing_opens() {
        let query = RtlSdrCapabilities;
        assert!(query.enumerate().unwrap().is_empty());
        let args = DeviceArgs {
            driver: DRIVER.to_string(),
            serial: "00000001".to_string(),
        };
        assert!(matches!(query.query(&args), Err(DeviceError::Open { .. })));
        let hub = Arc::new(StreamHub::new());
        assert!(Capture::open(hub, "00000001/wideband".to_string(), "00000001", 2_048_000, 145_000_000, &[]).is_err());
    }
}
