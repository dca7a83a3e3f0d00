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

//! Encoded transmission payloads handed to the outbound transport.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Frequency, Recording, SimpleComplex};

/// One flushed batch of a recording, ready to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    pub source: String,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub frequency: Frequency,
    pub bandwidth: Frequency,
    pub modulation: String,
    /// Base64 of interleaved signed 8-bit I/Q.
    pub data: String,
}

impl Transmission {
    #[must_use]
    pub fn new(recording: &Recording, timestamp: DateTime<Utc>, samples: &[SimpleComplex]) -> Self {
        Self {
            source: recording.source.clone(),
            name: recording.name.clone(),
            timestamp,
            frequency: recording.frequency,
            bandwidth: recording.bandwidth,
            modulation: recording.modulation.clone(),
            data: encode_samples(samples),
        }
    }

    /// Decode the payload back into samples.
    pub fn samples(&self) -> Result<Vec<SimpleComplex>, base64::DecodeError> {
        decode_samples(&self.data)
    }
}

/// `send(payload)`: fire-and-forget outbound transport.
pub type TransmissionSink = Arc<dyn Fn(Transmission) + Send + Sync>;

/// Wrapper so sinks can sit inside `Debug` structs.
#[derive(Clone)]
pub struct SinkHandle(pub TransmissionSink);

impl SinkHandle {
    pub fn send(&self, transmission: Transmission) {
        (self.0)(transmission);
    }
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SinkHandle")
    }
}

#[must_use]
#[allow(clippy::cast_sign_loss, reason = "bit-preserving i8 to u8 reinterpretation")]
pub fn encode_samples(samples: &[SimpleComplex]) -> String {
    let bytes: Vec<u8> = samples
        .iter()
        .flat_map(|sample| [sample.re as u8, sample.im as u8])
        .collect();
    STANDARD.encode(bytes)
}

#[allow(clippy::cast_possible_wrap, reason = "bit-preserving u8 to i8 reinterpretation")]
pub fn decode_samples(data: &str) -> Result<Vec<SimpleComplex>, base64::DecodeError> {
    let bytes = STANDARD.decode(data)?;
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| SimpleComplex::new(pair[0] as i8, pair[1] as i8))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn recording() -> Recording {
        Recording {
            source: "00000001".to_string(),
            name: "NOAA 19".to_string(),
            frequency: 137_100_000,
            bandwidth: 48_000,
            modulation: "FM".to_string(),
            center_frequency: 137_000_000,
            min_record_time: Duration::ZERO,
            max_noise_time: Duration::ZERO,
        }
    }

    #[test]
    fn test_encode_interleaves_iq() {
        let samples = [SimpleComplex::new(1, -1), SimpleComplex::new(127, -128)];
        assert_eq!(encode_samples(&samples), STANDARD.encode([0x01, 0xff, 0x7f, 0x80]));
    }

    #[test]
    fn test_transmission_json_shape() {
        let timestamp = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let transmission = Transmission::new(&recording(), timestamp, &[SimpleComplex::new(3, 4)]);
        let json = serde_json::to_value(&transmission).unwrap();

        assert_eq!(json["source"], "00000001");
        assert_eq!(json["name"], "NOAA 19");
        assert_eq!(json["timestamp"], 1_700_000_000_123_i64);
        assert_eq!(json["frequency"], 137_100_000);
        assert_eq!(json["bandwidth"], 48_000);
        assert_eq!(json["modulation"], "FM");
        assert_eq!(transmission.samples().unwrap(), vec![SimpleComplex::new(3, 4)]);
    }
}
