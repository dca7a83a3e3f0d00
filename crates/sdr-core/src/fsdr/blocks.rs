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

//! FutureSDR kernels behind the scanner's block recipes.
//!
//! Each kernel keeps its sample arithmetic in a plain `process` method so it
//! can be exercised without a running flowgraph.

use std::f64::consts::TAU;
use std::fs::File;
use std::io::BufWriter;
use std::sync::{Arc, Mutex};

use futuresdr::anyhow::Result;
use futuresdr::async_trait::async_trait;
use futuresdr::num_complex::Complex;
use futuresdr::runtime::{
    Block, BlockMeta, BlockMetaBuilder, Kernel, MessageIo, MessageIoBuilder, StreamIo, StreamIoBuilder, WorkIo,
};
use hound::WavWriter;
use log::warn;
use rustfft::{Fft, FftPlanner};

use super::hub::{StreamHub, Subscription};
use crate::buffer::Buffer;
use crate::processor::{Detection, DetectionCallback};
use crate::types::{Frequency, FrequencyRange, SimpleComplex};

/// FFT length of the power detector.
pub const DETECTOR_FFT_SIZE: usize = 1024;

/// Peaks below this level (dB full scale) are not reported.
pub const DETECTION_FLOOR: f32 = -60.0;

/// Detector reports per second.
const DETECTOR_REPORT_RATE: i64 = 10;

const AGC_REFERENCE: f32 = 0.5;
const AGC_RATE: f32 = 1e-3;
const AGC_MAX_GAIN: f32 = 65_536.0;

pub type WavFile = Arc<Mutex<Option<WavWriter<BufWriter<File>>>>>;

#[allow(clippy::cast_precision_loss, reason = "sample rates are far below 2^52")]
fn hz(value: Frequency) -> f64 {
    value as f64
}

/// Samples from a hub subscription.
pub struct HubSource {
    subscription: Subscription,
}

impl HubSource {
    pub fn new(subscription: Subscription) -> Block {
        Block::new(
            BlockMetaBuilder::new("HubSource").build(),
            StreamIoBuilder::new().add_output::<Complex<f32>>("out").build(),
            MessageIoBuilder::new().build(),
            Self { subscription },
        )
    }
}

#[async_trait]
impl Kernel for HubSource {
    async fn work(
        &mut self,
        io: &mut WorkIo,
        sio: &mut StreamIo,
        _mio: &mut MessageIo<Self>,
        _meta: &mut BlockMeta,
    ) -> Result<()> {
        let output = sio.output(0).slice::<Complex<f32>>();
        let produced = self.subscription.pop_into(output);
        io.call_again = true;
        if produced > 0 {
            sio.output(0).produce(produced);
        } else {
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Publishes its input on a hub address.
pub struct HubSink {
    hub: Arc<StreamHub>,
    address: String,
}

impl HubSink {
    pub fn new(hub: Arc<StreamHub>, address: String) -> Block {
        Block::new(
            BlockMetaBuilder::new("HubSink").build(),
            StreamIoBuilder::new().add_input::<Complex<f32>>("in").build(),
            MessageIoBuilder::new().build(),
            Self { hub, address },
        )
    }
}

#[async_trait]
impl Kernel for HubSink {
    async fn work(
        &mut self,
        io: &mut WorkIo,
        sio: &mut StreamIo,
        _mio: &mut MessageIo<Self>,
        _meta: &mut BlockMeta,
    ) -> Result<()> {
        let input = sio.input(0).slice::<Complex<f32>>();
        let n = input.len();
        if n > 0 {
            self.hub.publish(&self.address, input);
            sio.input(0).consume(n);
            io.call_again = true;
        }
        if sio.input(0).finished() {
            io.finished = true;
        }
        Ok(())
    }
}

/// Copies its input to every connected output port.
pub struct Selector {
    outputs: usize,
}

/// Stream port name of selector output `port`.
#[must_use]
pub fn selector_port(port: usize) -> String {
    format!("out{port}")
}

impl Selector {
    /// `ports` are the connected output indices, in port order.
    pub fn new(ports: &[usize]) -> Block {
        let mut builder = StreamIoBuilder::new().add_input::<Complex<f32>>("in");
        for port in ports {
            builder = builder.add_output::<Complex<f32>>(&selector_port(*port));
        }
        Block::new(
            BlockMetaBuilder::new("Selector").build(),
            builder.build(),
            MessageIoBuilder::new().build(),
            Self { outputs: ports.len() },
        )
    }
}

#[async_trait]
impl Kernel for Selector {
    async fn work(
        &mut self,
        io: &mut WorkIo,
        sio: &mut StreamIo,
        _mio: &mut MessageIo<Self>,
        _meta: &mut BlockMeta,
    ) -> Result<()> {
        let input = sio.input(0).slice::<Complex<f32>>();
        let mut n = input.len();
        for port in 0..self.outputs {
            n = n.min(sio.output(port).slice::<Complex<f32>>().len());
        }
        for port in 0..self.outputs {
            sio.output(port).slice::<Complex<f32>>()[..n].copy_from_slice(&input[..n]);
            sio.output(port).produce(n);
        }
        sio.input(0).consume(n);
        if n > 0 {
            io.call_again = true;
        }
        Ok(())
    }
}

/// Mixes by `-shift` and averages `decimation` samples into one.
pub struct Translator {
    phase: f64,
    step: f64,
    decimation: usize,
    acc: Complex<f32>,
    count: usize,
}

impl Translator {
    #[must_use]
    pub fn kernel(sample_rate: Frequency, shift: Frequency, decimation: u32) -> Self {
        Self {
            phase: 0.0,
            step: -TAU * hz(shift) / hz(sample_rate),
            decimation: usize::try_from(decimation).unwrap_or(1).max(1),
            acc: Complex::default(),
            count: 0,
        }
    }

    pub fn new(sample_rate: Frequency, shift: Frequency, decimation: u32) -> Block {
        Block::new(
            BlockMetaBuilder::new("Translator").build(),
            StreamIoBuilder::new()
                .add_input::<Complex<f32>>("in")
                .add_output::<Complex<f32>>("out")
                .build(),
            MessageIoBuilder::new().build(),
            Self::kernel(sample_rate, shift, decimation),
        )
    }

    /// Returns (consumed, produced).
    #[allow(clippy::cast_possible_truncation, reason = "phase is kept within one turn")]
    #[allow(clippy::cast_precision_loss, reason = "decimation factors are small")]
    pub fn process(&mut self, input: &[Complex<f32>], output: &mut [Complex<f32>]) -> (usize, usize) {
        let consumed = input.len().min(output.len() * self.decimation);
        let mut produced = 0;
        for x in &input[..consumed] {
            let (sin, cos) = self.phase.sin_cos();
            self.acc += *x * Complex::new(cos as f32, sin as f32);
            self.phase = (self.phase + self.step) % TAU;
            self.count += 1;
            if self.count == self.decimation {
                output[produced] = self.acc / self.decimation as f32;
                produced += 1;
                self.acc = Complex::default();
                self.count = 0;
            }
        }
        (consumed, produced)
    }
}

/// Linear-interpolating rate converter.
pub struct Resampler {
    /// Input samples per output sample.
    step: f64,
    t: f64,
    last: Complex<f32>,
}

impl Resampler {
    #[must_use]
    pub fn kernel(input_rate: Frequency, output_rate: Frequency) -> Self {
        Self {
            step: hz(input_rate) / hz(output_rate),
            t: 0.0,
            last: Complex::default(),
        }
    }

    pub fn new(input_rate: Frequency, output_rate: Frequency) -> Block {
        Block::new(
            BlockMetaBuilder::new("Resampler").build(),
            StreamIoBuilder::new()
                .add_input::<Complex<f32>>("in")
                .add_output::<Complex<f32>>("out")
                .build(),
            MessageIoBuilder::new().build(),
            Self::kernel(input_rate, output_rate),
        )
    }

    /// Returns (consumed, produced).
    #[allow(clippy::cast_possible_truncation, reason = "interpolation offsets are in [0, 1)")]
    #[allow(clippy::cast_sign_loss, reason = "the pending count is never negative")]
    pub fn process(&mut self, input: &[Complex<f32>], output: &mut [Complex<f32>]) -> (usize, usize) {
        let (mut consumed, mut produced) = (0, 0);
        for x in input {
            let pending = if self.t < 1.0 {
                ((1.0 - self.t) / self.step).ceil() as usize
            } else {
                0
            };
            if produced + pending > output.len() {
                break;
            }
            for _ in 0..pending {
                output[produced] = self.last + (*x - self.last) * self.t as f32;
                produced += 1;
                self.t += self.step;
            }
            self.t -= 1.0;
            self.last = *x;
            consumed += 1;
        }
        (consumed, produced)
    }
}

/// Automatic gain control towards a fixed magnitude.
pub struct Agc {
    gain: f32,
}

impl Agc {
    #[must_use]
    pub fn kernel() -> Self {
        Self { gain: 1.0 }
    }

    pub fn new() -> Block {
        Block::new(
            BlockMetaBuilder::new("Agc").build(),
            StreamIoBuilder::new()
                .add_input::<Complex<f32>>("in")
                .add_output::<Complex<f32>>("out")
                .build(),
            MessageIoBuilder::new().build(),
            Self::kernel(),
        )
    }

    pub fn process(&mut self, input: &[Complex<f32>], output: &mut [Complex<f32>]) -> usize {
        let n = input.len().min(output.len());
        for (x, y) in input[..n].iter().zip(output.iter_mut()) {
            *y = *x * self.gain;
            self.gain = (self.gain + AGC_RATE * (AGC_REFERENCE - y.norm())).clamp(1.0 / AGC_MAX_GAIN, AGC_MAX_GAIN);
        }
        n
    }
}

/// Complex float to signed byte pairs.
pub struct ComplexToChar {
    scale: f32,
}

#[allow(clippy::cast_possible_truncation, reason = "clamped to the i8 range first")]
fn to_i8(value: f32) -> i8 {
    value.round().clamp(-128.0, 127.0) as i8
}

impl ComplexToChar {
    pub fn new(scale: f32) -> Block {
        Block::new(
            BlockMetaBuilder::new("ComplexToChar").build(),
            StreamIoBuilder::new()
                .add_input::<Complex<f32>>("in")
                .add_output::<SimpleComplex>("out")
                .build(),
            MessageIoBuilder::new().build(),
            Self { scale },
        )
    }

    #[must_use]
    pub fn convert(&self, x: Complex<f32>) -> SimpleComplex {
        SimpleComplex::new(to_i8(x.re * self.scale), to_i8(x.im * self.scale))
    }
}

/// Forwards byte samples unchanged; batching happens in the [`Buffer`] downstream.
pub struct ByteForward;

impl ByteForward {
    pub fn new() -> Block {
        Block::new(
            BlockMetaBuilder::new("StreamToVector").build(),
            StreamIoBuilder::new()
                .add_input::<SimpleComplex>("in")
                .add_output::<SimpleComplex>("out")
                .build(),
            MessageIoBuilder::new().build(),
            Self,
        )
    }
}

/// Pushes byte samples into a recorder [`Buffer`].
pub struct BufferSink {
    buffer: Arc<Buffer<SimpleComplex>>,
}

impl BufferSink {
    pub fn new(buffer: Arc<Buffer<SimpleComplex>>) -> Block {
        Block::new(
            BlockMetaBuilder::new("BufferSink").build(),
            StreamIoBuilder::new().add_input::<SimpleComplex>("in").build(),
            MessageIoBuilder::new().build(),
            Self { buffer },
        )
    }
}

/// Writes 16-bit stereo I/Q.
pub struct FileSink {
    writer: WavFile,
}

impl FileSink {
    pub fn new(writer: WavFile) -> Block {
        Block::new(
            BlockMetaBuilder::new("FileSink").build(),
            StreamIoBuilder::new().add_input::<Complex<f32>>("in").build(),
            MessageIoBuilder::new().build(),
            Self { writer },
        )
    }

    #[allow(clippy::cast_possible_truncation, reason = "clamped to the i16 range first")]
    fn write(&self, input: &[Complex<f32>]) {
        let mut writer = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(wav) = writer.as_mut() {
            let to_i16 = |v: f32| (v * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
            let written = input.iter().try_for_each(|s| {
                wav.write_sample(to_i16(s.re))?;
                wav.write_sample(to_i16(s.im))
            });
            if let Err(e) = written {
                warn!("raw dump write failed, closing: {}", e);
                *writer = None;
            }
        }
    }
}

/// FFT power detector reporting spectral peaks inside a range.
pub struct PowerDetector {
    range: FrequencyRange,
    center_frequency: Frequency,
    sample_rate: Frequency,
    fft: Arc<dyn Fft<f32>>,
    frame: Vec<Complex<f32>>,
    power: Vec<f32>,
    frames: usize,
    frames_per_report: usize,
    callback: DetectionCallback,
}

impl PowerDetector {
    #[must_use]
    pub fn kernel(range: FrequencyRange, center_frequency: Frequency, sample_rate: Frequency, callback: DetectionCallback) -> Self {
        let per_second = usize::try_from(sample_rate / DETECTOR_REPORT_RATE).unwrap_or(0);
        Self {
            range,
            center_frequency,
            sample_rate,
            fft: FftPlanner::<f32>::new().plan_fft_forward(DETECTOR_FFT_SIZE),
            frame: Vec::with_capacity(DETECTOR_FFT_SIZE),
            power: vec![0.0; DETECTOR_FFT_SIZE],
            frames: 0,
            frames_per_report: (per_second / DETECTOR_FFT_SIZE).max(1),
            callback,
        }
    }

    pub fn new(range: FrequencyRange, center_frequency: Frequency, sample_rate: Frequency, callback: DetectionCallback) -> Block {
        Block::new(
            BlockMetaBuilder::new("PowerDetector").build(),
            StreamIoBuilder::new().add_input::<Complex<f32>>("in").build(),
            MessageIoBuilder::new().build(),
            Self::kernel(range, center_frequency, sample_rate, callback),
        )
    }

    /// Accumulate `input`; reports through the callback once per report period.
    pub fn process(&mut self, input: &[Complex<f32>]) {
        for x in input {
            self.frame.push(*x);
            if self.frame.len() < DETECTOR_FFT_SIZE {
                continue;
            }
            self.fft.process(&mut self.frame);
            for (power, bin) in self.power.iter_mut().zip(&self.frame) {
                *power += bin.norm_sqr();
            }
            self.frame.clear();
            self.frames += 1;
            if self.frames == self.frames_per_report {
                let detections = self.peaks();
                self.power.iter_mut().for_each(|p| *p = 0.0);
                self.frames = 0;
                if !detections.is_empty() {
                    (self.callback)(&detections);
                }
            }
        }
    }

    /// Local maxima above the floor, with their levels in dB full scale.
    #[allow(clippy::cast_precision_loss, reason = "bin counts are small")]
    #[allow(clippy::cast_possible_truncation, reason = "bin offsets fit in Hz")]
    #[allow(clippy::cast_possible_wrap, reason = "the FFT size is small")]
    fn peaks(&self) -> Vec<Detection> {
        let n = DETECTOR_FFT_SIZE;
        let norm = (n * n) as f32 * self.frames as f32;
        let level = |k: usize| 10.0 * (self.power[k] / norm).max(f32::MIN_POSITIVE).log10();
        let bin_width = hz(self.sample_rate) / n as f64;

        (0..n)
            .filter(|&k| {
                let (prev, next) = ((k + n - 1) % n, (k + 1) % n);
                self.power[k] >= self.power[prev] && self.power[k] > self.power[next] && level(k) >= DETECTION_FLOOR
            })
            .filter_map(|k| {
                let bin = if k < n / 2 { k as i64 } else { k as i64 - n as i64 };
                let frequency = self.center_frequency + (bin as f64 * bin_width).round() as Frequency;
                self.range.contains(frequency).then(|| Detection {
                    frequency,
                    level: level(k),
                })
            })
            .collect()
    }
}

macro_rules! map_kernel {
    ($kernel:ty, $in:ty, $out:ty, |$this:ident, $input:ident, $output:ident| $body:expr) => {
        #[async_trait]
        impl Kernel for $kernel {
            async fn work(
                &mut self,
                io: &mut WorkIo,
                sio: &mut StreamIo,
                _mio: &mut MessageIo<Self>,
                _meta: &mut BlockMeta,
            ) -> Result<()> {
                let $input = sio.input(0).slice::<$in>();
                let $output = sio.output(0).slice::<$out>();
                let $this = self;
                let (consumed, produced): (usize, usize) = $body;
                sio.input(0).consume(consumed);
                sio.output(0).produce(produced);
                if consumed > 0 {
                    io.call_again = true;
                } else if sio.input(0).finished() {
                    io.finished = true;
                }
                Ok(())
            }
        }
    };
}

map_kernel!(Translator, Complex<f32>, Complex<f32>, |this, input, output| this.process(input, output));
map_kernel!(Resampler, Complex<f32>, Complex<f32>, |this, input, output| this.process(input, output));
map_kernel!(Agc, Complex<f32>, Complex<f32>, |this, input, output| {
    let n = this.process(input, output);
    (n, n)
});
map_kernel!(ComplexToChar, Complex<f32>, SimpleComplex, |this, input, output| {
    let n = input.len().min(output.len());
    for (x, y) in input[..n].iter().zip(output.iter_mut()) {
        *y = this.convert(*x);
    }
    (n, n)
});
map_kernel!(ByteForward, SimpleComplex, SimpleComplex, |_this, input, output| {
    let n = input.len().min(output.len());
    output[..n].copy_from_slice(&input[..n]);
    (n, n)
});

macro_rules! sink_kernel {
    ($kernel:ty, $in:ty, |$this:ident, $input:ident| $body:expr) => {
        #[async_trait]
        impl Kernel for $kernel {
            async fn work(
                &mut self,
                io: &mut WorkIo,
                sio: &mut StreamIo,
                _mio: &mut MessageIo<Self>,
                _meta: &mut BlockMeta,
            ) -> Result<()> {
                let $input = sio.input(0).slice::<$in>();
                let n = $input.len();
                if n > 0 {
                    let $this = &mut *self;
                    $body;
                    sio.input(0).consume(n);
                    io.call_again = true;
                } else if sio.input(0).finished() {
                    io.finished = true;
                }
                Ok(())
            }
        }
    };
}

sink_kernel!(BufferSink, SimpleComplex, |this, input| this.buffer.push(input, chrono::Utc::now()));
sink_kernel!(FileSink, Complex<f32>, |this, input| this.write(input));
sink_kernel!(PowerDetector, Complex<f32>, |this, input| this.process(input));
