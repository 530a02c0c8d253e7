//! Delta compression for sensor readings.
//!
//! The first reading from a device is sent as a full frame carrying every
//! channel at `f64` precision. Later readings are sent as delta frames: each
//! channel is quantized at [`QUANT_SCALE`] and the signed difference against
//! the previous frame is written with the narrowest integer width that holds
//! every channel. Delta frames therefore reconstruct values within
//! [`QUANTIZATION_BOUND`]; the reference advances by the quantized value, so the
//! error does not grow over a long run of deltas.
//!
//! A decoder that sees a sequence gap or duplicate refuses the frame with
//! [`CodecError::ResyncRequired`] and drops its state for the device; the
//! sender answers with a full frame once told via [`DeltaEncoder::request_full`].

mod batch;
mod error;
mod frame;
mod state;

pub use batch::{pack_frames, unpack_frames};
pub use error::{CodecError, CodecResult};
pub use frame::{DeltaFrame, DeltaWidth, Frame, FrameType, FullFrame, peek_device_id};
pub use state::DeviceCodecState;

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tracing::debug;

use crate::{ChannelValue, DeviceId, DeviceTimestamp, Reading};

/// Fixed-point scale used for delta frames (two decimal places).
pub const QUANT_SCALE: f64 = 100.0;
/// Maximum absolute error of a value reconstructed from a delta frame.
pub const QUANTIZATION_BOUND: f64 = 0.5 / QUANT_SCALE;
/// Depth byte meaning "no depth index".
pub const NO_DEPTH: u8 = 0xFF;
pub const FULL_HEADER_SIZE: usize = 19;
pub const DELTA_HEADER_SIZE: usize = 8;

// Quantized values must stay exactly representable as f64.
const MAX_QUANTIZED: f64 = (1u64 << 53) as f64;

pub(crate) fn quantize(value: f64) -> Option<i64> {
    let scaled = (value * QUANT_SCALE).round();
    (scaled.abs() < MAX_QUANTIZED).then_some(scaled as i64)
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CodecConfig {
    /// Widest delta encoding before falling back to a full frame.
    #[serde(default = "default_max_delta_width")]
    pub max_delta_width: DeltaWidth,
}

fn default_max_delta_width() -> DeltaWidth {
    DeltaWidth::I32
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_delta_width: default_max_delta_width(),
        }
    }
}

/// Why the encoder sent a full frame instead of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FullReason {
    NewDevice,
    ResyncRequested,
    LayoutChanged,
    ClockRegression,
    SequenceExhausted,
    Overflow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub full_frames: u64,
    pub delta_frames: u64,
    pub overflow_fallbacks: u64,
}

#[derive(Default)]
struct Counters {
    full_frames: AtomicU64,
    delta_frames: AtomicU64,
    overflow_fallbacks: AtomicU64,
}

/// Edge-side encoder holding one [`DeviceCodecState`] per device.
///
/// State lives in a sharded map so that encoders for different devices never
/// contend. Callers must still serialize calls for the same device.
pub struct DeltaEncoder {
    config: CodecConfig,
    states: DashMap<DeviceId, DeviceCodecState>,
    counters: Counters,
}

impl DeltaEncoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Encode `reading` for `device_id`, as a delta frame when possible.
    pub fn encode(&self, device_id: DeviceId, reading: &Reading) -> CodecResult<Vec<u8>> {
        if reading.device_id != device_id {
            return Err(CodecError::DeviceMismatch {
                expected: device_id,
                actual: reading.device_id,
            });
        }
        if reading.depth_index == Some(NO_DEPTH) {
            return Err(CodecError::ReservedDepth(NO_DEPTH));
        }

        match self.states.entry(device_id) {
            Entry::Vacant(vacant) => {
                let bytes = self.full_frame(reading, FullReason::NewDevice)?;
                vacant.insert(DeviceCodecState::from_full(reading.clone()));
                Ok(bytes)
            }
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                match self.plan_delta(state, reading) {
                    Ok((frame, quantized, drift)) => {
                        let bytes = frame.to_bytes();
                        state.reference = reading.clone();
                        state.quantized = quantized;
                        state.drift = drift;
                        state.last_seq = frame.seq;
                        self.counters.delta_frames.fetch_add(1, Ordering::Relaxed);
                        Ok(bytes)
                    }
                    Err(reason) => {
                        let bytes = self.full_frame(reading, reason)?;
                        *state = DeviceCodecState::from_full(reading.clone());
                        Ok(bytes)
                    }
                }
            }
        }
    }

    /// Encode several devices' readings into one batch frame.
    pub fn encode_batch(&self, readings: &[Reading]) -> CodecResult<Vec<u8>> {
        let frames = readings
            .iter()
            .map(|r| self.encode(r.device_id, r))
            .collect::<CodecResult<Vec<_>>>()?;
        pack_frames(&frames)
    }

    /// Force the next frame for `device_id` to be a full frame.
    pub fn request_full(&self, device_id: DeviceId) {
        if let Some(mut state) = self.states.get_mut(&device_id) {
            state.resync_pending = true;
        }
    }

    /// Forget a device entirely.
    pub fn forget(&self, device_id: DeviceId) {
        self.states.remove(&device_id);
    }

    pub fn state(&self, device_id: DeviceId) -> Option<DeviceCodecState> {
        self.states.get(&device_id).map(|s| s.clone())
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            full_frames: self.counters.full_frames.load(Ordering::Relaxed),
            delta_frames: self.counters.delta_frames.load(Ordering::Relaxed),
            overflow_fallbacks: self.counters.overflow_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn full_frame(&self, reading: &Reading, reason: FullReason) -> CodecResult<Vec<u8>> {
        let frame = FullFrame {
            device_id: reading.device_id,
            field_id: reading.field_id,
            timestamp: reading.timestamp,
            depth_index: reading.depth_index,
            channels: reading.channels.to_vec(),
        };
        let bytes = frame.to_bytes()?;

        if reason == FullReason::Overflow {
            self.counters
                .overflow_fallbacks
                .fetch_add(1, Ordering::Relaxed);
        }
        self.counters.full_frames.fetch_add(1, Ordering::Relaxed);
        debug!(device_id = reading.device_id.0, ?reason, "Encoded full frame");

        Ok(bytes)
    }

    #[allow(clippy::type_complexity)]
    fn plan_delta(
        &self,
        state: &DeviceCodecState,
        reading: &Reading,
    ) -> Result<(DeltaFrame, Box<[Option<i64>]>, Box<[f64]>), FullReason> {
        if state.resync_pending {
            return Err(FullReason::ResyncRequested);
        }
        let reference = &state.reference;
        if reference.field_id != reading.field_id
            || reference.depth_index != reading.depth_index
            || !reference.same_layout(reading)
        {
            return Err(FullReason::LayoutChanged);
        }
        let timestamp_delta = reading
            .timestamp
            .0
            .checked_sub(reference.timestamp.0)
            .ok_or(FullReason::ClockRegression)?;
        let seq = state.next_seq().ok_or(FullReason::SequenceExhausted)?;

        let mut deltas = Vec::with_capacity(reading.channels.len());
        let mut quantized = Vec::with_capacity(reading.channels.len());
        let mut drift = Vec::with_capacity(reading.channels.len());
        for (channel, previous) in reading.channels.iter().zip(state.quantized.iter()) {
            let value = channel.value.into_inner();
            let (Some(current), Some(previous)) = (quantize(value), *previous) else {
                return Err(FullReason::Overflow);
            };
            deltas.push(current - previous);
            quantized.push(Some(current));
            drift.push((value - current as f64 / QUANT_SCALE).abs());
        }

        let width = match DeltaWidth::select(&deltas, self.config.max_delta_width) {
            Ok(width) => width,
            Err(e) => {
                debug!(device_id = reading.device_id.0, error = %e, "Delta overflow, falling back");
                return Err(FullReason::Overflow);
            }
        };

        Ok((
            DeltaFrame {
                device_id: reading.device_id,
                seq,
                timestamp_delta,
                width,
                deltas,
            },
            quantized.into_boxed_slice(),
            drift.into_boxed_slice(),
        ))
    }
}

impl Default for DeltaEncoder {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

/// Receiver-side decoder holding one [`DeviceCodecState`] per device.
#[derive(Default)]
pub struct DeltaDecoder {
    states: DashMap<DeviceId, DeviceCodecState>,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame sent by `device_id`.
    pub fn decode(&self, device_id: DeviceId, bytes: &[u8]) -> CodecResult<Reading> {
        let frame = Frame::parse(bytes)?;
        if frame.device_id() != device_id {
            return Err(CodecError::DeviceMismatch {
                expected: device_id,
                actual: frame.device_id(),
            });
        }

        match frame {
            Frame::Full(full) => {
                let reading = Reading::new(
                    full.device_id,
                    full.field_id,
                    full.timestamp,
                    full.channels,
                    full.depth_index,
                )?;
                self.states
                    .insert(device_id, DeviceCodecState::from_full(reading.clone()));
                Ok(reading)
            }
            Frame::Delta(delta) => self.apply_delta(device_id, delta),
        }
    }

    /// Decode a batch frame. Each inner frame succeeds or fails on its own.
    pub fn decode_batch(&self, bytes: &[u8]) -> CodecResult<Vec<CodecResult<Reading>>> {
        let frames = unpack_frames(bytes)?;
        Ok(frames
            .into_iter()
            .map(|frame| {
                let device_id = peek_device_id(frame)?;
                self.decode(device_id, frame)
            })
            .collect())
    }

    /// Drop state for a device; its next delta frame will require a resync.
    pub fn reset(&self, device_id: DeviceId) {
        self.states.remove(&device_id);
    }

    pub fn tracked_devices(&self) -> usize {
        self.states.len()
    }

    fn apply_delta(&self, device_id: DeviceId, delta: DeltaFrame) -> CodecResult<Reading> {
        let Entry::Occupied(mut occupied) = self.states.entry(device_id) else {
            return Err(CodecError::ResyncRequired {
                device_id,
                expected: None,
                received: delta.seq,
            });
        };

        match reconstruct(occupied.get(), device_id, &delta) {
            Ok((reading, quantized)) => {
                let state = occupied.get_mut();
                state.reference = reading.clone();
                state.quantized = quantized;
                state.last_seq = delta.seq;
                Ok(reading)
            }
            Err(e) => {
                // Continuity is lost either way; wait for a full frame.
                occupied.remove();
                Err(e)
            }
        }
    }
}

fn reconstruct(
    state: &DeviceCodecState,
    device_id: DeviceId,
    delta: &DeltaFrame,
) -> CodecResult<(Reading, Box<[Option<i64>]>)> {
    let expected = state.next_seq();
    let resync = CodecError::ResyncRequired {
        device_id,
        expected,
        received: delta.seq,
    };
    if expected != Some(delta.seq) {
        return Err(resync);
    }
    if delta.deltas.len() != state.reference.channels.len() {
        return Err(CodecError::Malformed("delta channel count"));
    }
    let timestamp = state
        .reference
        .timestamp
        .0
        .checked_add(delta.timestamp_delta)
        .ok_or(CodecError::Malformed("timestamp overflow"))?;

    let mut quantized = Vec::with_capacity(delta.deltas.len());
    let mut channels = Vec::with_capacity(delta.deltas.len());
    for ((d, previous), reference) in delta
        .deltas
        .iter()
        .zip(state.quantized.iter())
        .zip(state.reference.channels.iter())
    {
        let next = previous
            .and_then(|q| q.checked_add(*d))
            .ok_or_else(|| resync.clone())?;
        channels.push(ChannelValue::new(reference.kind, next as f64 / QUANT_SCALE)?);
        quantized.push(Some(next));
    }

    let reading = Reading::new(
        device_id,
        state.reference.field_id,
        DeviceTimestamp(timestamp),
        channels,
        state.reference.depth_index,
    )?;

    Ok((reading, quantized.into_boxed_slice()))
}
