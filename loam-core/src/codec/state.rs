use crate::Reading;

use super::quantize;

/// Per-device delta state. Owned by one encoder or decoder, never shared.
#[derive(Debug, Clone)]
pub struct DeviceCodecState {
    /// Last reading as the receiving side sees it; deltas are taken against it.
    pub reference: Reading,
    /// `reference` quantized at `QUANT_SCALE`; `None` for values out of range.
    pub quantized: Box<[Option<i64>]>,
    /// Sequence number of the last frame. Full frames reset it to zero.
    pub last_seq: u16,
    /// Absolute quantization residual of the last frame, per channel.
    pub drift: Box<[f64]>,
    /// Set when the receiver asked for a full frame.
    pub resync_pending: bool,
}

impl DeviceCodecState {
    pub(crate) fn from_full(reading: Reading) -> Self {
        let quantized = reading
            .channels
            .iter()
            .map(|c| quantize(c.value.into_inner()))
            .collect();
        let drift = vec![0.0; reading.channels.len()].into_boxed_slice();

        Self {
            reference: reading,
            quantized,
            last_seq: 0,
            drift,
            resync_pending: false,
        }
    }

    /// Largest residual across channels.
    pub fn max_drift(&self) -> f64 {
        self.drift.iter().copied().fold(0.0, f64::max)
    }

    pub(crate) fn next_seq(&self) -> Option<u16> {
        self.last_seq.checked_add(1)
    }
}
