use crate::{DeviceId, ReadingError};

use super::DeltaWidth;

pub type CodecResult<T> = core::result::Result<T, CodecError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The receiver lost delta continuity for this device and needs a full frame.
    #[error("device {device_id:?} needs a full frame (expected seq {expected:?}, got {received})")]
    ResyncRequired {
        device_id: DeviceId,
        expected: Option<u16>,
        received: u16,
    },
    /// A channel delta does not fit the widest allowed encoding.
    #[error("delta {delta} does not fit in {max_width:?}")]
    FrameOverflow { delta: i64, max_width: DeltaWidth },
    #[error("frame belongs to device {actual:?}, expected {expected:?}")]
    DeviceMismatch {
        expected: DeviceId,
        actual: DeviceId,
    },
    #[error("need {needed} bytes, only {available} available")]
    InsufficientData { needed: usize, available: usize },
    #[error("invalid frame type {0:#04x}")]
    InvalidFrameType(u8),
    #[error("invalid channel kind {0:#04x}")]
    InvalidChannelKind(u8),
    #[error("invalid delta width {0}")]
    InvalidDeltaWidth(u8),
    #[error("depth index {0} is reserved")]
    ReservedDepth(u8),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("payload too large: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid reading: {0}")]
    InvalidReading(#[from] ReadingError),
}

impl CodecError {
    /// True when the caller should request a full frame out of band.
    pub fn needs_resync(&self) -> bool {
        matches!(self, CodecError::ResyncRequired { .. })
    }
}
