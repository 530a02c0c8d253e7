use ordered_float::NotNan;
use serde::{Deserialize, Serialize};

use super::error::{CodecError, CodecResult};
use super::*;
use crate::{ChannelKind, ChannelValue, DeviceId, DeviceTimestamp, FieldId, MAX_CHANNELS};

// full frame  : type(1) + device(4) + field(4) + timestamp(8) + depth(1) + count(1) + count * (kind(1) + value(8))
// delta frame : type(1) + device(4) + seq(2) + ts_delta(varint) + width(1) + count * width

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Full = 0x01,
    Delta = 0x02,
    Batch = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Full),
            0x02 => Ok(FrameType::Delta),
            0x03 => Ok(FrameType::Batch),
            _ => Err(CodecError::InvalidFrameType(value)),
        }
    }
}

/// Byte width of each signed channel delta in a delta frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaWidth {
    I8 = 1,
    I16 = 2,
    I32 = 4,
}

impl DeltaWidth {
    pub fn bytes(self) -> usize {
        self as usize
    }

    fn range(self) -> (i64, i64) {
        match self {
            DeltaWidth::I8 => (i8::MIN as i64, i8::MAX as i64),
            DeltaWidth::I16 => (i16::MIN as i64, i16::MAX as i64),
            DeltaWidth::I32 => (i32::MIN as i64, i32::MAX as i64),
        }
    }

    pub fn fits(self, delta: i64) -> bool {
        let (min, max) = self.range();
        (min..=max).contains(&delta)
    }

    /// Smallest width, no wider than `max`, that holds every delta.
    pub fn select(deltas: &[i64], max: DeltaWidth) -> CodecResult<DeltaWidth> {
        let mut width = DeltaWidth::I8;
        for &delta in deltas {
            while !width.fits(delta) {
                width = match width {
                    DeltaWidth::I8 if max > DeltaWidth::I8 => DeltaWidth::I16,
                    DeltaWidth::I16 if max > DeltaWidth::I16 => DeltaWidth::I32,
                    _ => {
                        return Err(CodecError::FrameOverflow {
                            delta,
                            max_width: max,
                        });
                    }
                };
            }
        }
        Ok(width)
    }
}

impl TryFrom<u8> for DeltaWidth {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeltaWidth::I8),
            2 => Ok(DeltaWidth::I16),
            4 => Ok(DeltaWidth::I32),
            _ => Err(CodecError::InvalidDeltaWidth(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullFrame {
    pub device_id: DeviceId,
    pub field_id: FieldId,
    pub timestamp: DeviceTimestamp,
    pub depth_index: Option<u8>,
    pub channels: Vec<ChannelValue>,
}

impl FullFrame {
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        if self.channels.len() > MAX_CHANNELS {
            return Err(CodecError::Malformed("too many channels"));
        }
        let depth = match self.depth_index {
            Some(NO_DEPTH) => return Err(CodecError::ReservedDepth(NO_DEPTH)),
            Some(depth) => depth,
            None => NO_DEPTH,
        };

        let mut bytes = Vec::with_capacity(FULL_HEADER_SIZE + self.channels.len() * 9);
        bytes.push(FrameType::Full as u8);
        bytes.extend_from_slice(&self.device_id.0.to_le_bytes());
        bytes.extend_from_slice(&self.field_id.0.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.0.to_le_bytes());
        bytes.push(depth);
        bytes.push(self.channels.len() as u8);
        for channel in &self.channels {
            bytes.push(channel.kind as u8);
            bytes.extend_from_slice(&channel.value.into_inner().to_le_bytes());
        }

        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let frame_type = FrameType::try_from(cursor.u8()?)?;
        if frame_type != FrameType::Full {
            return Err(CodecError::InvalidFrameType(frame_type as u8));
        }

        let device_id = DeviceId(cursor.u32()?);
        let field_id = FieldId(cursor.u32()?);
        let timestamp = DeviceTimestamp(cursor.u64()?);
        let depth_index = match cursor.u8()? {
            NO_DEPTH => None,
            depth => Some(depth),
        };
        let count = cursor.u8()? as usize;
        if count == 0 || count > MAX_CHANNELS {
            return Err(CodecError::Malformed("channel count out of range"));
        }

        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            let kind = ChannelKind::try_from(cursor.u8()?)?;
            let value = NotNan::new(cursor.f64()?)
                .map_err(|_| CodecError::Malformed("NaN channel value"))?;
            channels.push(ChannelValue { kind, value });
        }
        cursor.finish()?;

        Ok(Self {
            device_id,
            field_id,
            timestamp,
            depth_index,
            channels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub device_id: DeviceId,
    pub seq: u16,
    pub timestamp_delta: u64,
    pub width: DeltaWidth,
    pub deltas: Vec<i64>,
}

impl DeltaFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DELTA_HEADER_SIZE + 10 + self.deltas.len() * 4);
        bytes.push(FrameType::Delta as u8);
        bytes.extend_from_slice(&self.device_id.0.to_le_bytes());
        bytes.extend_from_slice(&self.seq.to_le_bytes());
        write_varint(self.timestamp_delta, &mut bytes);
        bytes.push(self.width as u8);
        for &delta in &self.deltas {
            match self.width {
                DeltaWidth::I8 => bytes.extend_from_slice(&(delta as i8).to_le_bytes()),
                DeltaWidth::I16 => bytes.extend_from_slice(&(delta as i16).to_le_bytes()),
                DeltaWidth::I32 => bytes.extend_from_slice(&(delta as i32).to_le_bytes()),
            }
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let frame_type = FrameType::try_from(cursor.u8()?)?;
        if frame_type != FrameType::Delta {
            return Err(CodecError::InvalidFrameType(frame_type as u8));
        }

        let device_id = DeviceId(cursor.u32()?);
        let seq = cursor.u16()?;
        let timestamp_delta = cursor.varint()?;
        let width = DeltaWidth::try_from(cursor.u8()?)?;

        let rest = cursor.remaining();
        if rest == 0 || rest % width.bytes() != 0 {
            return Err(CodecError::Malformed("delta section length"));
        }

        let count = rest / width.bytes();
        if count > MAX_CHANNELS {
            return Err(CodecError::Malformed("channel count out of range"));
        }

        let mut deltas = Vec::with_capacity(count);
        for _ in 0..count {
            let delta = match width {
                DeltaWidth::I8 => cursor.u8()? as i8 as i64,
                DeltaWidth::I16 => cursor.u16()? as i16 as i64,
                DeltaWidth::I32 => cursor.u32()? as i32 as i64,
            };
            deltas.push(delta);
        }

        Ok(Self {
            device_id,
            seq,
            timestamp_delta,
            width,
            deltas,
        })
    }
}

/// A single device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Full(FullFrame),
    Delta(DeltaFrame),
}

impl Frame {
    pub fn parse(bytes: &[u8]) -> CodecResult<Self> {
        let first = *bytes.first().ok_or(CodecError::InsufficientData {
            needed: 1,
            available: 0,
        })?;

        match FrameType::try_from(first)? {
            FrameType::Full => FullFrame::from_bytes(bytes).map(Frame::Full),
            FrameType::Delta => DeltaFrame::from_bytes(bytes).map(Frame::Delta),
            FrameType::Batch => Err(CodecError::InvalidFrameType(first)),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        match self {
            Frame::Full(f) => f.device_id,
            Frame::Delta(f) => f.device_id,
        }
    }
}

/// Read the device id of a full or delta frame without decoding it.
pub fn peek_device_id(bytes: &[u8]) -> CodecResult<DeviceId> {
    let mut cursor = Cursor::new(bytes);
    match FrameType::try_from(cursor.u8()?)? {
        FrameType::Full | FrameType::Delta => Ok(DeviceId(cursor.u32()?)),
        FrameType::Batch => Err(CodecError::InvalidFrameType(FrameType::Batch as u8)),
    }
}

pub(crate) fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let available = self.bytes.len() - self.pos;
        if available < n {
            return Err(CodecError::InsufficientData {
                needed: self.pos + n,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub(crate) fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> CodecResult<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn varint(&mut self) -> CodecResult<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            let bits = (byte & 0x7F) as u64;
            if shift == 63 && bits > 1 {
                return Err(CodecError::Malformed("varint overflow"));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::Malformed("varint overflow"))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn finish(&self) -> CodecResult<()> {
        if self.remaining() != 0 {
            return Err(CodecError::Malformed("trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_selection_is_minimal() {
        assert_eq!(
            DeltaWidth::select(&[-40, 3], DeltaWidth::I32).unwrap(),
            DeltaWidth::I8
        );
        assert_eq!(
            DeltaWidth::select(&[1, 200], DeltaWidth::I32).unwrap(),
            DeltaWidth::I16
        );
        assert_eq!(
            DeltaWidth::select(&[-70_000], DeltaWidth::I32).unwrap(),
            DeltaWidth::I32
        );
    }

    #[test]
    fn width_selection_reports_overflow() {
        let err = DeltaWidth::select(&[5, 300], DeltaWidth::I8).unwrap_err();
        assert_eq!(
            err,
            CodecError::FrameOverflow {
                delta: 300,
                max_width: DeltaWidth::I8
            }
        );
    }

    #[test]
    fn varint_handles_multi_byte_values() {
        for value in [0u64, 127, 128, 15_000, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(value, &mut buf);
            assert_eq!(Cursor::new(&buf).varint().unwrap(), value);
        }
    }

    #[test]
    fn truncated_full_frame_is_rejected() {
        let frame = FullFrame {
            device_id: DeviceId(9),
            field_id: FieldId(1),
            timestamp: DeviceTimestamp(5),
            depth_index: None,
            channels: vec![ChannelValue::new(ChannelKind::Moisture, 12.0).unwrap()],
        };
        let bytes = frame.to_bytes().unwrap();
        let err = FullFrame::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::InsufficientData { .. }));
    }

    #[test]
    fn delta_frame_negative_values_survive() {
        let frame = DeltaFrame {
            device_id: DeviceId(1),
            seq: 4,
            timestamp_delta: 15_000,
            width: DeltaWidth::I16,
            deltas: vec![-40, 1_200, -32_768],
        };
        let parsed = DeltaFrame::from_bytes(&frame.to_bytes()).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn reserved_depth_is_rejected() {
        let frame = FullFrame {
            device_id: DeviceId(9),
            field_id: FieldId(1),
            timestamp: DeviceTimestamp(5),
            depth_index: Some(NO_DEPTH),
            channels: vec![ChannelValue::new(ChannelKind::Moisture, 12.0).unwrap()],
        };
        assert_eq!(
            frame.to_bytes().unwrap_err(),
            CodecError::ReservedDepth(NO_DEPTH)
        );
    }
}
