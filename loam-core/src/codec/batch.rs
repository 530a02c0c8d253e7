use super::error::{CodecError, CodecResult};
use super::frame::{Cursor, FrameType};

// batch frame : type(1) + count(2) + count * (len(2) + frame)

const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Pack already-encoded device frames under one batch header.
pub fn pack_frames<F: AsRef<[u8]>>(frames: &[F]) -> CodecResult<Vec<u8>> {
    if frames.len() > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge {
            size: frames.len(),
            max: u16::MAX as usize,
        });
    }

    let body: usize = frames.iter().map(|f| f.as_ref().len() + 2).sum();
    let mut bytes = Vec::with_capacity(3 + body);
    bytes.push(FrameType::Batch as u8);
    bytes.extend_from_slice(&(frames.len() as u16).to_le_bytes());

    for frame in frames {
        let frame = frame.as_ref();
        if frame.len() > MAX_FRAME_LEN {
            return Err(CodecError::PayloadTooLarge {
                size: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }
        bytes.extend_from_slice(&(frame.len() as u16).to_le_bytes());
        bytes.extend_from_slice(frame);
    }

    Ok(bytes)
}

/// Split a batch frame into its device frames, without decoding them.
pub fn unpack_frames(bytes: &[u8]) -> CodecResult<Vec<&[u8]>> {
    let mut cursor = Cursor::new(bytes);
    let frame_type = cursor.u8()?;
    if FrameType::try_from(frame_type)? != FrameType::Batch {
        return Err(CodecError::InvalidFrameType(frame_type));
    }

    let count = cursor.u16()? as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = cursor.u16()? as usize;
        frames.push(cursor.take(len)?);
    }
    cursor.finish()?;

    Ok(frames)
}
