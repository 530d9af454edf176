use bytes::{Buf, BufMut};

use crate::error::{Result, SeedlinkError};
use crate::frame::{PayloadFormat, PayloadSubformat, RawFrame};
use crate::sequence::SequenceNumber;

pub const SIGNATURE: &[u8; 2] = b"SE";

/// Minimum header size: 2 (sig) + 1 (format) + 1 (subformat) + 4 (payload len)
///                    + 8 (sequence) + 1 (station id len) = 17
pub const MIN_HEADER_LEN: usize = 17;

/// Largest payload a decoder accepts before treating the stream as corrupt.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Fixed part of a v4 header.
struct Header {
    format: PayloadFormat,
    subformat: PayloadSubformat,
    payload_len: usize,
    sequence: SequenceNumber,
    station_id_len: usize,
}

impl Header {
    fn read(mut buf: &[u8]) -> Result<Self> {
        let mut sig = [0u8; 2];
        buf.copy_to_slice(&mut sig);
        if &sig != SIGNATURE {
            return Err(SeedlinkError::InvalidSignature {
                expected: "SE",
                actual: sig,
            });
        }
        let format = PayloadFormat::from_byte(buf.get_u8())?;
        let subformat = PayloadSubformat::from_byte(buf.get_u8())?;
        let payload_len = buf.get_u32_le() as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(SeedlinkError::PayloadTooLarge {
                limit: MAX_PAYLOAD_LEN,
                actual: payload_len,
            });
        }
        let mut seq = [0u8; 8];
        buf.copy_to_slice(&mut seq);
        Ok(Self {
            format,
            subformat,
            payload_len,
            sequence: SequenceNumber::from_v4_le_bytes(seq),
            station_id_len: buf.get_u8() as usize,
        })
    }

    fn frame_len(&self) -> usize {
        MIN_HEADER_LEN + self.station_id_len + self.payload_len
    }
}

/// Total frame length declared by a header, once `MIN_HEADER_LEN` bytes
/// are available. Returns `Ok(None)` while the fixed header is incomplete.
pub fn frame_len(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < MIN_HEADER_LEN {
        return Ok(None);
    }
    Header::read(&data[..MIN_HEADER_LEN]).map(|h| Some(h.frame_len()))
}

/// Parse a v4 frame from the beginning of a buffer.
///
/// Returns `(frame, bytes_consumed)` because v4 frames are variable-length.
pub fn parse(data: &[u8]) -> Result<(RawFrame<'_>, usize)> {
    if data.len() < MIN_HEADER_LEN {
        return Err(SeedlinkError::FrameTooShort {
            expected: MIN_HEADER_LEN,
            actual: data.len(),
        });
    }
    let header = Header::read(&data[..MIN_HEADER_LEN])?;
    let total_len = header.frame_len();
    if data.len() < total_len {
        return Err(SeedlinkError::FrameTooShort {
            expected: total_len,
            actual: data.len(),
        });
    }

    let (id_bytes, payload) =
        data[MIN_HEADER_LEN..total_len].split_at(header.station_id_len);
    let station_id = std::str::from_utf8(id_bytes)
        .map_err(|_| SeedlinkError::InvalidResponse("station ID is not valid UTF-8".into()))?;

    let frame = RawFrame::V4 {
        format: header.format,
        subformat: header.subformat,
        sequence: header.sequence,
        station_id,
        payload,
    };
    Ok((frame, total_len))
}

/// Write a v4 frame.
pub fn write(
    format: PayloadFormat,
    subformat: PayloadSubformat,
    sequence: SequenceNumber,
    station_id: &str,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let id = station_id.as_bytes();
    let id_len = u8::try_from(id.len())
        .map_err(|_| SeedlinkError::StationIdTooLong(station_id.to_owned()))?;
    let payload_len = u32::try_from(payload.len())
        .ok()
        .filter(|&n| n as usize <= MAX_PAYLOAD_LEN)
        .ok_or(SeedlinkError::PayloadTooLarge {
            limit: MAX_PAYLOAD_LEN,
            actual: payload.len(),
        })?;

    let mut frame = Vec::with_capacity(MIN_HEADER_LEN + id.len() + payload.len());
    frame.put_slice(SIGNATURE);
    frame.put_u8(format.to_byte());
    frame.put_u8(subformat.to_byte());
    frame.put_u32_le(payload_len);
    frame.put_slice(&sequence.to_v4_le_bytes());
    frame.put_u8(id_len);
    frame.put_slice(id);
    frame.put_slice(payload);
    Ok(frame)
}
