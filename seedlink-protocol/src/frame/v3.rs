use crate::error::{Result, SeedlinkError};
use crate::frame::RawFrame;
use crate::sequence::SequenceNumber;

pub const SIGNATURE: &[u8; 2] = b"SL";
pub const INFO_SIGNATURE: &[u8; 6] = b"SLINFO";
pub const HEADER_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 512;
pub const FRAME_LEN: usize = 520;

/// Byte 7 of an `SLINFO` header: more packets follow.
const INFO_MORE: u8 = b'*';

/// Parse a v3 frame (data or `SLINFO`) from at least 520 bytes.
pub fn parse(data: &[u8]) -> Result<RawFrame<'_>> {
    if data.len() < FRAME_LEN {
        return Err(SeedlinkError::FrameTooShort {
            expected: FRAME_LEN,
            actual: data.len(),
        });
    }

    if &data[0..2] != SIGNATURE.as_slice() {
        return Err(SeedlinkError::InvalidSignature {
            expected: "SL",
            actual: [data[0], data[1]],
        });
    }

    let payload = &data[HEADER_LEN..FRAME_LEN];

    if &data[0..6] == INFO_SIGNATURE.as_slice() {
        return Ok(RawFrame::V3Info {
            more: data[7] == INFO_MORE,
            payload,
        });
    }

    // Sequence number: 6 hex ASCII chars at bytes 2..8
    let hex_str = std::str::from_utf8(&data[2..8])
        .map_err(|_| SeedlinkError::InvalidSequence("sequence bytes are not valid UTF-8".into()))?;
    let sequence = SequenceNumber::from_v3_hex(hex_str)?;

    Ok(RawFrame::V3 { sequence, payload })
}

/// Write a v3 data frame (520 bytes). Only the low 24 bits of the sequence
/// go on the wire.
pub fn write(sequence: SequenceNumber, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() != PAYLOAD_LEN {
        return Err(SeedlinkError::PayloadLengthMismatch {
            expected: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(SIGNATURE);
    frame.extend_from_slice(sequence.to_v3_wire().to_v3_hex().as_bytes());
    frame.extend_from_slice(payload);

    debug_assert_eq!(frame.len(), FRAME_LEN);
    Ok(frame)
}

/// Write one `SLINFO` packet, NUL-padding the payload to 512 bytes.
pub fn write_info(more: bool, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > PAYLOAD_LEN {
        return Err(SeedlinkError::PayloadTooLarge {
            limit: PAYLOAD_LEN,
            actual: payload.len(),
        });
    }

    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(INFO_SIGNATURE);
    frame.push(b' ');
    frame.push(if more { INFO_MORE } else { b' ' });
    frame.extend_from_slice(payload);
    frame.resize(FRAME_LEN, 0);
    Ok(frame)
}

/// Split a document into as many `SLINFO` packets as needed.
///
/// An empty document still produces one (empty, final) packet.
pub fn write_info_packets(doc: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if doc.is_empty() {
        vec![&doc[..0]]
    } else {
        doc.chunks(PAYLOAD_LEN).collect()
    };
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .filter_map(|(i, chunk)| write_info(i < last, chunk).ok())
        .collect()
}

/// Strip the NUL padding from an `SLINFO` payload.
pub fn trim_info_payload(payload: &[u8]) -> &[u8] {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    &payload[..end]
}
