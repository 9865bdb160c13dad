//! Spill-frame codec.
//!
//! Fetch workers append one frame per fetched chunk to their spill file; the
//! merger decodes them back incrementally while the file may still be
//! growing. A frame is a 4-byte big-endian length prefix followed by a
//! serialized batch of [`MessageRecord`]s. There is no file header and no
//! trailer: a truncated trailing frame (a crashed or still-writing worker)
//! is simply left undecoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::MessageRecord;

/// Size of the length prefix preceding every frame payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Encodes a batch of messages into a single length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the batch fails to serialize or its encoded size
/// exceeds the 32-bit length prefix.
pub fn encode_frame(batch: &[MessageRecord]) -> Result<Bytes> {
    let payload = serde_json::to_vec(batch)?;
    let len = u32::try_from(payload.len()).map_err(|_| Error::InvalidRequest {
        reason: format!("frame payload too large ({} bytes)", payload.len()),
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Splits one complete frame payload off the front of `buf`, if present.
///
/// Returns `None` when the buffer holds less than a full frame (either a
/// partial header or a partial body); the partial bytes stay in `buf` so the
/// caller can read more and retry. This is what makes truncated trailing
/// frames harmless: they never decode, they just linger.
pub fn try_split_frame(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < FRAME_HEADER_LEN + len {
        return None;
    }
    buf.advance(FRAME_HEADER_LEN);
    Some(buf.split_to(len).freeze())
}

/// Decodes a frame payload back into its message batch.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<MessageRecord>> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(ids: &[i64]) -> Vec<MessageRecord> {
        ids.iter().map(|&id| MessageRecord::bare(id)).collect()
    }

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(&batch(&[1, 2, 3])).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_split_frame(&mut buf).expect("one complete frame");
        assert!(buf.is_empty());

        let decoded = decode_batch(&payload).unwrap();
        assert_eq!(decoded, batch(&[1, 2, 3]));
    }

    #[test]
    fn multiple_frames_split_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&batch(&[10])).unwrap());
        buf.extend_from_slice(&encode_frame(&batch(&[20, 21])).unwrap());

        let first = try_split_frame(&mut buf).unwrap();
        assert_eq!(decode_batch(&first).unwrap(), batch(&[10]));
        let second = try_split_frame(&mut buf).unwrap();
        assert_eq!(decode_batch(&second).unwrap(), batch(&[20, 21]));
        assert!(try_split_frame(&mut buf).is_none());
    }

    #[test]
    fn partial_header_is_left_in_place() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(try_split_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_body_is_left_in_place() {
        let frame = encode_frame(&batch(&[42])).unwrap();
        let cut = frame.len() - 3;
        let mut buf = BytesMut::from(&frame[..cut]);
        assert!(try_split_frame(&mut buf).is_none());
        assert_eq!(buf.len(), cut);

        // Completing the frame makes it decodable.
        buf.extend_from_slice(&frame[cut..]);
        let payload = try_split_frame(&mut buf).unwrap();
        assert_eq!(decode_batch(&payload).unwrap(), batch(&[42]));
    }

    #[test]
    fn empty_batch_encodes() {
        let frame = encode_frame(&[]).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let payload = try_split_frame(&mut buf).unwrap();
        assert!(decode_batch(&payload).unwrap().is_empty());
    }
}
