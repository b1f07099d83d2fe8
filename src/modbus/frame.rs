//! MBAP framing over a TCP byte stream.
//!
//! TCP delivers bytes, not messages: one read may carry half a frame or
//! several frames glued together. [`AduCodec`] buffers until the 6-byte
//! header is available, then until `6 + length` bytes are present, and
//! only then splits one frame off the front of the buffer.

use std::io;

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

/// Transaction id, protocol id and length.
pub const MBAP_HEADER_LEN: usize = 6;

/// Largest Modbus TCP ADU.
pub const MAX_ADU_LEN: usize = 260;

/// Total length of the first frame in `buf`, if it is complete.
pub fn complete_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < MBAP_HEADER_LEN {
        return None;
    }
    let length = BigEndian::read_u16(&buf[4..MBAP_HEADER_LEN]) as usize;
    let total = MBAP_HEADER_LEN + length;
    (buf.len() >= total).then_some(total)
}

/// Splits complete ADUs off a growing stream buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AduCodec;

impl Decoder for AduCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match complete_frame_len(src) {
            Some(total) => Ok(Some(src.split_to(total))),
            None => {
                src.reserve(MAX_ADU_LEN.saturating_sub(src.len()));
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    trace!(bytes = src.len(), "discarding partial frame at end of stream");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn adu(tid: u16, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(1);
        frame.extend_from_slice(pdu);
        frame
    }

    fn drain(codec: &mut AduCodec, buf: &mut BytesMut) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame.to_vec());
        }
        frames
    }

    #[test]
    fn test_partial_header_emits_nothing() {
        let mut codec = AduCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_partial_body_is_kept() {
        let frame = adu(7, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        let mut codec = AduCodec;
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().to_vec(), frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_coalesced_frames_are_split() {
        let a = adu(1, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        let b = adu(2, &[0x06, 0x00, 0x01, 0x12, 0x34]);
        let c = adu(3, &[0x04, 0x00, 0x00, 0x00, 0x01]);
        let mut stream = [a.clone(), b.clone()].concat();
        stream.extend_from_slice(&c[..4]);

        let mut codec = AduCodec;
        let mut buf = BytesMut::from(&stream[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![a, b]);
        assert_eq!(buf.to_vec(), c[..4].to_vec());
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let frame = adu(9, &[0x04, 0x00, 0x02, 0x00, 0x03]);
        let mut codec = AduCodec;
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in &frame {
            buf.extend_from_slice(&[*byte]);
            out.extend(drain(&mut codec, &mut buf));
        }
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn test_eof_discards_partial_frame() {
        let mut codec = AduCodec;
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01][..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    fn frames_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(
            (any::<u16>(), prop::collection::vec(any::<u8>(), 1..16))
                .prop_map(|(tid, pdu)| adu(tid, &pdu)),
            0..8,
        )
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_frames(
            frames in frames_strategy(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let stream = frames.concat();

            let mut whole = BytesMut::from(&stream[..]);
            let expected = drain(&mut AduCodec, &mut whole);
            prop_assert_eq!(&expected, &frames);

            let mut points: Vec<usize> = if stream.is_empty() {
                Vec::new()
            } else {
                cuts.iter().map(|i| i.index(stream.len())).collect()
            };
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut codec = AduCodec;
            let mut buf = BytesMut::new();
            let mut chunked = Vec::new();
            for pair in points.windows(2) {
                buf.extend_from_slice(&stream[pair[0]..pair[1]]);
                chunked.extend(drain(&mut codec, &mut buf));
            }
            prop_assert_eq!(chunked, expected);
            prop_assert!(buf.is_empty());
        }
    }
}
