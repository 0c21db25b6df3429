//! Built-in codecs. These exist to exercise the [`Codec`] contract; real
//! application protocols plug in through the same trait.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Codec, ConnectionContext, FrameVerdict};

/// Newline-delimited text. One frame per `\n`, terminator included in the
/// frame and stripped by `decode`.
pub struct TextCodec;

impl Codec for TextCodec {
    fn input(&self, buffer: &[u8], ctx: &ConnectionContext) -> FrameVerdict {
        match buffer.iter().position(|&b| b == b'\n') {
            Some(pos) if pos + 1 > ctx.max_package_size => FrameVerdict::Invalid,
            Some(pos) => FrameVerdict::Frame(pos + 1),
            None if buffer.len() >= ctx.max_package_size => FrameVerdict::Invalid,
            None => FrameVerdict::Incomplete,
        }
    }

    fn decode(&self, frame: Bytes, _ctx: &ConnectionContext) -> Bytes {
        let mut frame = frame;
        if frame.last() == Some(&b'\n') {
            frame.truncate(frame.len() - 1);
            if frame.last() == Some(&b'\r') {
                frame.truncate(frame.len() - 1);
            }
        }
        frame
    }

    fn encode(&self, payload: Bytes, _ctx: &ConnectionContext) -> Bytes {
        let mut out = BytesMut::with_capacity(payload.len() + 1);
        out.put_slice(&payload);
        out.put_u8(b'\n');
        out.freeze()
    }
}

/// Length-prefixed binary frames: 4-byte big-endian total length (prefix
/// included), then the payload.
pub struct FrameCodec;

const FRAME_HEADER: usize = 4;

impl Codec for FrameCodec {
    fn input(&self, buffer: &[u8], ctx: &ConnectionContext) -> FrameVerdict {
        if buffer.len() < FRAME_HEADER {
            return FrameVerdict::Incomplete;
        }
        let total = u32::from_be_bytes(buffer[..FRAME_HEADER].try_into().expect("4 bytes")) as usize;
        if total < FRAME_HEADER || total > ctx.max_package_size {
            return FrameVerdict::Invalid;
        }
        FrameVerdict::Frame(total)
    }

    fn decode(&self, frame: Bytes, _ctx: &ConnectionContext) -> Bytes {
        frame.slice(FRAME_HEADER..)
    }

    fn encode(&self, payload: Bytes, _ctx: &ConnectionContext) -> Bytes {
        let total = payload.len() + FRAME_HEADER;
        let mut out = BytesMut::with_capacity(total);
        out.put_u32(total as u32);
        out.put_slice(&payload);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ConnectionContext {
        ConnectionContext {
            connection_id: 1,
            remote_addr: None,
            transport: "tcp",
            max_package_size: crate::DEFAULT_MAX_PACKAGE_SIZE,
        }
    }

    #[test]
    fn text_roundtrip_and_partial_input() {
        let codec = TextCodec;
        let encoded = codec.encode(Bytes::from_static(b"hello"), &ctx());
        assert_eq!(&encoded[..], b"hello\n");

        assert_eq!(codec.input(b"hel", &ctx()), FrameVerdict::Incomplete);
        assert_eq!(codec.input(b"hello\nworld", &ctx()), FrameVerdict::Frame(6));
        let decoded = codec.decode(Bytes::from_static(b"hello\n"), &ctx());
        assert_eq!(&decoded[..], b"hello");
    }

    #[test]
    fn text_strips_crlf() {
        let codec = TextCodec;
        let decoded = codec.decode(Bytes::from_static(b"hi\r\n"), &ctx());
        assert_eq!(&decoded[..], b"hi");
    }

    #[test]
    fn text_rejects_unterminated_overlong_line() {
        let codec = TextCodec;
        let small = ConnectionContext { max_package_size: 4, ..ctx() };
        assert_eq!(codec.input(b"abcde", &small), FrameVerdict::Invalid);
    }

    #[test]
    fn frame_sizes_header_plus_payload() {
        let codec = FrameCodec;
        let encoded = codec.encode(Bytes::from_static(b"abc"), &ctx());
        assert_eq!(encoded.len(), 7);

        assert_eq!(codec.input(&encoded[..2], &ctx()), FrameVerdict::Incomplete);
        assert_eq!(codec.input(&encoded, &ctx()), FrameVerdict::Frame(7));
        assert_eq!(&codec.decode(encoded, &ctx())[..], b"abc");
    }

    #[test]
    fn frame_rejects_bogus_lengths() {
        let codec = FrameCodec;
        assert_eq!(codec.input(&2_u32.to_be_bytes(), &ctx()), FrameVerdict::Invalid);

        let small = ConnectionContext { max_package_size: 8, ..ctx() };
        assert_eq!(codec.input(&100_u32.to_be_bytes(), &small), FrameVerdict::Invalid);
    }
}
