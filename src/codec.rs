//! Frame codecs: newline-delimited and length-prefixed.
//!
//! A codec slices application frames out of a raw byte stream and writes
//! outbound frames into a connection's output buffer. Every accepted
//! connection gets its own codec instance via [`Codec::clone_boxed`];
//! decoder state must never be shared between connections.

use crate::buffer::Buffer;
use std::ops::Range;

/// End-of-transmission sentinel recognized by [`LineCodec`] when it
/// arrives as a lone byte.
pub const EOT: u8 = 0x04;

/// A successfully decoded frame.
///
/// `payload` indexes into the input that was handed to
/// [`Codec::try_decode`]; `consumed` is how many input bytes the caller
/// must drop, framing included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub consumed: usize,
    pub payload: Range<usize>,
}

/// Codec failure. Decode errors close the connection; encode errors are
/// returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Length-prefixed header did not start with the expected magic.
    InvalidMagic,
    /// Declared payload length was non-positive or above the limit.
    InvalidLength { len: i64, max: usize },
    /// Line-framed messages cannot contain a newline.
    ContainsNewline,
    /// Outbound frame exceeds what the wire format can carry.
    Oversize { len: usize, max: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidMagic => write!(f, "invalid frame magic"),
            CodecError::InvalidLength { len, max } => {
                write!(f, "invalid frame length {len} (max {max})")
            }
            CodecError::ContainsNewline => {
                write!(f, "message contains '\\n' which would break line framing")
            }
            CodecError::Oversize { len, max } => {
                write!(f, "message length {len} exceeds maximum {max}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Frame decoder/encoder, polymorphic over the wire format.
pub trait Codec: Send {
    /// Attempt to slice one frame off the front of `data`.
    ///
    /// `Ok(Some(frame))` on success, `Ok(None)` when more bytes are
    /// needed, `Err` on a protocol violation.
    fn try_decode(&self, data: &[u8]) -> Result<Option<Frame>, CodecError>;

    /// Append the encoded form of `msg` to `out`.
    fn encode(&self, msg: &[u8], out: &mut Buffer) -> Result<(), CodecError>;

    /// Fresh codec with the same parameters, for per-connection use.
    fn clone_boxed(&self) -> Box<dyn Codec>;
}

/// Frames terminated by `\n`, with an optional preceding `\r` stripped.
///
/// A lone [`EOT`] byte is delivered as a one-byte frame so peers can
/// signal end of transmission.
#[derive(Debug, Default, Clone)]
pub struct LineCodec;

impl Codec for LineCodec {
    fn try_decode(&self, data: &[u8]) -> Result<Option<Frame>, CodecError> {
        if data.len() == 1 && data[0] == EOT {
            return Ok(Some(Frame {
                consumed: 1,
                payload: 0..1,
            }));
        }
        match data.iter().position(|&b| b == b'\n') {
            Some(i) => {
                let end = if i > 0 && data[i - 1] == b'\r' { i - 1 } else { i };
                Ok(Some(Frame {
                    consumed: i + 1,
                    payload: 0..end,
                }))
            }
            None => Ok(None),
        }
    }

    fn encode(&self, msg: &[u8], out: &mut Buffer) -> Result<(), CodecError> {
        if msg.contains(&b'\n') {
            return Err(CodecError::ContainsNewline);
        }
        out.append(msg);
        out.append(b"\r\n");
        Ok(())
    }

    fn clone_boxed(&self) -> Box<dyn Codec> {
        Box::new(LineCodec)
    }
}

/// Length-prefixed frames: 4-byte magic, big-endian i32 payload length,
/// then the payload.
#[derive(Debug, Clone)]
pub struct LengthCodec {
    max_msg_len: usize,
}

impl LengthCodec {
    /// Wire magic prefixed to every frame.
    pub const MAGIC: &'static [u8; 4] = b"mBdT";
    /// Bytes of magic plus length field.
    pub const HEADER_LEN: usize = 8;
    /// Default payload ceiling (1 MiB).
    pub const DEFAULT_MAX_MSG_LEN: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self {
            max_msg_len: Self::DEFAULT_MAX_MSG_LEN,
        }
    }

    /// Codec with a custom payload ceiling.
    pub fn with_max_len(max_msg_len: usize) -> Self {
        Self {
            max_msg_len: max_msg_len.max(1),
        }
    }

    pub fn max_msg_len(&self) -> usize {
        self.max_msg_len
    }
}

impl Default for LengthCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for LengthCodec {
    fn try_decode(&self, data: &[u8]) -> Result<Option<Frame>, CodecError> {
        if data.len() < Self::HEADER_LEN {
            return Ok(None);
        }
        if &data[..4] != Self::MAGIC {
            return Err(CodecError::InvalidMagic);
        }
        let len = i32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if len <= 0 || len as usize > self.max_msg_len {
            return Err(CodecError::InvalidLength {
                len: len as i64,
                max: self.max_msg_len,
            });
        }
        let total = Self::HEADER_LEN + len as usize;
        if data.len() < total {
            return Ok(None);
        }
        Ok(Some(Frame {
            consumed: total,
            payload: Self::HEADER_LEN..total,
        }))
    }

    fn encode(&self, msg: &[u8], out: &mut Buffer) -> Result<(), CodecError> {
        if msg.len() > self.max_msg_len || msg.len() > i32::MAX as usize {
            return Err(CodecError::Oversize {
                len: msg.len(),
                max: self.max_msg_len.min(i32::MAX as usize),
            });
        }
        out.append(Self::MAGIC);
        out.append(&(msg.len() as i32).to_be_bytes());
        out.append(msg);
        Ok(())
    }

    fn clone_boxed(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &dyn Codec, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            match codec.try_decode(data).unwrap() {
                Some(frame) => {
                    frames.push(data[frame.payload.clone()].to_vec());
                    data = &data[frame.consumed..];
                }
                None => break,
            }
        }
        frames
    }

    #[test]
    fn test_line_decode_lf_and_crlf() {
        let codec = LineCodec;

        let frame = codec.try_decode(b"hello\n").unwrap().unwrap();
        assert_eq!(frame.consumed, 6);
        assert_eq!(&b"hello\n"[frame.payload], b"hello");

        let frame = codec.try_decode(b"hello\r\nrest").unwrap().unwrap();
        assert_eq!(frame.consumed, 7);
        assert_eq!(&b"hello\r\nrest"[frame.payload], b"hello");
    }

    #[test]
    fn test_line_decode_incomplete() {
        let codec = LineCodec;
        assert_eq!(codec.try_decode(b"partial").unwrap(), None);
        assert_eq!(codec.try_decode(b"").unwrap(), None);
    }

    #[test]
    fn test_line_eot_sentinel() {
        let codec = LineCodec;
        let frame = codec.try_decode(&[EOT]).unwrap().unwrap();
        assert_eq!(frame.consumed, 1);
        assert_eq!(frame.payload, 0..1);

        // EOT mixed with other bytes is ordinary data, not a sentinel.
        assert_eq!(codec.try_decode(&[EOT, b'x']).unwrap(), None);
    }

    #[test]
    fn test_line_encode_roundtrip() {
        let codec = LineCodec;
        let mut out = Buffer::new();
        codec.encode(b"ping", &mut out).unwrap();
        assert_eq!(out.data(), b"ping\r\n");

        let frame = codec.try_decode(out.data()).unwrap().unwrap();
        assert_eq!(frame.consumed, 6); // len + 2
        assert_eq!(&out.data()[frame.payload], b"ping");
    }

    #[test]
    fn test_line_encode_rejects_newline() {
        let codec = LineCodec;
        let mut out = Buffer::new();
        assert_eq!(
            codec.encode(b"a\nb", &mut out),
            Err(CodecError::ContainsNewline)
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_length_fragmented_delivery() {
        let codec = LengthCodec::new();
        let mut stream = Vec::new();
        stream.extend_from_slice(b"mBdT");
        stream.extend_from_slice(&5i32.to_be_bytes());
        stream.extend_from_slice(b"he");

        assert_eq!(codec.try_decode(&stream).unwrap(), None);

        stream.extend_from_slice(b"llo");
        let frame = codec.try_decode(&stream).unwrap().unwrap();
        assert_eq!(frame.consumed, 13);
        assert_eq!(&stream[frame.payload], b"hello");
    }

    #[test]
    fn test_length_invalid_magic() {
        let codec = LengthCodec::new();
        let mut data = Vec::new();
        data.extend_from_slice(b"xxxx");
        data.extend_from_slice(&5i32.to_be_bytes());
        assert_eq!(codec.try_decode(&data), Err(CodecError::InvalidMagic));
    }

    #[test]
    fn test_length_invalid_length() {
        let codec = LengthCodec::with_max_len(16);
        for bad in [0i32, -1, 17] {
            let mut data = Vec::new();
            data.extend_from_slice(b"mBdT");
            data.extend_from_slice(&bad.to_be_bytes());
            assert!(matches!(
                codec.try_decode(&data),
                Err(CodecError::InvalidLength { .. })
            ));
        }
    }

    #[test]
    fn test_length_encode_roundtrip() {
        let codec = LengthCodec::new();
        let mut out = Buffer::new();
        codec.encode(b"hello", &mut out).unwrap();
        assert_eq!(out.size(), 13); // len + 8

        let frame = codec.try_decode(out.data()).unwrap().unwrap();
        assert_eq!(frame.consumed, 13);
        assert_eq!(&out.data()[frame.payload], b"hello");
    }

    #[test]
    fn test_length_encode_rejects_oversize() {
        let codec = LengthCodec::with_max_len(4);
        let mut out = Buffer::new();
        assert!(matches!(
            codec.encode(b"hello", &mut out),
            Err(CodecError::Oversize { .. })
        ));
    }

    #[test]
    fn test_concatenated_stream_decodes_in_sequence() {
        let codec = LengthCodec::new();
        let messages: &[&[u8]] = &[b"one", b"two", b"three"];
        let mut wire = Buffer::new();
        for msg in messages {
            codec.encode(msg, &mut wire).unwrap();
        }
        let frames = decode_all(&codec, wire.data());
        assert_eq!(frames, messages);

        let line = LineCodec;
        let mut wire = Buffer::new();
        for msg in messages {
            line.encode(msg, &mut wire).unwrap();
        }
        let frames = decode_all(&line, wire.data());
        assert_eq!(frames, messages);
    }

    #[test]
    fn test_clone_boxed_is_independent() {
        let codec = LengthCodec::with_max_len(64);
        let cloned = codec.clone_boxed();
        let mut out = Buffer::new();
        cloned.encode(b"ok", &mut out).unwrap();
        let frame = cloned.try_decode(out.data()).unwrap().unwrap();
        assert_eq!(&out.data()[frame.payload], b"ok");
    }
}
