// Copyright 2024 Cobalt Network Foundation
// This file is part of the cobalt library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::MAX_FRAME_PAYLOAD;

/// The number of bytes occupied by the stream ID and the frame kind.
const HEADER_SIZE: usize = 4 + 1;

/// The kind of a frame; the discriminant is the on-wire byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Opens a new stream with the carried ID.
    Syn = 0,
    /// Carries payload bytes for an open stream.
    Data = 1,
    /// Half-closes the stream; no further payload will follow.
    Fin = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(byte: u8) -> io::Result<Self> {
        match byte {
            0 => Ok(Self::Syn),
            1 => Ok(Self::Data),
            2 => Ok(Self::Fin),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown frame kind {byte}"))),
        }
    }
}

/// A single multiplexer frame.
#[derive(Clone, Debug)]
pub(crate) struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream_id: u32) -> Self {
        Self { stream_id, kind: FrameKind::Syn, payload: Bytes::new() }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self { stream_id, kind: FrameKind::Data, payload }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self { stream_id, kind: FrameKind::Fin, payload: Bytes::new() }
    }
}

/// The codec used to decode and encode multiplexer [`Frame`]s.
pub(crate) struct FrameCodec {
    codec: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .max_frame_length(HEADER_SIZE + MAX_FRAME_PAYLOAD)
                .little_endian()
                .new_codec(),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.payload.len());
        buf.put_u32_le(frame.stream_id);
        buf.put_u8(frame.kind as u8);
        buf.extend_from_slice(&frame.payload);

        self.codec.encode(buf.freeze(), dst)
    }
}

impl Decoder for FrameCodec {
    type Error = io::Error;
    type Item = Frame;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let mut bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        if bytes.len() < HEADER_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated frame header"));
        }

        let stream_id = bytes.get_u32_le();
        let kind = FrameKind::try_from(bytes.get_u8())?;

        Ok(Some(Frame { stream_id, kind, payload: bytes.freeze() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut codec = FrameCodec::default();
        let mut bytes = BytesMut::new();

        let frame = Frame::data(7, Bytes::from_static(b"hello"));
        codec.encode(frame, &mut bytes).unwrap();

        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.kind, FrameKind::Data);
        assert_eq!(&decoded.payload[..], b"hello");
        assert!(codec.decode(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::default();
        let mut bytes = BytesMut::new();

        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX_FRAME_PAYLOAD + 1]));
        assert!(codec.encode(frame, &mut bytes).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut codec = FrameCodec::default();
        let mut bytes = BytesMut::new();

        // A frame with kind byte 9, length-prefixed by hand.
        bytes.put_u32_le(5);
        bytes.put_u32_le(3);
        bytes.put_u8(9);
        assert!(codec.decode(&mut bytes).is_err());
    }
}
