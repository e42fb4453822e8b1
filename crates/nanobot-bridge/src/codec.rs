//! Length-delimited framing for the bridge byte stream.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. A bad frame never desynchronises the stream: oversized frames are
//! skipped byte-exactly and undecodable ones are handed up as errors, so the
//! reader can log them and keep going.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::BridgeFrame;

const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {declared} bytes exceeds max size of {limit}")]
    TooLarge { declared: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Head,
    Body(usize),
    Discard { remaining: usize, declared: usize },
}

#[derive(Debug)]
pub struct BridgeCodec {
    max_frame_bytes: usize,
    state: DecodeState,
}

impl BridgeCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            state: DecodeState::Head,
        }
    }
}

impl Decoder for BridgeCodec {
    /// A frame, or the reason this one frame was dropped.
    type Item = Result<BridgeFrame, FrameError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if src.len() < HEADER_LEN {
                        src.reserve(HEADER_LEN - src.len());
                        return Ok(None);
                    }
                    let len = src.get_u32() as usize;
                    if len > self.max_frame_bytes {
                        self.state = DecodeState::Discard {
                            remaining: len,
                            declared: len,
                        };
                    } else {
                        src.reserve(len);
                        self.state = DecodeState::Body(len);
                    }
                }
                DecodeState::Body(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let raw = src.split_to(len);
                    self.state = DecodeState::Head;
                    let frame = BridgeFrame::parse_json(&raw)
                        .map_err(|e| FrameError::Malformed(e.to_string()));
                    return Ok(Some(frame));
                }
                DecodeState::Discard {
                    remaining,
                    declared,
                } => {
                    let skip = remaining.min(src.len());
                    src.advance(skip);
                    let left = remaining - skip;
                    if left > 0 {
                        self.state = DecodeState::Discard {
                            remaining: left,
                            declared,
                        };
                        return Ok(None);
                    }
                    self.state = DecodeState::Head;
                    return Ok(Some(Err(FrameError::TooLarge {
                        declared,
                        limit: self.max_frame_bytes,
                    })));
                }
            }
        }
    }
}

/// Encodes an already-serialized frame body.
impl Encoder<Bytes> for BridgeCodec {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if body.len() > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                declared: body.len(),
                limit: self.max_frame_bytes,
            });
        }
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &mut BridgeCodec, frame: &BridgeFrame, dst: &mut BytesMut) {
        codec
            .encode(frame.to_bytes().expect("serialize"), dst)
            .expect("encode");
    }

    fn next(codec: &mut BridgeCodec, src: &mut BytesMut) -> Result<BridgeFrame, FrameError> {
        codec
            .decode(src)
            .expect("decode should not fail the stream")
            .expect("a complete frame should be buffered")
    }

    #[test]
    fn decodes_frame_split_across_reads() {
        let mut codec = BridgeCodec::new(1024);
        let mut encoded = BytesMut::new();
        encode(&mut codec, &BridgeFrame::Heartbeat { sent_at: None }, &mut encoded);

        let mut src = BytesMut::new();
        let (first, rest) = encoded.split_at(3);
        src.extend_from_slice(first);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(rest);
        let frame = next(&mut codec, &mut src).expect("heartbeat");
        assert_eq!(frame, BridgeFrame::Heartbeat { sent_at: None });
        assert!(src.is_empty());
    }

    #[test]
    fn malformed_json_is_reported_and_stream_continues() {
        let mut codec = BridgeCodec::new(1024);
        let mut src = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"{not json"), &mut src)
            .unwrap();
        encode(
            &mut codec,
            &BridgeFrame::PairPrompt {
                code: "2@abc".into(),
            },
            &mut src,
        );

        assert!(matches!(
            next(&mut codec, &mut src),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            next(&mut codec, &mut src),
            Ok(BridgeFrame::PairPrompt { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_skipped_across_reads() {
        let mut codec = BridgeCodec::new(24);
        let mut src = BytesMut::new();
        src.put_u32(40);
        src.extend_from_slice(&[b'x'; 25]);

        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        src.extend_from_slice(&[b'x'; 15]);
        let mut tail = BytesMut::new();
        BridgeCodec::new(1024)
            .encode(Bytes::from_static(br#"{"type":"heartbeat"}"#), &mut tail)
            .unwrap();
        src.extend_from_slice(&tail);

        match next(&mut codec, &mut src) {
            Err(FrameError::TooLarge { declared, limit }) => {
                assert_eq!(declared, 40);
                assert_eq!(limit, 24);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        assert!(matches!(
            next(&mut codec, &mut src),
            Ok(BridgeFrame::Heartbeat { .. })
        ));
    }

    #[test]
    fn encode_rejects_oversized_body() {
        let mut codec = BridgeCodec::new(8);
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Bytes::from(vec![b'a'; 9]), &mut dst)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max size"));
        assert!(dst.is_empty());
    }
}
