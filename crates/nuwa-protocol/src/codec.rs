//! Newline-delimited JSON framing

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

/// Maximum size of one frame, excluding the line terminator (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Incremental decoder for a stream of JSON lines
pub struct LineCodec {
    buffer: BytesMut,
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append received bytes.
    ///
    /// Fails once the unterminated tail exceeds [`MAX_FRAME_SIZE`]; the
    /// buffer is dropped since the stream cannot be resynchronized.
    pub fn feed(&mut self, data: &[u8]) -> ProtocolResult<()> {
        self.buffer.extend_from_slice(data);

        let tail = match self.buffer.iter().rposition(|&b| b == b'\n') {
            Some(pos) => self.buffer.len() - pos - 1,
            None => self.buffer.len(),
        };
        if tail > MAX_FRAME_SIZE {
            self.buffer.clear();
            return Err(ProtocolError::FrameTooLarge {
                size: tail,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(())
    }

    /// Decode the next complete frame, skipping blank lines.
    ///
    /// A malformed line is consumed before its error is returned, so the
    /// caller may keep reading.
    pub fn decode<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        loop {
            let line_end = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => return Ok(None),
            };

            let line = self.buffer.split_to(line_end + 1);
            let mut body = &line[..line_end];
            if body.last() == Some(&b'\r') {
                body = &body[..body.len() - 1];
            }
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if body.len() > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: body.len(),
                    max: MAX_FRAME_SIZE,
                });
            }

            trace!(bytes = body.len(), "Decoding frame");
            return Ok(Some(serde_json::from_slice(body)?));
        }
    }

    /// Bytes buffered but not yet decoded
    pub fn pending(&self) -> usize {
        self.buffer.remaining()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize one frame, terminated by `\n`
pub fn encode<T: Serialize>(frame: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = serde_json::to_vec(frame)?;
    if out.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: out.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    out.push(b'\n');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Request, Response};
    use serde_json::json;

    #[test]
    fn test_partial_frames() {
        let mut codec = LineCodec::new();
        codec.feed(br#"{"op":"get","id":1,"#).unwrap();
        assert!(codec.decode::<Request>().unwrap().is_none());

        codec.feed(b"\"key\":\"/a\"}\r\n{\"op\":\"ping\",\"id\":2}\n").unwrap();
        assert_eq!(codec.decode::<Request>().unwrap(), Some(Request::get(1, "/a")));
        assert_eq!(codec.decode::<Request>().unwrap(), Some(Request::ping(2)));
        assert!(codec.decode::<Request>().unwrap().is_none());
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut codec = LineCodec::new();
        codec.feed(b"\n  \r\n{\"kind\":\"pong\",\"id\":5}\n").unwrap();
        assert_eq!(codec.decode::<Response>().unwrap(), Some(Response::pong(5)));
    }

    #[test]
    fn test_malformed_line_is_consumed() {
        let mut codec = LineCodec::new();
        codec.feed(b"not json\n{\"op\":\"ping\",\"id\":1}\n").unwrap();
        assert!(matches!(
            codec.decode::<Request>(),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(codec.decode::<Request>().unwrap(), Some(Request::ping(1)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = LineCodec::new();
        let chunk = vec![b'x'; 1024 * 1024];
        for _ in 0..16 {
            codec.feed(&chunk).unwrap();
        }
        let err = codec.feed(b"x").unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max, .. } if max == MAX_FRAME_SIZE));
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_encode_terminates_line() {
        let bytes = encode(&Response::changed("/k", json!({"v": 1}))).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));

        let mut codec = LineCodec::new();
        codec.feed(&bytes).unwrap();
        assert_eq!(
            codec.decode::<Response>().unwrap(),
            Some(Response::changed("/k", json!({"v": 1})))
        );
    }
}
