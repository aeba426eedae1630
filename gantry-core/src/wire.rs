use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;

/// Upper bound on a single frame body, checked on both encode and decode.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const LENGTH_FIELD_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("failed to marshal command: {0}")]
    Marshal(String),

    #[error("failed to unmarshal command: {0}")]
    Unmarshal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns commands into frame bodies and back. The frame length prefix is
/// handled by [`FrameCodec`]; implementations only see the body.
pub trait WireFormat: Send + Sync + 'static {
    fn marshal(&self, command: &Command) -> Result<Vec<u8>, CodecError>;
    fn unmarshal(&self, body: &[u8]) -> Result<Command, CodecError>;
}

/// Default wire format: one JSON document per frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWireFormat;

impl WireFormat for JsonWireFormat {
    fn marshal(&self, command: &Command) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(command).map_err(|e| CodecError::Marshal(e.to_string()))
    }

    fn unmarshal(&self, body: &[u8]) -> Result<Command, CodecError> {
        serde_json::from_slice(body).map_err(|e| CodecError::Unmarshal(e.to_string()))
    }
}

/// Length-prefixed framing: a 4-byte big-endian body length followed by the
/// body produced by the wire format.
#[derive(Debug, Clone)]
pub struct FrameCodec<W = JsonWireFormat> {
    wire_format: W,
    max_frame_size: usize,
}

impl Default for FrameCodec<JsonWireFormat> {
    fn default() -> Self {
        FrameCodec::new(JsonWireFormat)
    }
}

impl<W: WireFormat> FrameCodec<W> {
    pub fn new(wire_format: W) -> Self {
        FrameCodec {
            wire_format,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl<W: WireFormat> Decoder for FrameCodec<W> {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let body_len = u32::from_be_bytes(length_bytes) as usize;

        if body_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LENGTH_FIELD_SIZE + body_len {
            src.reserve(LENGTH_FIELD_SIZE + body_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let body = src.split_to(body_len);
        self.wire_format.unmarshal(&body).map(Some)
    }
}

impl<W: WireFormat> Encoder<Command> for FrameCodec<W> {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = self.wire_format.marshal(&item)?;
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_FIELD_SIZE + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, Message};
    use crate::destination::Destination;

    fn message(id: u32) -> Command {
        Command::new(
            id,
            CommandKind::Message(Message::new(
                format!("m-{}", id),
                Destination::queue("orders"),
                vec![1, 2, 3],
            )),
        )
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(message(1), &mut encoded).unwrap();

        let mut partial = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[encoded.len() - 1..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, message(1));
        assert!(partial.is_empty());
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(message(1), &mut buf).unwrap();
        codec.encode(Command::response(1), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(message(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Command::response(1)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = FrameCodec::default().with_max_frame_size(8);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(message(1), &mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));

        let mut header = BytesMut::new();
        header.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut header),
            Err(CodecError::FrameTooLarge { size: 1024, max: 8 })
        ));
    }
}
