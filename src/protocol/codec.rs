use bytes::{Bytes, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::{GridError, Result};
use crate::protocol::message::{Frame, Message};
use crate::protocol::wire::Envelope;

/// Maximum frame size (16 MiB) unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Length-prefixed protobuf envelopes.
///
/// ```text
/// +----------------------------+------------------+
/// | Length (4 bytes, BE)       | Envelope         |
/// +----------------------------+------------------+
/// ```
///
/// The length is validated before the payload is buffered.
#[derive(Debug)]
pub struct GridCodec {
    frames: LengthDelimitedCodec,
}

impl Default for GridCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl GridCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for GridCodec {
    type Item = Frame;
    type Error = GridError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(payload) = self.frames.decode(src)? else {
            return Ok(None);
        };
        let envelope = Envelope::decode(payload.freeze())?;
        Frame::try_from(envelope).map(Some)
    }
}

impl Encoder<Message> for GridCodec {
    type Error = GridError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = Bytes::from(message.to_envelope().encode_to_vec());
        self.frames.encode(payload, dst)?;
        Ok(())
    }
}
