//! Framing of eth messages on a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use rlp::{DecoderError, PayloadInfo};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{
    error::Error,
    eth::message::{Capability, EthMessage},
};

/// The marker opening every legacy frame.
pub const LEGACY_MAGIC: u32 = 0x2240_0891;

/// The largest payload accepted, in bytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEGACY_HEADER_LEN: usize = 8;

/// How frames are delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// A 4-byte magic marker and a 4-byte big-endian payload length precede the payload.
    Legacy,
    /// Every frame is a single RLP item, delimited by its own header.
    Bare,
}

/// Encodes and decodes [`EthMessage`]s, rejecting codes the negotiated capability doesn't define.
pub struct EthCodec {
    capability: Capability,
    framing: Framing,
    legacy: LengthDelimitedCodec,
}

impl EthCodec {
    pub fn new(capability: Capability, framing: Framing) -> Self {
        let legacy = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_offset(4)
            .length_field_length(4)
            .length_adjustment(0)
            .num_skip(0)
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec();

        Self {
            capability,
            framing,
            legacy,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    fn decode_bare(&mut self, src: &mut BytesMut) -> Result<Option<EthMessage>, Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let info = match PayloadInfo::from(&src[..]) {
            Ok(info) => info,
            // The header itself is incomplete.
            Err(DecoderError::RlpIsTooShort) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Checked before summing: a hostile header may announce any 64-bit length.
        if info.value_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(info.value_len));
        }
        let len = info.header_len + info.value_len;

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len);
        self.capability.decode(&frame).map(Some)
    }
}

impl Decoder for EthCodec {
    type Item = EthMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::Bare => self.decode_bare(src),
            Framing::Legacy => {
                let mut frame = match self.legacy.decode(src)? {
                    Some(frame) => frame,
                    None => return Ok(None),
                };

                let magic = frame.get_u32();
                if magic != LEGACY_MAGIC {
                    return Err(Error::BadMagic(magic));
                }
                frame.advance(LEGACY_HEADER_LEN - 4);

                self.capability.decode(&frame).map(Some)
            }
        }
    }
}

impl Encoder<EthMessage> for EthCodec {
    type Error = Error;

    fn encode(&mut self, message: EthMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self.capability.encode(&message)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(payload.len()));
        }

        match self.framing {
            Framing::Bare => dst.reserve(payload.len()),
            Framing::Legacy => {
                dst.reserve(LEGACY_HEADER_LEN + payload.len());
                dst.put_u32(LEGACY_MAGIC);
                dst.put_u32(payload.len() as u32);
            }
        }
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use primitive_types::{H256, U256};

    use super::*;
    use crate::eth::message::Status;

    fn status() -> EthMessage {
        EthMessage::Status(Status {
            protocol_version: 60,
            network_id: 1,
            total_difficulty: U256::from(17_179_869_184u64),
            best_hash: H256::repeat_byte(1),
            genesis_hash: H256::repeat_byte(2),
        })
    }

    #[test]
    fn legacy_frame() {
        let mut codec = EthCodec::new(Capability::ETH60, Framing::Legacy);
        let mut dst = BytesMut::new();

        codec.encode(status(), &mut dst).unwrap();

        assert_eq!(&dst[..4], &[0x22, 0x40, 0x08, 0x91]);
        let len = u32::from_be_bytes([dst[4], dst[5], dst[6], dst[7]]) as usize;
        assert_eq!(len, dst.len() - 8);

        assert_eq!(codec.decode(&mut dst).unwrap(), Some(status()));
        assert!(dst.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        for framing in [Framing::Legacy, Framing::Bare] {
            let mut codec = EthCodec::new(Capability::ETH60, framing);
            let mut encoded = BytesMut::new();
            codec.encode(status(), &mut encoded).unwrap();
            codec
                .encode(EthMessage::GetBlocks(vec![H256::repeat_byte(3)]), &mut encoded)
                .unwrap();

            let mut src = BytesMut::new();
            let mut decoded = vec![];
            for byte in encoded.iter() {
                src.put_u8(*byte);
                if let Some(message) = codec.decode(&mut src).unwrap() {
                    decoded.push(message);
                }
            }

            assert_eq!(
                decoded,
                vec![status(), EthMessage::GetBlocks(vec![H256::repeat_byte(3)])]
            );
        }
    }

    #[test]
    fn bad_magic() {
        let mut codec = EthCodec::new(Capability::ETH60, Framing::Legacy);
        let mut src = BytesMut::from(&[0, 0, 0, 1, 0, 0, 0, 1, 0xc0][..]);

        assert!(matches!(codec.decode(&mut src), Err(Error::BadMagic(1))));
    }

    #[test]
    fn codes_outside_the_capability() {
        let message = EthMessage::GetBlockHashesByNumber {
            number: 1,
            max_blocks: 1,
        };

        let mut eth60 = EthCodec::new(Capability::ETH60, Framing::Bare);
        let mut eth61 = EthCodec::new(Capability::ETH61, Framing::Bare);
        let mut dst = BytesMut::new();

        assert!(matches!(
            eth60.encode(message.clone(), &mut dst),
            Err(Error::Unsupported { version: 60, code: 0x08 })
        ));
        assert!(dst.is_empty());

        eth61.encode(message, &mut dst).unwrap();
        assert!(matches!(
            eth60.decode(&mut dst),
            Err(Error::Unsupported { version: 60, code: 0x08 })
        ));
    }

    #[test]
    fn oversized_frame() {
        let mut codec = EthCodec::new(Capability::ETH60, Framing::Bare);
        // A list header announcing a 32 MiB payload.
        let mut src = BytesMut::from(&[0xfb, 0x02, 0x00, 0x00, 0x00][..]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn header_announcing_the_largest_length() {
        let mut codec = EthCodec::new(Capability::ETH60, Framing::Bare);
        let mut src = BytesMut::from(&[0xff; 9][..]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(Error::FrameTooLarge(_))
        ));
    }
}
