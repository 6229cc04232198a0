//! Encoded video packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

const STORED_MAGIC: &[u8; 4] = b"SPK1";
const FLAG_KEYFRAME: u8 = 0b01;
const FLAG_CONFIG: u8 = 0b10;
const STORED_HEADER_LEN: usize = 4 + 1 + 4 + 4;

/// One encoded frame.
///
/// Payloads are reference-counted, so cloning a packet between the source
/// cache and the frame cache does not copy the bitstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    is_keyframe: bool,
    decoder_config: Option<Bytes>,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, is_keyframe: bool) -> Self {
        Self {
            data: data.into(),
            is_keyframe,
            decoder_config: None,
        }
    }

    /// Attach out-of-band decoder configuration (parameter sets).
    pub fn with_decoder_config(mut self, config: impl Into<Bytes>) -> Self {
        self.decoder_config = Some(config.into());
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    pub fn decoder_config(&self) -> Option<&Bytes> {
        self.decoder_config.as_ref()
    }

    /// Bytes this packet keeps resident, counted against the RAM budget.
    pub fn resident_bytes(&self) -> usize {
        self.data.len() + self.decoder_config.as_ref().map_or(0, Bytes::len)
    }

    /// Serialize for the warm tier.
    ///
    /// Layout: magic, flags, config length (u32 BE), data length (u32 BE),
    /// config bytes, data bytes.
    pub fn to_stored(&self) -> Vec<u8> {
        let config = self.decoder_config.as_ref();
        let config_len = config.map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(STORED_HEADER_LEN + config_len + self.data.len());

        let mut flags = 0u8;
        if self.is_keyframe {
            flags |= FLAG_KEYFRAME;
        }
        if config.is_some() {
            flags |= FLAG_CONFIG;
        }

        buf.put_slice(STORED_MAGIC);
        buf.put_u8(flags);
        buf.put_u32(config_len as u32);
        buf.put_u32(self.data.len() as u32);
        if let Some(config) = config {
            buf.put_slice(config);
        }
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parse the warm-tier form. Truncated or foreign bytes yield `None`.
    pub fn from_stored(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < STORED_HEADER_LEN || &bytes[..4] != STORED_MAGIC {
            return None;
        }
        let mut buf = Bytes::copy_from_slice(bytes);
        buf.advance(4);
        let flags = buf.get_u8();
        let config_len = buf.get_u32() as usize;
        let data_len = buf.get_u32() as usize;
        if buf.remaining() != config_len + data_len {
            return None;
        }

        let config = buf.split_to(config_len);
        let mut packet = Packet::new(buf, flags & FLAG_KEYFRAME != 0);
        if flags & FLAG_CONFIG != 0 {
            packet.decoder_config = Some(config);
        }
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_form_preserves_config_and_flags() {
        let packet = Packet::new(vec![1u8, 2, 3, 4], true).with_decoder_config(vec![9u8, 9]);
        let restored = Packet::from_stored(&packet.to_stored()).unwrap();
        assert_eq!(restored, packet);
        assert_eq!(restored.resident_bytes(), 6);
    }

    #[test]
    fn test_empty_config_is_not_invented() {
        let packet = Packet::new(vec![7u8; 10], false);
        let restored = Packet::from_stored(&packet.to_stored()).unwrap();
        assert!(restored.decoder_config().is_none());
        assert!(!restored.is_keyframe());
    }

    #[test]
    fn test_truncated_bytes_are_rejected() {
        let stored = Packet::new(vec![1u8; 32], true).to_stored();
        assert!(Packet::from_stored(&stored[..stored.len() - 1]).is_none());
        assert!(Packet::from_stored(b"nope").is_none());
    }
}
