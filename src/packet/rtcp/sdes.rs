use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// SDES item type: canonical end-point identifier (CNAME)
pub const SDES_CNAME: u8 = 1;

/// SDES item type: list terminator
pub const SDES_END: u8 = 0;

/// One SDES item (type, text)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    /// Item type (CNAME = 1, NAME = 2, ...)
    pub item_type: u8,

    /// Item text (at most 255 bytes on the wire)
    pub text: String,
}

impl SdesItem {
    /// Build a CNAME item
    pub fn cname(text: impl Into<String>) -> Self {
        Self {
            item_type: SDES_CNAME,
            text: text.into(),
        }
    }
}

/// One SDES chunk: an SSRC plus its items, padded to a 32-bit boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    /// SSRC/CSRC this chunk describes
    pub ssrc: RtpSsrc,

    /// Items for this source
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    /// Build a chunk holding only a CNAME item
    pub fn new_cname(ssrc: RtpSsrc, cname: impl Into<String>) -> Self {
        Self {
            ssrc,
            items: vec![SdesItem::cname(cname)],
        }
    }

    /// Serialized chunk size including the terminator and padding
    pub fn size(&self) -> usize {
        let mut size = 4; // SSRC
        for item in &self.items {
            size += 2 + item.text.len().min(255);
        }
        size += 1; // END terminator
        (size + 3) & !3 // pad to 32-bit boundary
    }
}

/// RTCP Source Description (SDES) packet, RFC 3550 Section 6.5
///
/// Appended to every compound packet; in this engine each instance carries
/// one chunk with the local CNAME.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpSourceDescription {
    /// Chunks, one per described source
    pub chunks: Vec<SdesChunk>,
}

impl RtcpSourceDescription {
    /// Build an SDES holding a single CNAME chunk
    pub fn new_cname(ssrc: RtpSsrc, cname: impl Into<String>) -> Self {
        Self {
            chunks: vec![SdesChunk::new_cname(ssrc, cname)],
        }
    }

    /// Serialized body size (excluding the common RTCP header)
    pub fn size(&self) -> usize {
        self.chunks.iter().map(SdesChunk::size).sum()
    }

    /// Parse an SDES body; `count` is the SC field from the common header
    pub fn parse(buf: &mut impl Buf, count: u8) -> Result<Self> {
        let mut chunks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let ssrc = buf.get_u32();
            let mut items = Vec::new();
            let mut consumed = 4usize;

            loop {
                if !buf.has_remaining() {
                    return Err(Error::InvalidPacket(
                        "SDES chunk missing terminator".to_string(),
                    ));
                }
                let item_type = buf.get_u8();
                consumed += 1;
                if item_type == SDES_END {
                    break;
                }
                if !buf.has_remaining() {
                    return Err(Error::BufferTooSmall {
                        required: 1,
                        available: 0,
                    });
                }
                let len = buf.get_u8() as usize;
                consumed += 1;
                if buf.remaining() < len {
                    return Err(Error::BufferTooSmall {
                        required: len,
                        available: buf.remaining(),
                    });
                }
                let mut text = vec![0u8; len];
                buf.copy_to_slice(&mut text);
                consumed += len;
                items.push(SdesItem {
                    item_type,
                    text: String::from_utf8_lossy(&text).to_string(),
                });
            }

            // Skip padding up to the next 32-bit boundary
            while consumed % 4 != 0 {
                if !buf.has_remaining() {
                    break;
                }
                buf.advance(1);
                consumed += 1;
            }

            chunks.push(SdesChunk { ssrc, items });
        }

        Ok(Self { chunks })
    }

    /// Serialize the SDES body
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        for chunk in &self.chunks {
            buf.put_u32(chunk.ssrc);
            let mut written = 4usize;
            for item in &chunk.items {
                let len = item.text.len().min(255);
                buf.put_u8(item.item_type);
                buf.put_u8(len as u8);
                buf.put_slice(&item.text.as_bytes()[..len]);
                written += 2 + len;
            }
            buf.put_u8(SDES_END);
            written += 1;
            while written % 4 != 0 {
                buf.put_u8(0);
                written += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cname_roundtrip() {
        let sdes = RtcpSourceDescription::new_cname(0x12345678, "user@host.example");

        let mut buf = BytesMut::new();
        sdes.serialize(&mut buf);
        assert_eq!(buf.len(), sdes.size());
        assert_eq!(buf.len() % 4, 0);

        let parsed = RtcpSourceDescription::parse(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.chunks[0].ssrc, 0x12345678);
        assert_eq!(parsed.chunks[0].items[0].item_type, SDES_CNAME);
        assert_eq!(parsed.chunks[0].items[0].text, "user@host.example");
    }

    #[test]
    fn test_size_is_word_aligned() {
        for cname in ["a", "ab", "abc", "abcd", "abcde"] {
            let sdes = RtcpSourceDescription::new_cname(1, cname);
            assert_eq!(sdes.size() % 4, 0, "cname {:?}", cname);
        }
    }

    #[test]
    fn test_missing_terminator_rejected() {
        // SSRC then a CNAME item claiming more text than present
        let raw = [0, 0, 0, 1, SDES_CNAME, 10, b'x'];
        assert!(RtcpSourceDescription::parse(&mut &raw[..], 1).is_err());
    }
}
