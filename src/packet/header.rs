use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// RTP fixed header according to RFC 3550 Section 5.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,

    /// Padding flag: payload carries trailing padding, last byte is the count
    pub padding: bool,

    /// Marker bit (payload-format-specific meaning, often end of frame)
    pub marker: bool,

    /// Payload type (7 bits)
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Media timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Contributing source identifiers (up to 15)
    pub csrc: Vec<RtpCsrc>,

    /// Raw header extension: profile id plus extension body (a multiple of
    /// four bytes), present when the X bit is set
    pub extension: Option<(u16, Bytes)>,
}

impl Default for RtpHeader {
    fn default() -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            marker: false,
            payload_type: 0,
            sequence_number: 0,
            timestamp: 0,
            ssrc: 0,
            csrc: Vec::new(),
            extension: None,
        }
    }
}

impl RtpHeader {
    /// Create a new RTP header with default flags
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        }
    }

    /// Size of the serialized header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;
        if let Some((_, ext)) = &self.extension {
            // 4 bytes for profile id and length word, plus the body
            size += 4 + ext.len();
        }
        size
    }

    /// Parse an RTP header from a cursor, consuming exactly the header bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // First byte: version (2 bits), padding, extension, CSRC count (4 bits)
        let first = buf.get_u8();
        let version = (first >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!(
                "Invalid RTP version: {}",
                version
            )));
        }
        let padding = (first >> 5) & 0x01 == 1;
        let has_extension = (first >> 4) & 0x01 == 1;
        let cc = first & 0x0F;

        // Second byte: marker (1 bit), payload type (7 bits)
        let second = buf.get_u8();
        let marker = (second >> 7) & 0x01 == 1;
        let payload_type = second & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let mut csrc = Vec::with_capacity(cc as usize);
        for _ in 0..cc {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            csrc.push(buf.get_u32());
        }

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let profile = buf.get_u16();
            let length_bytes = buf.get_u16() as usize * 4;
            if buf.remaining() < length_bytes {
                return Err(Error::BufferTooSmall {
                    required: length_bytes,
                    available: buf.remaining(),
                });
            }
            Some((profile, buf.copy_to_bytes(length_bytes)))
        } else {
            None
        };

        Ok(Self {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        })
    }

    /// Serialize the header to the buffer
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());

        let cc = self.csrc.len().min(15) as u8;
        let mut first = (self.version & 0x03) << 6;
        if self.padding {
            first |= 1 << 5;
        }
        if self.extension.is_some() {
            first |= 1 << 4;
        }
        first |= cc;
        buf.put_u8(first);

        let mut second = self.payload_type & 0x7F;
        if self.marker {
            second |= 1 << 7;
        }
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in self.csrc.iter().take(cc as usize) {
            buf.put_u32(*csrc);
        }

        if let Some((profile, ext)) = &self.extension {
            if ext.len() % 4 != 0 {
                return Err(Error::InvalidPacket(format!(
                    "Extension body not a multiple of 4 bytes: {}",
                    ext.len()
                )));
            }
            buf.put_u16(*profile);
            buf.put_u16((ext.len() / 4) as u16);
            buf.put_slice(ext);
        }

        Ok(())
    }
}
