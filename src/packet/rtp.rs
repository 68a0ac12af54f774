use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

use super::header::RtpHeader;

/// An RTP packet: fixed header plus payload
///
/// The payload excludes any trailing padding; padding is stripped on parse
/// (validated against the buffer length) and is never generated on
/// serialize.
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,

    /// Payload data, padding already removed
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new RTP packet with the given header and payload
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a new RTP packet from the standard header fields and payload
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        Self {
            header: RtpHeader::new(payload_type, sequence_number, timestamp, ssrc),
            payload,
        }
    }

    /// Total serialized size in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Parse an RTP packet from a datagram
    ///
    /// When the padding flag is set, the final byte gives the pad count; a
    /// pad count of zero or one exceeding the remaining payload makes the
    /// packet invalid.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        let header = RtpHeader::parse(&mut cursor)?;

        let mut payload_len = cursor.remaining();
        if header.padding {
            if payload_len == 0 {
                return Err(Error::InvalidPacket(
                    "Padding flag set on empty payload".to_string(),
                ));
            }
            let pad_count = data[data.len() - 1] as usize;
            if pad_count == 0 || pad_count > payload_len {
                return Err(Error::InvalidPacket(format!(
                    "Bad padding count {} for {} payload bytes",
                    pad_count, payload_len
                )));
            }
            payload_len -= pad_count;
        }

        let payload = Bytes::copy_from_slice(&cursor[..payload_len]);
        Ok(Self { header, payload })
    }

    /// Serialize the packet to bytes
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        // Padding is never generated by this engine
        let mut header = self.header.clone();
        header.padding = false;
        header.serialize(&mut buf)?;
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RtpPacket {{ pt: {}, seq: {}, ts: {}, ssrc: {:#010x}, marker: {}, payload_len: {} }}",
            self.header.payload_type,
            self.header.sequence_number,
            self.header.timestamp,
            self.header.ssrc,
            self.header.marker,
            self.payload.len()
        )
    }
}
