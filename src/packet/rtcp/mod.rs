//! RTCP packet family, RFC 3550 Sections 6.4–6.6
//!
//! Individual packet bodies live in their own modules; this module owns the
//! common header (V/P/count, packet type, length in 32-bit words minus one)
//! and compound packet parse/serialize. Unknown packet types are skipped by
//! their declared length rather than rejected, so a compound carrying e.g.
//! an APP packet still yields its SR/RR/SDES/BYE content.

pub mod bye;
pub mod ntp;
pub mod receiver_report;
pub mod report_block;
pub mod sdes;
pub mod sender_report;

pub use bye::RtcpGoodbye;
pub use ntp::NtpTimestamp;
pub use receiver_report::RtcpReceiverReport;
pub use report_block::RtcpReportBlock;
pub use sdes::{RtcpSourceDescription, SdesChunk, SdesItem, SDES_CNAME};
pub use sender_report::RtcpSenderReport;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::Error;
use crate::Result;

/// RTCP packet type: Sender Report
pub const RTCP_PT_SR: u8 = 200;

/// RTCP packet type: Receiver Report
pub const RTCP_PT_RR: u8 = 201;

/// RTCP packet type: Source Description
pub const RTCP_PT_SDES: u8 = 202;

/// RTCP packet type: Goodbye
pub const RTCP_PT_BYE: u8 = 203;

/// One parsed RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender report
    SenderReport(RtcpSenderReport),
    /// Receiver report
    ReceiverReport(RtcpReceiverReport),
    /// Source description
    SourceDescription(RtcpSourceDescription),
    /// Goodbye
    Goodbye(RtcpGoodbye),
}

impl RtcpPacket {
    fn packet_type(&self) -> u8 {
        match self {
            Self::SenderReport(_) => RTCP_PT_SR,
            Self::ReceiverReport(_) => RTCP_PT_RR,
            Self::SourceDescription(_) => RTCP_PT_SDES,
            Self::Goodbye(_) => RTCP_PT_BYE,
        }
    }

    fn count_field(&self) -> u8 {
        match self {
            Self::SenderReport(sr) => sr.report_blocks.len() as u8,
            Self::ReceiverReport(rr) => rr.report_blocks.len() as u8,
            Self::SourceDescription(sdes) => sdes.chunks.len() as u8,
            Self::Goodbye(bye) => bye.sources.len() as u8,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Self::SenderReport(sr) => sr.size(),
            Self::ReceiverReport(rr) => rr.size(),
            Self::SourceDescription(sdes) => sdes.size(),
            Self::Goodbye(bye) => bye.size(),
        }
    }
}

/// A compound RTCP packet: one or more packets back to back in a datagram
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpCompoundPacket {
    /// Packets in wire order
    pub packets: Vec<RtcpPacket>,
}

impl RtcpCompoundPacket {
    /// Build an empty compound packet
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet
    pub fn push(&mut self, packet: RtcpPacket) {
        self.packets.push(packet);
    }

    /// Parse every recognized packet in a datagram
    ///
    /// Returns an error only when the very first header is malformed; a
    /// trailing truncated packet terminates parsing with what was recovered.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut packets = Vec::new();
        let mut cursor = data;
        let mut first = true;

        while cursor.remaining() >= 4 {
            let mut header_bytes = &cursor[..4];
            let header_word = header_bytes.get_u32();
            let version = ((header_word >> 30) & 0x03) as u8;
            let count = ((header_word >> 24) & 0x1F) as u8;
            let packet_type = ((header_word >> 16) & 0xFF) as u8;
            let length_words = (header_word & 0xFFFF) as usize;
            let total_len = (length_words + 1) * 4;

            if version != 2 {
                if first {
                    return Err(Error::InvalidPacket(format!(
                        "Invalid RTCP version: {}",
                        version
                    )));
                }
                break;
            }
            if cursor.remaining() < total_len {
                if first {
                    return Err(Error::BufferTooSmall {
                        required: total_len,
                        available: cursor.remaining(),
                    });
                }
                break;
            }
            first = false;

            let mut body = &cursor[4..total_len];
            match packet_type {
                RTCP_PT_SR => match RtcpSenderReport::parse(&mut body, count) {
                    Ok(sr) => packets.push(RtcpPacket::SenderReport(sr)),
                    Err(e) => trace!("Discarding malformed SR: {}", e),
                },
                RTCP_PT_RR => match RtcpReceiverReport::parse(&mut body, count) {
                    Ok(rr) => packets.push(RtcpPacket::ReceiverReport(rr)),
                    Err(e) => trace!("Discarding malformed RR: {}", e),
                },
                RTCP_PT_SDES => match RtcpSourceDescription::parse(&mut body, count) {
                    Ok(sdes) => packets.push(RtcpPacket::SourceDescription(sdes)),
                    Err(e) => trace!("Discarding malformed SDES: {}", e),
                },
                RTCP_PT_BYE => match RtcpGoodbye::parse(&mut body, count) {
                    Ok(bye) => packets.push(RtcpPacket::Goodbye(bye)),
                    Err(e) => trace!("Discarding malformed BYE: {}", e),
                },
                other => trace!("Skipping unknown RTCP packet type {}", other),
            }

            cursor = &cursor[total_len..];
        }

        Ok(Self { packets })
    }

    /// Serialize the compound packet into one datagram payload
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        for packet in &self.packets {
            let body_size = packet.body_size();
            if body_size % 4 != 0 {
                return Err(Error::InvalidPacket(format!(
                    "RTCP body not word-aligned: {} bytes",
                    body_size
                )));
            }
            let length_words = (body_size / 4) as u16;

            buf.put_u8(0x80 | (packet.count_field() & 0x1F));
            buf.put_u8(packet.packet_type());
            buf.put_u16(length_words);

            match packet {
                RtcpPacket::SenderReport(sr) => sr.serialize(&mut buf),
                RtcpPacket::ReceiverReport(rr) => rr.serialize(&mut buf),
                RtcpPacket::SourceDescription(sdes) => sdes.serialize(&mut buf),
                RtcpPacket::Goodbye(bye) => bye.serialize(&mut buf),
            }
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_roundtrip() {
        let mut compound = RtcpCompoundPacket::new();
        let mut sr = RtcpSenderReport::new(0x1111);
        sr.packet_count = 10;
        sr.octet_count = 1600;
        sr.report_blocks.push(RtcpReportBlock::new(0x2222));
        compound.push(RtcpPacket::SenderReport(sr));
        compound.push(RtcpPacket::SourceDescription(
            RtcpSourceDescription::new_cname(0x1111, "a@b"),
        ));
        compound.push(RtcpPacket::Goodbye(RtcpGoodbye::new(0x1111)));

        let wire = compound.serialize().unwrap();
        assert_eq!(wire.len() % 4, 0);

        let parsed = RtcpCompoundPacket::parse(&wire).unwrap();
        assert_eq!(parsed, compound);
    }

    #[test]
    fn test_unknown_type_skipped() {
        let mut compound = RtcpCompoundPacket::new();
        compound.push(RtcpPacket::ReceiverReport(RtcpReceiverReport::new(9)));
        let mut wire = compound.serialize().unwrap().to_vec();

        // Append an APP packet (PT 204) with a 4-byte body
        wire.extend_from_slice(&[0x80, 204, 0x00, 0x01, 0xDE, 0xAD, 0xBE, 0xEF]);
        // And another recognized packet after it
        let bye = RtcpCompoundPacket {
            packets: vec![RtcpPacket::Goodbye(RtcpGoodbye::new(9))],
        };
        wire.extend_from_slice(&bye.serialize().unwrap());

        let parsed = RtcpCompoundPacket::parse(&wire).unwrap();
        assert_eq!(parsed.packets.len(), 2);
        assert!(matches!(parsed.packets[0], RtcpPacket::ReceiverReport(_)));
        assert!(matches!(parsed.packets[1], RtcpPacket::Goodbye(_)));
    }

    #[test]
    fn test_malformed_first_packet_rejected() {
        // Version 1 in the first header
        let raw = [0x40u8, 200, 0, 0];
        assert!(RtcpCompoundPacket::parse(&raw).is_err());
    }
}
