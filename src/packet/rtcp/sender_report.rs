use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

use super::ntp::NtpTimestamp;
use super::report_block::RtcpReportBlock;

/// RTCP Sender Report (SR), RFC 3550 Section 6.4.1
///
/// Carries the sender's NTP/RTP timestamp pair (the wall-clock
/// synchronization anchor receivers use for presentation-time recovery)
/// plus packet/octet counts, followed by reception report blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpSenderReport {
    /// SSRC of this sender
    pub ssrc: RtpSsrc,

    /// NTP timestamp captured when this report was generated
    pub ntp_timestamp: NtpTimestamp,

    /// RTP timestamp corresponding to the same instant
    pub rtp_timestamp: RtpTimestamp,

    /// Total RTP data packets sent since the stream started
    pub packet_count: u32,

    /// Total RTP payload octets sent since the stream started
    pub octet_count: u32,

    /// Reception report blocks for remote senders
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpSenderReport {
    /// Fixed sender-info size: SSRC + NTP (8) + RTP ts + counts
    pub const SENDER_INFO_SIZE: usize = 24;

    /// Create a new sender report with no report blocks
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    /// Serialized body size (excluding the common RTCP header)
    pub fn size(&self) -> usize {
        Self::SENDER_INFO_SIZE + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Parse an SR body; `count` is the RC field from the common header
    pub fn parse(buf: &mut impl Buf, count: u8) -> Result<Self> {
        if buf.remaining() < Self::SENDER_INFO_SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SENDER_INFO_SIZE,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();
        let ntp_timestamp = NtpTimestamp::from_u64(buf.get_u64());
        let rtp_timestamp = buf.get_u32();
        let packet_count = buf.get_u32();
        let octet_count = buf.get_u32();

        let mut report_blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            report_blocks.push(RtcpReportBlock::parse(buf)?);
        }

        Ok(Self {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count,
            octet_count,
            report_blocks,
        })
    }

    /// Serialize the SR body
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp.to_u64());
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for block in &self.report_blocks {
            block.serialize(buf);
        }
    }
}
