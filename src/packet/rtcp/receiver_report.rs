use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

use super::report_block::RtcpReportBlock;

/// RTCP Receiver Report (RR), RFC 3550 Section 6.4.2
///
/// Sent by session members that are not actively sending media; carries
/// reception report blocks for every remote sender.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpReceiverReport {
    /// SSRC of this receiver
    pub ssrc: RtpSsrc,

    /// Reception report blocks
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpReceiverReport {
    /// Create a new receiver report with no report blocks
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            report_blocks: Vec::new(),
        }
    }

    /// Serialized body size (excluding the common RTCP header)
    pub fn size(&self) -> usize {
        4 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Parse an RR body; `count` is the RC field from the common header
    pub fn parse(buf: &mut impl Buf, count: u8) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();

        let mut report_blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            report_blocks.push(RtcpReportBlock::parse(buf)?);
        }

        Ok(Self {
            ssrc,
            report_blocks,
        })
    }

    /// Serialize the RR body
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        buf.put_u32(self.ssrc);
        for block in &self.report_blocks {
            block.serialize(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut rr = RtcpReceiverReport::new(0xFEEDFACE);
        rr.report_blocks.push(RtcpReportBlock::new(0x11111111));
        rr.report_blocks.push(RtcpReportBlock {
            ssrc: 0x22222222,
            fraction_lost: 64,
            cumulative_lost: 250,
            highest_seq: 70_000,
            jitter: 19,
            last_sr: 0x01020304,
            delay_since_last_sr: 32_768,
        });

        let mut buf = BytesMut::new();
        rr.serialize(&mut buf);
        assert_eq!(buf.len(), rr.size());

        let parsed = RtcpReceiverReport::parse(&mut buf.freeze(), 2).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn test_empty_rr() {
        let rr = RtcpReceiverReport::new(7);
        let mut buf = BytesMut::new();
        rr.serialize(&mut buf);
        assert_eq!(buf.len(), 4);

        let parsed = RtcpReceiverReport::parse(&mut buf.freeze(), 0).unwrap();
        assert!(parsed.report_blocks.is_empty());
    }
}
