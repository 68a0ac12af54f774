use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Reception report block carried in RTCP SR/RR packets
///
/// Layout per RFC 3550 §6.4.1: six 32-bit words, with fraction lost (8 bits)
/// and cumulative lost (24 bits) packed into the second word.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpReportBlock {
    /// SSRC of the source this report describes
    pub ssrc: RtpSsrc,

    /// Fraction of packets lost since the previous report (8-bit fixed point)
    pub fraction_lost: u8,

    /// Cumulative number of packets lost (24 bits, clamped on serialize)
    pub cumulative_lost: u32,

    /// Extended highest sequence number received (cycles << 16 | seq)
    pub highest_seq: u32,

    /// Interarrival jitter in timestamp units
    pub jitter: u32,

    /// Middle 32 bits of the last SR's NTP timestamp
    pub last_sr: u32,

    /// Delay since that SR, in 1/65536 second units
    pub delay_since_last_sr: u32,
}

impl RtcpReportBlock {
    /// Serialized size of a report block in bytes
    pub const SIZE: usize = 24;

    /// Create an empty report block for a source
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    /// Parse one report block from the cursor
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();
        let word = buf.get_u32();
        let fraction_lost = (word >> 24) as u8;
        let cumulative_lost = word & 0x00FF_FFFF;

        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }

    /// Serialize the report block
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32(self.ssrc);
        buf.put_u32((self.fraction_lost as u32) << 24 | (self.cumulative_lost & 0x00FF_FFFF));
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let original = RtcpReportBlock {
            ssrc: 0x12345678,
            fraction_lost: 42,
            cumulative_lost: 1000,
            highest_seq: 0x0002_1388,
            jitter: 100,
            last_sr: 0x87654321,
            delay_since_last_sr: 1500,
        };

        let mut buf = BytesMut::new();
        original.serialize(&mut buf);
        assert_eq!(buf.len(), RtcpReportBlock::SIZE);

        let parsed = RtcpReportBlock::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_loss_word_packing() {
        let block = RtcpReportBlock {
            ssrc: 1,
            fraction_lost: 0xAB,
            cumulative_lost: 0x00CD_EF01,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        block.serialize(&mut buf);
        assert_eq!(&buf[4..8], &[0xAB, 0xCD, 0xEF, 0x01]);
    }

    #[test]
    fn test_cumulative_lost_clamped_to_24_bits() {
        let block = RtcpReportBlock {
            ssrc: 1,
            fraction_lost: 0,
            cumulative_lost: 0xFF00_0001,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        block.serialize(&mut buf);
        let parsed = RtcpReportBlock::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed.cumulative_lost, 1);
    }

    #[test]
    fn test_truncated_rejected() {
        let raw = [0u8; 10];
        assert!(matches!(
            RtcpReportBlock::parse(&mut &raw[..]),
            Err(Error::BufferTooSmall { .. })
        ));
    }
}
