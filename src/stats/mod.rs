//! Reception and transmission statistics
//!
//! Two databases back the RTCP report machinery: [`ReceptionStatsDb`]
//! tracks every remote SSRC we receive media from (loss, jitter,
//! sender-report synchronization), and [`TransmissionStatsDb`] tracks
//! every receiver that reports on the stream we send (their loss view and
//! the measured round-trip time). [`SenderState`] is the small piece of
//! send-side state shared between the RTP sink and the RTCP engine so
//! sender reports carry accurate packet and octet counts.

pub mod reception;
pub mod transmission;

pub use reception::{ReceptionStats, ReceptionStatsDb};
pub use transmission::{TransmissionStats, TransmissionStatsDb};

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::packet::rtcp::NtpTimestamp;
use crate::time::duration_to_rtp_ticks;
use crate::{RtpSsrc, RtpTimestamp};

/// Send-side counters shared between the RTP sink and the RTCP engine
///
/// The sink updates the counters as it transmits; the RTCP engine samples
/// them when it builds a sender report. `rtp_timestamp_for` maps a wall
/// clock time onto the stream's RTP timestamp line, which is also how the
/// sink stamps outgoing packets, so SR timestamps and media timestamps
/// stay on the same line.
pub struct SenderState {
    /// Our SSRC on this stream
    pub ssrc: RtpSsrc,
    /// RTP timestamp clock rate in Hz
    pub clock_rate: u32,
    /// Random timestamp offset chosen at stream creation
    pub timestamp_base: RtpTimestamp,
    /// Packets sent since stream creation
    pub packet_count: u32,
    /// Payload octets sent since stream creation (headers excluded)
    pub octet_count: u32,
}

impl SenderState {
    pub fn new(ssrc: RtpSsrc, clock_rate: u32, timestamp_base: RtpTimestamp) -> Self {
        Self {
            ssrc,
            clock_rate,
            timestamp_base,
            packet_count: 0,
            octet_count: 0,
        }
    }

    /// RTP timestamp corresponding to wall clock time `t`
    pub fn rtp_timestamp_for(&self, t: SystemTime) -> RtpTimestamp {
        let since_epoch = t
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        self.timestamp_base
            .wrapping_add(duration_to_rtp_ticks(since_epoch, self.clock_rate))
    }

    /// Record one transmitted packet with `payload_len` octets of payload
    pub fn note_packet_sent(&mut self, payload_len: usize) {
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(payload_len as u32);
    }

    /// NTP wall clock paired with its RTP timestamp, for sender reports
    pub fn sender_report_times(&self, now: SystemTime) -> (NtpTimestamp, RtpTimestamp) {
        (NtpTimestamp::from_system_time(now), self.rtp_timestamp_for(now))
    }
}

/// Shared handle to [`SenderState`]
pub type SharedSenderState = Arc<Mutex<SenderState>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sender_counters_accumulate() {
        let mut s = SenderState::new(0x1234, 8000, 500);
        s.note_packet_sent(160);
        s.note_packet_sent(160);
        assert_eq!(s.packet_count, 2);
        assert_eq!(s.octet_count, 320);
    }

    #[test]
    fn test_timestamp_line_advances_with_clock() {
        let s = SenderState::new(1, 8000, 1000);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let t1 = t0 + Duration::from_millis(20);
        let ts0 = s.rtp_timestamp_for(t0);
        let ts1 = s.rtp_timestamp_for(t1);
        // 20 ms at 8 kHz is 160 ticks
        assert_eq!(ts1.wrapping_sub(ts0), 160);
    }
}
