//! Per-receiver transmission statistics
//!
//! Each receiver of the stream we send reports its view of the stream in
//! RTCP receiver reports. [`TransmissionStats`] keeps the most recent
//! report from one receiver plus the deltas between consecutive reports,
//! and derives the round-trip time from the LSR/DLSR echo per RFC 3550
//! §6.4.1: `rtt = now - lsr - dlsr`, all in 1/65536 second units.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::packet::rtcp::RtcpReportBlock;
use crate::RtpSsrc;

/// Convert a 1/65536-second (middle-32 NTP) value to a duration
fn mid32_to_duration(value: u32) -> Duration {
    let secs = (value >> 16) as u64;
    let nanos = ((value & 0xFFFF) as u64 * 1_000_000_000) >> 16;
    Duration::new(secs, nanos as u32)
}

/// The latest report from one receiver, plus inter-report deltas
pub struct TransmissionStats {
    reporter_ssrc: RtpSsrc,
    last_from: SocketAddr,

    fraction_lost: u8,
    total_lost: u32,
    prev_total_lost: u32,
    highest_ext_seq: u32,
    first_highest_ext_seq: u32,
    jitter: u32,

    round_trip_delay: Option<Duration>,
    last_report_arrival: Instant,
    reports_received: u64,
}

impl TransmissionStats {
    fn new(reporter_ssrc: RtpSsrc, from: SocketAddr, now: Instant) -> Self {
        Self {
            reporter_ssrc,
            last_from: from,
            fraction_lost: 0,
            total_lost: 0,
            prev_total_lost: 0,
            highest_ext_seq: 0,
            first_highest_ext_seq: 0,
            jitter: 0,
            round_trip_delay: None,
            last_report_arrival: now,
            reports_received: 0,
        }
    }

    fn note_report(&mut self, block: &RtcpReportBlock, from: SocketAddr, now_mid32: u32, now: Instant) {
        if self.reports_received == 0 {
            // First report establishes the baselines; deltas start with the
            // second report
            self.first_highest_ext_seq = block.highest_seq;
            self.prev_total_lost = block.cumulative_lost;
        } else {
            self.prev_total_lost = self.total_lost;
        }
        self.reports_received += 1;
        self.last_from = from;
        self.last_report_arrival = now;

        self.fraction_lost = block.fraction_lost;
        self.total_lost = block.cumulative_lost;
        self.highest_ext_seq = block.highest_seq;
        self.jitter = block.jitter;

        // RTT from the LSR/DLSR echo; zero LSR means the receiver has not
        // seen one of our SRs yet
        if block.last_sr != 0 {
            let rtt_mid32 = now_mid32
                .wrapping_sub(block.last_sr)
                .wrapping_sub(block.delay_since_last_sr);
            // A wrapped (negative) result means unsynchronized clocks
            if rtt_mid32 < 0x8000_0000 {
                let rtt = mid32_to_duration(rtt_mid32);
                trace!(
                    "RTT to {:08x}: {:.1} ms",
                    self.reporter_ssrc,
                    rtt.as_secs_f64() * 1000.0
                );
                self.round_trip_delay = Some(rtt);
            }
        }
    }

    /// SSRC of the reporting receiver
    pub fn reporter_ssrc(&self) -> RtpSsrc {
        self.reporter_ssrc
    }

    /// Address the last report arrived from
    pub fn last_from(&self) -> SocketAddr {
        self.last_from
    }

    /// Fraction lost in the last report interval (8-bit fixed point)
    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    /// Cumulative packets lost as of the last report
    pub fn total_lost(&self) -> u32 {
        self.total_lost
    }

    /// Packets lost between the two most recent reports
    pub fn packets_lost_between_reports(&self) -> i64 {
        self.total_lost as i64 - self.prev_total_lost as i64
    }

    /// Extended highest sequence number the receiver reported
    pub fn highest_ext_seq(&self) -> u32 {
        self.highest_ext_seq
    }

    /// Packets the receiver has seen since its first report
    pub fn packets_received_since_first_report(&self) -> u32 {
        self.highest_ext_seq.wrapping_sub(self.first_highest_ext_seq)
    }

    /// Receiver's interarrival jitter, in timestamp units
    pub fn jitter(&self) -> u32 {
        self.jitter
    }

    /// Most recent round-trip measurement, when the LSR echo allows one
    pub fn round_trip_delay(&self) -> Option<Duration> {
        self.round_trip_delay
    }

    /// When the last report arrived
    pub fn last_report_arrival(&self) -> Instant {
        self.last_report_arrival
    }
}

/// All transmission statistics, keyed by reporting receiver SSRC
#[derive(Default)]
pub struct TransmissionStatsDb {
    receivers: HashMap<RtpSsrc, TransmissionStats>,
}

impl TransmissionStatsDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub fn get(&self, reporter_ssrc: RtpSsrc) -> Option<&TransmissionStats> {
        self.receivers.get(&reporter_ssrc)
    }

    /// Iterate over every known receiver
    pub fn iter(&self) -> impl Iterator<Item = &TransmissionStats> {
        self.receivers.values()
    }

    /// Record one report block from `reporter_ssrc`
    ///
    /// `now_mid32` is the current wall clock in middle-32 NTP form, used
    /// for the RTT computation.
    pub fn note_incoming_report(
        &mut self,
        reporter_ssrc: RtpSsrc,
        block: &RtcpReportBlock,
        from: SocketAddr,
        now_mid32: u32,
        now: Instant,
    ) {
        let entry = self.receivers.entry(reporter_ssrc).or_insert_with(|| {
            debug!("New receiver {:08x} reporting from {}", reporter_ssrc, from);
            TransmissionStats::new(reporter_ssrc, from, now)
        });
        entry.note_report(block, from, now_mid32, now);
    }

    /// Forget a receiver (it sent BYE)
    pub fn remove_receiver(&mut self, reporter_ssrc: RtpSsrc) -> bool {
        self.receivers.remove(&reporter_ssrc).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORTER: RtpSsrc = 0xABCD_0001;

    fn addr() -> SocketAddr {
        "192.0.2.1:5007".parse().unwrap()
    }

    fn block(cumulative_lost: u32, highest_seq: u32, last_sr: u32, dlsr: u32) -> RtcpReportBlock {
        RtcpReportBlock {
            ssrc: 0x1111_2222,
            fraction_lost: 0,
            cumulative_lost,
            highest_seq,
            jitter: 12,
            last_sr,
            delay_since_last_sr: dlsr,
        }
    }

    #[test]
    fn test_rtt_from_lsr_echo() {
        let mut db = TransmissionStatsDb::new();
        let now = Instant::now();

        // Our SR left at mid32 time 0x0010_0000; the receiver held it for
        // 0.5 s (0x8000) and we see the report at 0x0010_C000, leaving an
        // RTT of 0x4000 = 0.25 s
        db.note_incoming_report(
            REPORTER,
            &block(0, 1000, 0x0010_0000, 0x8000),
            addr(),
            0x0010_C000,
            now,
        );

        let rtt = db.get(REPORTER).unwrap().round_trip_delay().unwrap();
        assert_eq!(rtt, Duration::from_millis(250));
    }

    #[test]
    fn test_no_rtt_without_sr_echo() {
        let mut db = TransmissionStatsDb::new();
        db.note_incoming_report(REPORTER, &block(0, 1000, 0, 0), addr(), 0x100, Instant::now());
        assert!(db.get(REPORTER).unwrap().round_trip_delay().is_none());
    }

    #[test]
    fn test_first_report_establishes_loss_baseline() {
        let mut db = TransmissionStatsDb::new();
        db.note_incoming_report(REPORTER, &block(3, 1000, 0, 0), addr(), 0, Instant::now());

        // Loss accumulated before we ever heard from this receiver is not
        // an inter-report delta
        let stats = db.get(REPORTER).unwrap();
        assert_eq!(stats.total_lost(), 3);
        assert_eq!(stats.packets_lost_between_reports(), 0);
        assert_eq!(stats.packets_received_since_first_report(), 0);
    }

    #[test]
    fn test_inter_report_deltas() {
        let mut db = TransmissionStatsDb::new();
        let now = Instant::now();
        db.note_incoming_report(REPORTER, &block(3, 1000, 0, 0), addr(), 0, now);
        db.note_incoming_report(REPORTER, &block(8, 1500, 0, 0), addr(), 0, now);

        let stats = db.get(REPORTER).unwrap();
        assert_eq!(stats.total_lost(), 8);
        assert_eq!(stats.packets_lost_between_reports(), 5);
        assert_eq!(stats.packets_received_since_first_report(), 500);
    }

    #[test]
    fn test_wrapped_rtt_discarded() {
        let mut db = TransmissionStatsDb::new();
        // LSR is "after" our current clock: unsynchronized, no RTT
        db.note_incoming_report(
            REPORTER,
            &block(0, 1, 0xF000_0000, 0),
            addr(),
            0x1000_0000,
            Instant::now(),
        );
        assert!(db.get(REPORTER).unwrap().round_trip_delay().is_none());
    }

    #[test]
    fn test_remove_receiver() {
        let mut db = TransmissionStatsDb::new();
        db.note_incoming_report(REPORTER, &block(0, 1, 0, 0), addr(), 0, Instant::now());
        assert!(db.remove_receiver(REPORTER));
        assert!(db.is_empty());
    }
}
