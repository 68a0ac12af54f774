//! Per-source reception statistics
//!
//! One [`ReceptionStats`] entry exists per remote SSRC we receive media
//! from. It maintains the extended (wrap-counted) sequence number range,
//! the RFC 3550 §6.4.1 interarrival jitter estimate, the interval deltas
//! behind the fraction-lost field, and the sender-report synchronization
//! anchor used to turn RTP timestamps into wall-clock presentation times.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, trace};

use crate::packet::rtcp::{NtpTimestamp, RtcpReportBlock};
use crate::time::{duration_to_rtp_ticks, rtp_timestamp_delta};
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Report blocks per RTCP packet are capped by the 5-bit count field
const MAX_REPORT_BLOCKS: usize = 31;

/// Statistics for one remote synchronization source
pub struct ReceptionStats {
    ssrc: RtpSsrc,
    clock_rate: u32,

    packets_received: u64,
    bytes_received: u64,

    /// Extended sequence number of the first packet, offset by one wrap of
    /// headroom
    base_ext_seq: u64,
    /// Highest extended sequence number seen
    highest_ext_seq: u64,

    /// RFC 3550 §6.4.1 jitter estimate, in timestamp units
    jitter: f64,
    last_transit: Option<u32>,
    /// Origin of the arrival clock used for transit times
    arrival_epoch: Instant,

    /// Wall-clock anchor mapping `sync_rtp_timestamp` to `sync_time`
    sync_time: SystemTime,
    sync_rtp_timestamp: RtpTimestamp,
    /// False until a sender report provides a real NTP/RTP mapping
    synchronized: bool,

    /// Middle 32 bits of the most recent SR's NTP timestamp
    last_sr_ntp_mid32: u32,
    last_sr_arrival: Option<Instant>,

    /// Interval snapshots for fraction-lost computation
    expected_prior: u64,
    received_prior: u64,

    last_packet_arrival: Instant,
}

impl ReceptionStats {
    fn new(
        ssrc: RtpSsrc,
        clock_rate: u32,
        first_seq: RtpSequenceNumber,
        first_rtp_timestamp: RtpTimestamp,
        now: Instant,
        wall_now: SystemTime,
    ) -> Self {
        // One wrap of headroom below the base keeps extended sequence
        // arithmetic positive
        let base = (1u64 << 16) | first_seq as u64;
        Self {
            ssrc,
            clock_rate,
            packets_received: 0,
            bytes_received: 0,
            base_ext_seq: base,
            highest_ext_seq: base,
            jitter: 0.0,
            last_transit: None,
            arrival_epoch: now,
            sync_time: wall_now,
            sync_rtp_timestamp: first_rtp_timestamp,
            synchronized: false,
            last_sr_ntp_mid32: 0,
            last_sr_arrival: None,
            expected_prior: 0,
            received_prior: 0,
            last_packet_arrival: now,
        }
    }

    /// The SSRC this entry describes
    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// Packets received from this source
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Payload bytes received from this source
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Current jitter estimate in timestamp units
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Whether an SR has synchronized this source's presentation clock
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// When the most recent packet from this source arrived
    pub fn last_packet_arrival(&self) -> Instant {
        self.last_packet_arrival
    }

    fn note_packet(
        &mut self,
        seq: RtpSequenceNumber,
        rtp_timestamp: RtpTimestamp,
        payload_len: usize,
        usable_for_jitter: bool,
        now: Instant,
    ) -> SystemTime {
        self.packets_received += 1;
        self.bytes_received += payload_len as u64;
        self.last_packet_arrival = now;

        // Extend the sequence number past 16-bit wraps
        let high_lo = (self.highest_ext_seq & 0xFFFF) as u16;
        let ahead = seq.wrapping_sub(high_lo);
        if ahead != 0 && ahead < 0x8000 {
            let mut ext = (self.highest_ext_seq & !0xFFFF) | seq as u64;
            if seq < high_lo {
                ext += 1 << 16;
            }
            self.highest_ext_seq = ext;
        }

        // RFC 3550 §6.4.1: transit = arrival (in timestamp units) minus the
        // media timestamp; jitter is a 1/16 smoothed |transit delta|
        if usable_for_jitter {
            let arrival_ticks =
                duration_to_rtp_ticks(now.duration_since(self.arrival_epoch), self.clock_rate);
            let transit = arrival_ticks.wrapping_sub(rtp_timestamp);
            if let Some(last) = self.last_transit {
                let d = (transit.wrapping_sub(last) as i32).unsigned_abs();
                self.jitter += (d as f64 - self.jitter) / 16.0;
            }
            self.last_transit = Some(transit);
        }

        self.presentation_time_of(rtp_timestamp)
    }

    /// Map a media timestamp through the current synchronization anchor
    pub fn presentation_time_of(&self, rtp_timestamp: RtpTimestamp) -> SystemTime {
        let delta = rtp_timestamp_delta(rtp_timestamp, self.sync_rtp_timestamp);
        let magnitude = Duration::from_micros(
            delta.unsigned_abs() as u64 * 1_000_000 / self.clock_rate as u64,
        );
        if delta >= 0 {
            self.sync_time + magnitude
        } else {
            self.sync_time - magnitude
        }
    }

    fn note_sender_report(
        &mut self,
        ntp: NtpTimestamp,
        rtp_timestamp: RtpTimestamp,
        now: Instant,
    ) {
        self.sync_time = SystemTime::UNIX_EPOCH + ntp.to_unix_duration();
        self.sync_rtp_timestamp = rtp_timestamp;
        if !self.synchronized {
            debug!("Source {:08x} synchronized by first SR", self.ssrc);
            self.synchronized = true;
        }
        self.last_sr_ntp_mid32 = ntp.to_middle_u32();
        self.last_sr_arrival = Some(now);
    }

    /// Build a reception report block and roll the interval snapshots
    pub fn make_report_block(&mut self, now: Instant) -> RtcpReportBlock {
        let expected = self.highest_ext_seq - self.base_ext_seq + 1;
        let cumulative_lost = (expected as i64 - self.packets_received as i64)
            .clamp(0, 0x007F_FFFF) as u32;

        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.packets_received.saturating_sub(self.received_prior);
        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval > 0 && lost_interval > 0 {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        } else {
            0
        };
        self.expected_prior = expected;
        self.received_prior = self.packets_received;

        let (last_sr, delay_since_last_sr) = match self.last_sr_arrival {
            Some(arrival) => {
                let d = now.duration_since(arrival);
                let dlsr = d.as_secs() * 65536 + (d.subsec_nanos() as u64 * 65536) / 1_000_000_000;
                (self.last_sr_ntp_mid32, dlsr as u32)
            }
            None => (0, 0),
        };

        RtcpReportBlock {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost,
            // The report field keeps only the low 32 bits of our extension
            highest_seq: (self.highest_ext_seq - (1 << 16)) as u32,
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        }
    }
}

/// All reception statistics, keyed by remote SSRC
#[derive(Default)]
pub struct ReceptionStatsDb {
    sources: HashMap<RtpSsrc, ReceptionStats>,
}

impl ReceptionStatsDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources currently tracked
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Look up one source's statistics
    pub fn get(&self, ssrc: RtpSsrc) -> Option<&ReceptionStats> {
        self.sources.get(&ssrc)
    }

    /// Record one incoming media packet, creating the source entry on
    /// first sight; returns the packet's presentation time
    #[allow(clippy::too_many_arguments)]
    pub fn note_incoming_packet(
        &mut self,
        ssrc: RtpSsrc,
        clock_rate: u32,
        seq: RtpSequenceNumber,
        rtp_timestamp: RtpTimestamp,
        payload_len: usize,
        usable_for_jitter: bool,
        now: Instant,
        wall_now: SystemTime,
    ) -> SystemTime {
        let entry = self.sources.entry(ssrc).or_insert_with(|| {
            debug!("New source {:08x}, first seq={}", ssrc, seq);
            ReceptionStats::new(ssrc, clock_rate, seq, rtp_timestamp, now, wall_now)
        });
        entry.note_packet(seq, rtp_timestamp, payload_len, usable_for_jitter, now)
    }

    /// Record an incoming sender report's NTP/RTP mapping
    pub fn note_incoming_sr(
        &mut self,
        ssrc: RtpSsrc,
        ntp: NtpTimestamp,
        rtp_timestamp: RtpTimestamp,
        now: Instant,
    ) {
        match self.sources.get_mut(&ssrc) {
            Some(stats) => stats.note_sender_report(ntp, rtp_timestamp, now),
            None => trace!("SR from {:08x} before any media, ignoring", ssrc),
        }
    }

    /// Forget a source (it sent BYE)
    pub fn remove_source(&mut self, ssrc: RtpSsrc) -> bool {
        self.sources.remove(&ssrc).is_some()
    }

    /// Build report blocks for every tracked source
    pub fn make_report_blocks(&mut self, now: Instant) -> Vec<RtcpReportBlock> {
        self.sources
            .values_mut()
            .take(MAX_REPORT_BLOCKS)
            .map(|s| s.make_report_block(now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSRC: RtpSsrc = 0xCAFE_F00D;
    const RATE: u32 = 8000;

    fn db_with_packets(seqs: &[u16]) -> (ReceptionStatsDb, Instant) {
        let mut db = ReceptionStatsDb::new();
        let start = Instant::now();
        let wall = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        for (i, &seq) in seqs.iter().enumerate() {
            db.note_incoming_packet(
                SSRC,
                RATE,
                seq,
                seq as u32 * 160,
                160,
                true,
                start + Duration::from_millis(20 * i as u64),
                wall,
            );
        }
        (db, start)
    }

    #[test]
    fn test_no_loss_report() {
        let (mut db, start) = db_with_packets(&[100, 101, 102, 103]);
        let block = &mut db.make_report_blocks(start + Duration::from_secs(1))[0];
        assert_eq!(block.ssrc, SSRC);
        assert_eq!(block.cumulative_lost, 0);
        assert_eq!(block.fraction_lost, 0);
        assert_eq!(block.highest_seq & 0xFFFF, 103);
    }

    #[test]
    fn test_loss_counted() {
        // 100..=109 expected, 4 missing
        let (mut db, start) = db_with_packets(&[100, 101, 104, 105, 108, 109]);
        let block = &mut db.make_report_blocks(start + Duration::from_secs(1))[0];
        assert_eq!(block.cumulative_lost, 4);
        // 4 of 10 lost: fraction = 4*256/10 = 102
        assert_eq!(block.fraction_lost, 102);
    }

    #[test]
    fn test_fraction_lost_resets_per_interval() {
        let (mut db, start) = db_with_packets(&[100, 103]);
        let first = db.make_report_blocks(start + Duration::from_secs(1))[0].clone();
        assert_eq!(first.cumulative_lost, 2);
        assert!(first.fraction_lost > 0);

        // A clean second interval: cumulative stays, fraction drops to 0
        db.note_incoming_packet(
            SSRC,
            RATE,
            104,
            104 * 160,
            160,
            true,
            start + Duration::from_secs(2),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_002),
        );
        let second = db.make_report_blocks(start + Duration::from_secs(3))[0].clone();
        assert_eq!(second.cumulative_lost, 2);
        assert_eq!(second.fraction_lost, 0);
    }

    #[test]
    fn test_sequence_wrap_extends() {
        let (mut db, start) = db_with_packets(&[65534, 65535, 0, 1]);
        let block = &mut db.make_report_blocks(start)[0];
        // One cycle beyond the base wrap
        assert_eq!(block.highest_seq, (1 << 16) | 1);
        assert_eq!(block.cumulative_lost, 0);
    }

    #[test]
    fn test_jitter_zero_for_perfect_pacing() {
        // Arrival spacing exactly matches timestamp spacing
        let (db, _) = db_with_packets(&[1, 2, 3, 4, 5]);
        assert_eq!(db.get(SSRC).unwrap().jitter(), 0);
    }

    #[test]
    fn test_jitter_outlier_perturbs_by_one_sixteenth() {
        let (mut db, start) = db_with_packets(&[1, 2, 3, 4, 5]);
        assert_eq!(db.get(SSRC).unwrap().jitter(), 0);

        // Packet 6 arrives 16 ms late: transit jumps by 16 ms = 128 ticks
        // at 8 kHz, moving the estimate by 128/16 = 8
        db.note_incoming_packet(
            SSRC,
            RATE,
            6,
            6 * 160,
            160,
            true,
            start + Duration::from_millis(20 * 5 + 16),
            SystemTime::UNIX_EPOCH,
        );
        assert_eq!(db.get(SSRC).unwrap().jitter(), 8);
    }

    #[test]
    fn test_sr_synchronizes_presentation_time() {
        let mut db = ReceptionStatsDb::new();
        let now = Instant::now();
        let wall = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);
        db.note_incoming_packet(SSRC, RATE, 10, 8000, 160, true, now, wall);
        assert!(!db.get(SSRC).unwrap().is_synchronized());

        // SR: NTP time T maps to RTP timestamp 8000
        let sr_wall = Duration::from_secs(2_000_100);
        db.note_incoming_sr(SSRC, NtpTimestamp::from_unix_duration(sr_wall), 8000, now);
        assert!(db.get(SSRC).unwrap().is_synchronized());

        // A packet one second of media later (8000 ticks at 8 kHz)
        let pt = db.get(SSRC).unwrap().presentation_time_of(16000);
        let expect = SystemTime::UNIX_EPOCH + sr_wall + Duration::from_secs(1);
        let diff = pt
            .duration_since(expect)
            .unwrap_or_else(|e| e.duration());
        assert!(diff < Duration::from_millis(1));
    }

    #[test]
    fn test_lsr_dlsr_in_report() {
        let mut db = ReceptionStatsDb::new();
        let now = Instant::now();
        let wall = SystemTime::now();
        db.note_incoming_packet(SSRC, RATE, 1, 0, 160, true, now, wall);

        let ntp = NtpTimestamp::from_unix_duration(Duration::new(1_600_000_000, 250_000_000));
        db.note_incoming_sr(SSRC, ntp, 0, now);

        let block = &mut db.make_report_blocks(now + Duration::from_millis(500))[0];
        assert_eq!(block.last_sr, ntp.to_middle_u32());
        // 500 ms in 1/65536 s units
        assert!((block.delay_since_last_sr as i64 - 32768).abs() < 70);
    }

    #[test]
    fn test_bye_removes_source() {
        let (mut db, _) = db_with_packets(&[1, 2]);
        assert_eq!(db.len(), 1);
        assert!(db.remove_source(SSRC));
        assert!(db.is_empty());
        assert!(!db.remove_source(SSRC));
    }
}
