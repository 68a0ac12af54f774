//! Time and clock utilities
//!
//! Conversions between RTP media timestamps and wall-clock durations, used
//! by the send pipeline to stamp outgoing packets and by the reception
//! statistics to recover presentation times.

use std::time::Duration;

use crate::RtpTimestamp;

/// Convert an RTP timestamp tick count to a duration at a given clock rate.
pub fn rtp_ticks_to_duration(ticks: u32, clock_rate: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::ZERO;
    }
    let seconds = (ticks / clock_rate) as u64;
    let remainder = (ticks % clock_rate) as u64;
    let nanos = (remainder * 1_000_000_000) / clock_rate as u64;
    Duration::new(seconds, nanos as u32)
}

/// Convert a duration to RTP timestamp ticks at a given clock rate.
///
/// Seconds scale exactly; the sub-second part is converted from microseconds
/// with rounding, matching the send pipeline's timestamp formula
/// `base + freq*secs + round(freq*micros/1e6)`. The 32-bit result wraps.
pub fn duration_to_rtp_ticks(duration: Duration, clock_rate: u32) -> RtpTimestamp {
    let seconds = duration.as_secs();
    let micros = duration.subsec_micros() as u64;
    let whole = seconds.wrapping_mul(clock_rate as u64);
    let fraction = (micros * clock_rate as u64 + 500_000) / 1_000_000;
    whole.wrapping_add(fraction) as u32
}

/// Signed difference `a - b` between two RTP timestamps, mod 2^32.
///
/// The result is the shortest circular distance: positive when `a` is ahead
/// of `b`, negative when behind.
pub fn rtp_timestamp_delta(a: RtpTimestamp, b: RtpTimestamp) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Typical clock rates for common payload formats
pub mod clock_rates {
    /// G.711, G.726, G.729 (8kHz)
    pub const AUDIO_8KHZ: u32 = 8000;

    /// G.722 (16kHz)
    pub const AUDIO_16KHZ: u32 = 16000;

    /// Opus, AAC (48kHz)
    pub const AUDIO_48KHZ: u32 = 48000;

    /// Typical video clock rate (90kHz)
    pub const VIDEO_90KHZ: u32 = 90000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_duration_roundtrip() {
        let duration = Duration::from_millis(125);
        let ticks = duration_to_rtp_ticks(duration, 8000);
        assert_eq!(ticks, 1000); // 125ms = 1000 samples at 8kHz

        let back = rtp_ticks_to_duration(ticks, 8000);
        assert_eq!(back.as_millis(), 125);

        let ticks = duration_to_rtp_ticks(Duration::from_secs(1), 48000);
        assert_eq!(ticks, 48000);
    }

    #[test]
    fn test_zero_clock_rate() {
        assert_eq!(rtp_ticks_to_duration(1000, 0), Duration::ZERO);
    }

    #[test]
    fn test_timestamp_delta() {
        assert_eq!(rtp_timestamp_delta(2000, 1000), 1000);
        assert_eq!(rtp_timestamp_delta(1000, 2000), -1000);

        // Wraparound: 10 is 11 ticks ahead of 0xFFFF_FFFF
        assert_eq!(rtp_timestamp_delta(10, 0xFFFF_FFFF), 11);
        assert_eq!(rtp_timestamp_delta(0xFFFF_FFFF, 10), -11);
    }

    #[test]
    fn test_timestamp_monotonic_and_wraps_exactly() {
        // Non-decreasing inputs give non-decreasing tick counts (mod wrap)
        let mut last = duration_to_rtp_ticks(Duration::ZERO, 90_000);
        for ms in (0..2000).step_by(10) {
            let t = duration_to_rtp_ticks(Duration::from_millis(ms), 90_000);
            assert!(t.wrapping_sub(last) < 0x8000_0000);
            last = t;
        }

        // Two times exactly 2^32 / 8000 = 536870.912 s apart map to the
        // same 32-bit timestamp
        let wrap_period = Duration::new(536_870, 912_000_000);
        let t0 = Duration::from_secs(1000);
        assert_eq!(
            duration_to_rtp_ticks(t0, 8000),
            duration_to_rtp_ticks(t0 + wrap_period, 8000)
        );
    }

    #[test]
    fn test_fraction_rounding() {
        // 999_999 us at 8kHz: 8000 * 0.999999 = 7999.992, rounds to 8000
        let ticks = duration_to_rtp_ticks(Duration::from_micros(999_999), 8000);
        assert_eq!(ticks, 8000);
    }
}
