//! RFC 3550 report interval computation
//!
//! The report cadence scales with group size so aggregate RTCP traffic
//! stays at a fixed fraction of the session bandwidth, and every computed
//! interval is re-randomized within [0.5x, 1.5x) of nominal. Without the
//! randomization, every participant's reports would phase-lock.

use std::time::Duration;

use rand::Rng;

/// Floor on the report interval (RFC 3550 recommends 5 seconds)
pub const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Fraction of the session bandwidth allotted to RTCP
pub const RTCP_BANDWIDTH_FRACTION: f64 = 0.05;

/// Initial average-compound-size estimate, before any packet is seen
pub const INITIAL_AVG_PACKET_SIZE: f64 = 128.0;

/// Deterministic (un-randomized) report interval
///
/// `avg_packet_size` is the running average compound size in bytes,
/// `members` the current session member estimate, and the bandwidth the
/// session's media bandwidth in kilobits per second (RTCP gets a 5%
/// share). The result never drops below `min_interval`.
pub fn nominal_interval(
    avg_packet_size: f64,
    members: usize,
    session_bandwidth_kbps: u32,
    min_interval: Duration,
) -> Duration {
    let rtcp_bytes_per_sec =
        session_bandwidth_kbps as f64 * 1000.0 / 8.0 * RTCP_BANDWIDTH_FRACTION;
    if rtcp_bytes_per_sec <= 0.0 {
        return min_interval;
    }
    let computed =
        Duration::from_secs_f64(avg_packet_size * members.max(1) as f64 / rtcp_bytes_per_sec);
    computed.max(min_interval)
}

/// Randomize an interval within [0.5x, 1.5x) to desynchronize senders
pub fn jittered(nominal: Duration, rng: &mut impl Rng) -> Duration {
    nominal.mul_f64(rng.gen_range(0.5..1.5))
}

/// Fold one observed compound packet size into the running average
/// (1/16 exponential smoothing per RFC 3550 Appendix A.7)
pub fn update_avg_packet_size(avg: f64, size: usize) -> f64 {
    avg * 15.0 / 16.0 + size as f64 / 16.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_sessions_floor_at_minimum() {
        let i = nominal_interval(128.0, 2, 500, MIN_REPORT_INTERVAL);
        assert_eq!(i, MIN_REPORT_INTERVAL);
    }

    #[test]
    fn test_interval_scales_with_members() {
        // 10000 members at 128 bytes each against 500 kbps * 5% = 3125 B/s
        let i = nominal_interval(128.0, 10_000, 500, MIN_REPORT_INTERVAL);
        assert!(i > Duration::from_secs(400));
    }

    #[test]
    fn test_jitter_window_and_spread() {
        let nominal = Duration::from_secs(5);
        let mut rng = rand::thread_rng();

        let intervals: Vec<Duration> = (0..1000)
            .map(|_| jittered(nominal, &mut rng))
            .collect();

        for i in &intervals {
            assert!(*i >= Duration::from_millis(2500), "below window: {:?}", i);
            assert!(*i < Duration::from_millis(7500), "above window: {:?}", i);
        }
        let all_same = intervals.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_same);
    }

    #[test]
    fn test_avg_size_converges() {
        let mut avg = INITIAL_AVG_PACKET_SIZE;
        for _ in 0..200 {
            avg = update_avg_packet_size(avg, 96);
        }
        assert!((avg - 96.0).abs() < 1.0);
    }
}
