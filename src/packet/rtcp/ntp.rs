use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Offset from the NTP epoch (1900) to the UNIX epoch (1970), in seconds
const NTP_TO_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp as carried in RTCP sender reports (RFC 3550)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Fraction of a second (1/2^32 units)
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Capture the current wall-clock time as an NTP timestamp
    pub fn now() -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_unix_duration(since_unix)
    }

    /// Capture a specific wall-clock time as an NTP timestamp
    pub fn from_system_time(t: SystemTime) -> Self {
        let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self::from_unix_duration(since_unix)
    }

    /// Build from a duration since the UNIX epoch
    pub fn from_unix_duration(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_TO_UNIX_OFFSET;
        let fraction = ((duration.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    /// Convert to a duration since the UNIX epoch
    pub fn to_unix_duration(&self) -> Duration {
        let seconds = (self.seconds as u64).saturating_sub(NTP_TO_UNIX_OFFSET);
        let nanos = ((self.fraction as u64) * 1_000_000_000) >> 32;
        Duration::new(seconds, nanos as u32)
    }

    /// Full 64-bit representation
    pub fn to_u64(&self) -> u64 {
        (self.seconds as u64) << 32 | self.fraction as u64
    }

    /// Build from the full 64-bit representation
    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Middle 32 bits, as used in the LSR field of report blocks
    ///
    /// Low 16 bits of the seconds plus high 16 bits of the fraction; the
    /// resulting value counts in units of 1/65536 seconds (RFC 3550 §6.4.1).
    pub fn to_middle_u32(&self) -> u32 {
        (self.seconds & 0x0000FFFF) << 16 | (self.fraction >> 16)
    }
}
