//! Packet buffering and sequence-number reordering
//!
//! RTP makes no delivery-order guarantee. A strict "wait for the next
//! sequence number" policy would stall forever on loss, so the reordering
//! buffer converts indefinite waiting into bounded-latency delivery: the
//! head packet is released either because it is exactly the next expected
//! sequence number, or because it has waited longer than the reordering
//! threshold, at which point a gap is declared and the loss is signaled to
//! the reassembly layer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{RtpSequenceNumber, RtpTimestamp};

/// Default time the buffer waits for an out-of-order packet before
/// declaring it lost
pub const DEFAULT_REORDERING_THRESHOLD: Duration = Duration::from_millis(100);

/// A packet behind `next_expected` by fewer than this many sequence numbers
/// is stale; one behind by more is treated as having wrapped ahead
const STALE_DISTANCE: u16 = 100;

/// One received datagram plus its parsed RTP metadata
///
/// The payload is held until the reassembly layer has read it and releases
/// the packet from the reorder queue.
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    payload: Bytes,

    /// RTP sequence number
    pub seq: RtpSequenceNumber,

    /// RTP media timestamp
    pub rtp_timestamp: RtpTimestamp,

    /// RTP marker bit
    pub marker: bool,

    /// Synchronized presentation time recovered by the reception stats
    pub presentation_time: SystemTime,

    /// When the datagram arrived
    pub time_received: Instant,
}

impl BufferedPacket {
    /// Wrap a received payload (header already stripped) with its metadata
    pub fn new(
        payload: Bytes,
        seq: RtpSequenceNumber,
        rtp_timestamp: RtpTimestamp,
        marker: bool,
        presentation_time: SystemTime,
        time_received: Instant,
    ) -> Self {
        Self {
            payload,
            seq,
            rtp_timestamp,
            marker,
            presentation_time,
            time_received,
        }
    }

    /// Payload bytes (RTP header already stripped)
    pub fn remaining(&self) -> &[u8] {
        &self.payload
    }
}

/// Outcome of [`ReorderingPacketBuffer::store_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreResult {
    /// Packet inserted in sequence order
    Stored,
    /// A packet with the same sequence number is already queued
    Duplicate,
    /// Packet arrived too far behind `next_expected` and was dropped
    Stale,
}

/// Ordered collection of buffered packets awaiting in-sequence delivery
///
/// Packets are keyed by a 64-bit extended sequence number anchored at
/// `next_expected`, so iteration order is the circular (mod 2^16) sequence
/// order. Delivery is two-phase: [`next_completed_packet`] exposes the head
/// while the reassembly layer drains it, [`release_used_packet`] advances
/// past it.
///
/// [`next_completed_packet`]: ReorderingPacketBuffer::next_completed_packet
/// [`release_used_packet`]: ReorderingPacketBuffer::release_used_packet
pub struct ReorderingPacketBuffer {
    packets: BTreeMap<u64, BufferedPacket>,
    /// Sequence number the application expects next; `None` before the
    /// first packet
    next_expected: Option<RtpSequenceNumber>,
    /// Extended sequence number corresponding to `next_expected`
    ext_base: u64,
    threshold: Duration,
}

impl ReorderingPacketBuffer {
    /// Create a buffer with the default 100 ms reordering threshold
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_REORDERING_THRESHOLD)
    }

    /// Create a buffer with an explicit reordering threshold
    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            packets: BTreeMap::new(),
            next_expected: None,
            // Headroom below the anchor keeps extended keys positive even
            // if the anchor later jumps backward within a wrap
            ext_base: 1 << 16,
            threshold,
        }
    }

    /// Change the reordering threshold
    pub fn set_threshold(&mut self, threshold: Duration) {
        self.threshold = threshold;
    }

    /// Number of queued packets
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether no packets are queued
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Insert a packet in sequence order
    ///
    /// Duplicates (same sequence number already queued) and stale packets
    /// (behind `next_expected` by fewer than 100, 16-bit circular) are
    /// rejected; a packet behind by 100 or more is taken to have wrapped
    /// and is stored as far ahead. The first packet ever stored anchors
    /// `next_expected` at its own sequence number.
    pub fn store_packet(&mut self, packet: BufferedPacket) -> StoreResult {
        let seq = packet.seq;
        let next = match self.next_expected {
            Some(next) => next,
            None => {
                trace!("First packet, anchoring at seq={}", seq);
                self.next_expected = Some(seq);
                self.packets.insert(self.ext_base, packet);
                return StoreResult::Stored;
            }
        };

        let ahead = seq.wrapping_sub(next);
        if ahead >= 0x8000 {
            // Behind the anchor; drop if close, otherwise assume the
            // 16-bit comparison misclassified a wrapped packet
            let behind = next.wrapping_sub(seq);
            if behind < STALE_DISTANCE {
                trace!("Dropping stale packet seq={} ({} behind)", seq, behind);
                return StoreResult::Stale;
            }
        }

        let ext = self.ext_base + ahead as u64;
        if self.packets.contains_key(&ext) {
            trace!("Dropping duplicate packet seq={}", seq);
            return StoreResult::Duplicate;
        }

        self.packets.insert(ext, packet);
        StoreResult::Stored
    }

    /// Head packet ready for delivery, with its loss flag
    ///
    /// Returns the head either because its sequence number equals
    /// `next_expected` (loss flag `false`), or because it has waited longer
    /// than the reordering threshold — in which case a gap is declared,
    /// `next_expected` jumps to the head's sequence number, and the loss
    /// flag is `true`. Returns `None` while the head is still worth
    /// waiting for.
    pub fn next_completed_packet(&mut self, now: Instant) -> Option<(&mut BufferedPacket, bool)> {
        let (&head_ext, head) = self.packets.iter().next()?;

        if head_ext == self.ext_base {
            let head = self.packets.get_mut(&head_ext).unwrap();
            return Some((head, false));
        }

        if now.duration_since(head.time_received) > self.threshold {
            debug!(
                "Reordering threshold exceeded, declaring gap before seq={}",
                head.seq
            );
            let head = self.packets.remove(&head_ext).unwrap();
            self.next_expected = Some(head.seq);
            self.ext_base = head_ext;
            self.packets.insert(head_ext, head);
            let head = self.packets.get_mut(&head_ext).unwrap();
            return Some((head, true));
        }

        None
    }

    /// Unlink the head packet and advance `next_expected` one past it
    ///
    /// Call only after [`Self::next_completed_packet`] returned the head.
    pub fn release_used_packet(&mut self) {
        if let Some((&head_ext, _)) = self.packets.iter().next() {
            if head_ext == self.ext_base {
                self.packets.remove(&head_ext);
            }
        }
        self.next_expected = self.next_expected.map(|s| s.wrapping_add(1));
        self.ext_base += 1;
    }

    /// Sequence number the buffer expects next
    pub fn next_expected_seq(&self) -> Option<RtpSequenceNumber> {
        self.next_expected
    }

    /// Drop all queued packets and forget the sequence anchor
    pub fn reset(&mut self) {
        self.packets.clear();
        self.next_expected = None;
        self.ext_base = 1 << 16;
    }
}

impl Default for ReorderingPacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: RtpSequenceNumber) -> BufferedPacket {
        packet_at(seq, Instant::now())
    }

    fn packet_at(seq: RtpSequenceNumber, received: Instant) -> BufferedPacket {
        BufferedPacket::new(
            Bytes::from(vec![seq as u8; 4]),
            seq,
            seq as u32 * 160,
            false,
            SystemTime::UNIX_EPOCH,
            received,
        )
    }

    fn drain(buffer: &mut ReorderingPacketBuffer, now: Instant) -> Vec<(RtpSequenceNumber, bool)> {
        let mut out = Vec::new();
        while let Some((head, loss)) = buffer.next_completed_packet(now) {
            out.push((head.seq, loss));
            buffer.release_used_packet();
        }
        out
    }

    #[test]
    fn test_any_permutation_delivers_in_order() {
        // A handful of permutations of seq 1000..=1004, including reversed
        let permutations: [[u16; 5]; 4] = [
            [1000, 1001, 1002, 1003, 1004],
            [1004, 1003, 1002, 1001, 1000],
            [1002, 1000, 1004, 1001, 1003],
            [1001, 1000, 1003, 1004, 1002],
        ];

        for perm in permutations {
            let mut buffer = ReorderingPacketBuffer::new();
            // Anchor the buffer at 1000 first, as the source's first
            // delivered packet would
            assert_eq!(buffer.store_packet(packet(1000)), StoreResult::Stored);
            for &seq in &perm[..] {
                if seq != 1000 {
                    assert_eq!(buffer.store_packet(packet(seq)), StoreResult::Stored);
                }
            }

            let delivered = drain(&mut buffer, Instant::now());
            let expected: Vec<_> = (1000u16..=1004).map(|s| (s, false)).collect();
            assert_eq!(delivered, expected, "permutation {:?}", perm);
        }
    }

    #[test]
    fn test_loss_threshold_release() {
        let mut buffer = ReorderingPacketBuffer::with_threshold(Duration::from_millis(100));
        let start = Instant::now();

        // Packet 10 anchors; 11 never arrives; 12 and 13 do
        assert_eq!(buffer.store_packet(packet_at(10, start)), StoreResult::Stored);
        assert_eq!(
            buffer.next_completed_packet(start).map(|(p, l)| (p.seq, l)),
            Some((10, false))
        );
        buffer.release_used_packet();
        assert_eq!(buffer.next_expected_seq(), Some(11));

        buffer.store_packet(packet_at(12, start));
        buffer.store_packet(packet_at(13, start));

        // Within the threshold nothing is released
        assert!(buffer
            .next_completed_packet(start + Duration::from_millis(50))
            .is_none());

        // After the threshold the head is force-released with the loss flag
        let later = start + Duration::from_millis(150);
        let (seq, loss) = buffer
            .next_completed_packet(later)
            .map(|(p, l)| (p.seq, l))
            .unwrap();
        assert_eq!((seq, loss), (12, true));
        buffer.release_used_packet();
        assert_eq!(buffer.next_expected_seq(), Some(13));

        // 13 is now exactly the next expected
        assert_eq!(
            buffer.next_completed_packet(later).map(|(p, l)| (p.seq, l)),
            Some((13, false))
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut buffer = ReorderingPacketBuffer::new();
        assert_eq!(buffer.store_packet(packet(100)), StoreResult::Stored);
        assert_eq!(buffer.store_packet(packet(101)), StoreResult::Stored);
        assert_eq!(buffer.store_packet(packet(101)), StoreResult::Duplicate);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_stale_rejected_but_wrap_accepted() {
        let mut buffer = ReorderingPacketBuffer::new();
        buffer.store_packet(packet(1000));
        let (_, _) = buffer.next_completed_packet(Instant::now()).unwrap();
        buffer.release_used_packet();
        assert_eq!(buffer.next_expected_seq(), Some(1001));

        // 999 is 2 behind: stale
        assert_eq!(buffer.store_packet(packet(999)), StoreResult::Stale);
        // 950 is 51 behind: still stale
        assert_eq!(buffer.store_packet(packet(950)), StoreResult::Stale);
        // 800 is 201 behind: treated as wrapped far ahead, accepted
        assert_eq!(buffer.store_packet(packet(800)), StoreResult::Stored);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_wraparound_ordering() {
        let mut buffer = ReorderingPacketBuffer::new();
        for seq in [65534u16, 65535, 0, 1] {
            assert_eq!(buffer.store_packet(packet(seq)), StoreResult::Stored);
        }

        let delivered = drain(&mut buffer, Instant::now());
        assert_eq!(
            delivered,
            vec![(65534, false), (65535, false), (0, false), (1, false)]
        );
        assert_eq!(buffer.next_expected_seq(), Some(2));
    }

    #[test]
    fn test_zero_length_packet_is_valid() {
        let mut buffer = ReorderingPacketBuffer::new();
        let empty = BufferedPacket::new(
            Bytes::new(),
            7,
            0,
            true,
            SystemTime::UNIX_EPOCH,
            Instant::now(),
        );
        assert_eq!(buffer.store_packet(empty), StoreResult::Stored);
        let (head, loss) = buffer.next_completed_packet(Instant::now()).unwrap();
        assert!(!loss);
        assert!(head.remaining().is_empty());
        assert!(head.marker);
    }
}
