//! Payload-format hooks
//!
//! The receive and send pipelines are payload-format agnostic; everything a
//! concrete format needs to customize — special headers inside the RTP
//! payload, frame boundary detection, marker-bit policy, fragmentation
//! rules — goes through the [`Depacketizer`] and [`PayloadPacketizer`]
//! traits. The provided [`SimpleDepacketizer`] and [`SimplePacketizer`]
//! cover formats where one packet carries one frame (or a plain fragment
//! of one) with no extra header.

use bytes::Bytes;

use crate::{RtpSequenceNumber, RtpTimestamp};

/// Read-only view of one received packet handed to a [`Depacketizer`]
#[derive(Debug, Clone, Copy)]
pub struct PacketContext<'a> {
    /// Full RTP payload, special header included
    pub payload: &'a [u8],
    /// RTP sequence number
    pub seq: RtpSequenceNumber,
    /// RTP media timestamp
    pub rtp_timestamp: RtpTimestamp,
    /// RTP marker bit
    pub marker: bool,
    /// Whether the RTP timestamp changed from the previous accepted packet
    /// (or this is the first packet seen)
    pub timestamp_changed: bool,
}

/// A depacketizer's verdict on one packet's special header
#[derive(Debug, Clone, Copy)]
pub struct SpecialHeader {
    /// Bytes of payload-format header to strip before frame data
    pub header_size: usize,
    /// Whether frame data in this packet starts a new frame
    pub begins_frame: bool,
    /// Whether frame data in this packet ends its frame
    pub completes_frame: bool,
}

/// Receive-side payload-format hook
///
/// Invoked once per packet as it reaches the head of the reorder queue.
/// Returning `None` discards the packet entirely (e.g. an unusable
/// interleaving or a config packet the format handles out of band).
pub trait Depacketizer: Send {
    /// Parse the payload-format header and classify the packet's frame data
    fn process_special_header(&mut self, packet: &PacketContext<'_>) -> Option<SpecialHeader>;

    /// Whether this packet's timing is usable for jitter measurement
    ///
    /// Formats that retransmit or interleave old data return `false` for
    /// packets whose timestamps do not reflect the current capture clock.
    fn packet_usable_for_jitter(&self, _packet: &PacketContext<'_>) -> bool {
        true
    }
}

/// Depacketizer for formats where every packet is one complete frame
#[derive(Debug, Default)]
pub struct SimpleDepacketizer;

impl Depacketizer for SimpleDepacketizer {
    fn process_special_header(&mut self, _packet: &PacketContext<'_>) -> Option<SpecialHeader> {
        Some(SpecialHeader {
            header_size: 0,
            begins_frame: true,
            completes_frame: true,
        })
    }
}

/// Position of one outgoing fragment within its frame
#[derive(Debug, Clone, Copy)]
pub struct FragmentContext<'a> {
    /// The whole frame being sent
    pub frame: &'a [u8],
    /// Offset of this fragment within the frame (0 for an unfragmented
    /// frame or the first fragment)
    pub fragment_offset: usize,
    /// Length of this fragment
    pub fragment_len: usize,
    /// Whether this fragment ends the frame
    pub is_last_fragment: bool,
    /// Whether the frame starts at the beginning of the packet's frame
    /// data (false when packed after an earlier frame in the same packet)
    pub frame_starts_packet: bool,
}

/// Send-side payload-format hook
///
/// Controls the static RTP parameters of the stream plus the per-fragment
/// decisions: special header bytes, marker bit, and whether the generic
/// packing and fragmentation machinery may be used at all.
pub trait PayloadPacketizer: Send {
    /// RTP payload type for this stream
    fn payload_type(&self) -> u8;

    /// RTP timestamp clock rate in Hz
    fn clock_rate(&self) -> u32;

    /// RTCP SDES media description, e.g. `"audio/L16"`
    fn media_description(&self) -> &str {
        "data"
    }

    /// Payload-format header to prepend to this fragment's data
    fn special_header(&self, _fragment: &FragmentContext<'_>) -> Bytes {
        Bytes::new()
    }

    /// Marker bit for the packet carrying this fragment
    ///
    /// The default marks only the final fragment of a fragmented frame,
    /// which lets receivers detect the end of a large frame.
    fn marker_bit(&self, fragment: &FragmentContext<'_>) -> bool {
        fragment.fragment_offset > 0 && fragment.is_last_fragment
    }

    /// Whether a frame too large for one packet may be split across
    /// packets
    fn allow_fragmentation(&self) -> bool {
        false
    }

    /// Whether a second frame may be appended after one already in the
    /// packet
    fn frame_can_appear_after_packet_start(&self) -> bool {
        true
    }
}

/// Packetizer for formats with no special header
#[derive(Debug, Clone)]
pub struct SimplePacketizer {
    payload_type: u8,
    clock_rate: u32,
    allow_fragmentation: bool,
}

impl SimplePacketizer {
    pub fn new(payload_type: u8, clock_rate: u32) -> Self {
        Self {
            payload_type,
            clock_rate,
            allow_fragmentation: false,
        }
    }

    /// Permit splitting oversized frames across packets
    pub fn with_fragmentation(mut self) -> Self {
        self.allow_fragmentation = true;
        self
    }
}

impl PayloadPacketizer for SimplePacketizer {
    fn payload_type(&self) -> u8 {
        self.payload_type
    }

    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn allow_fragmentation(&self) -> bool {
        self.allow_fragmentation
    }
}
