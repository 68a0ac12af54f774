//! RTP send pipeline
//!
//! [`MultiFramedRtpSink`] pulls media frames from a [`FrameSource`], packs
//! as many as fit into each outgoing packet, fragments frames larger than
//! one packet's payload capacity (when the payload format permits), and
//! paces transmission by scheduling itself as a delayed task for the
//! duration of the frames each packet carried.
//!
//! The packing decisions deliberately reproduce a conservative heuristic
//! rather than exact bin packing: a packet is flushed when it reaches its
//! preferred size, when another frame the size of the one just added would
//! overflow it, or when a completed fragmentation forbids anything after
//! it. Downstream timing assumptions depend on this exact behavior, so it
//! must not be "improved".

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::packet::{RtpHeader, RtpPacket, RTP_MIN_HEADER_SIZE};
use crate::payload::{FragmentContext, PayloadPacketizer};
use crate::scheduler::{TaskScheduler, TaskToken};
use crate::stats::{SenderState, SharedSenderState};
use crate::transport::DatagramTransport;
use crate::{Error, Result};

/// One frame pulled from the upstream media source
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// Frame contents
    pub data: Bytes,
    /// Capture/presentation wall-clock time
    pub presentation_time: SystemTime,
    /// How long this frame lasts; drives send pacing
    pub duration: Duration,
}

/// Upstream media supplier
///
/// The sink pulls synchronously from the event loop; implementations must
/// not block. `max_size` is advisory (the room left in the current
/// packet) — a larger returned frame is deferred or fragmented by the
/// sink. Returning `None` means the stream has ended.
pub trait FrameSource: Send {
    fn next_frame(&mut self, max_size: usize) -> Option<MediaFrame>;
}

/// Send-side stream parameters
#[derive(Debug, Clone)]
pub struct RtpSinkConfig {
    /// Packet size the packing heuristics aim for
    pub preferred_packet_size: usize,
    /// Hard upper bound on any packet
    pub max_packet_size: usize,
    /// Fixed SSRC; random when `None`
    pub ssrc: Option<u32>,
    /// Fixed initial sequence number; random when `None`
    pub initial_sequence_number: Option<u16>,
    /// Fixed timestamp base; random when `None`
    pub timestamp_base: Option<u32>,
}

impl Default for RtpSinkConfig {
    fn default() -> Self {
        Self {
            preferred_packet_size: 1000,
            max_packet_size: 1450,
            ssrc: None,
            initial_sequence_number: None,
            timestamp_base: None,
        }
    }
}

/// A frame carried over to the next packet, either whole or mid-fragment
struct Overflow {
    frame: MediaFrame,
    offset: usize,
}

enum SendOutcome {
    /// Packet sent; schedule the next send after this delay
    Continue(Duration),
    /// Source exhausted; playback is over
    Finished,
}

struct SinkInner {
    transport: Arc<dyn DatagramTransport>,
    dest: SocketAddr,
    packetizer: Box<dyn PayloadPacketizer>,
    config: RtpSinkConfig,

    sender_state: SharedSenderState,
    sequence_number: u16,

    frame_source: Option<Box<dyn FrameSource>>,
    overflow: Option<Overflow>,
    next_send_time: Option<Instant>,
    pacing_task: Option<TaskToken>,
    done: Option<oneshot::Sender<()>>,

    packets_sent: u64,
    truncated_bytes: u64,
}

/// The send pipeline for one RTP stream
pub struct MultiFramedRtpSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl MultiFramedRtpSink {
    /// Create a sink sending to `dest` over `transport`
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        dest: SocketAddr,
        packetizer: Box<dyn PayloadPacketizer>,
        config: RtpSinkConfig,
    ) -> Self {
        let ssrc = config.ssrc.unwrap_or_else(rand::random);
        let seq = config.initial_sequence_number.unwrap_or_else(rand::random);
        let ts_base = config.timestamp_base.unwrap_or_else(rand::random);
        let clock_rate = packetizer.clock_rate();
        debug!(
            "RTP sink to {}: ssrc={:08x}, pt={}, clock={}",
            dest,
            ssrc,
            packetizer.payload_type(),
            clock_rate
        );

        Self {
            inner: Arc::new(Mutex::new(SinkInner {
                transport,
                dest,
                packetizer,
                config,
                sender_state: Arc::new(Mutex::new(SenderState::new(ssrc, clock_rate, ts_base))),
                sequence_number: seq,
                frame_source: None,
                overflow: None,
                next_send_time: None,
                pacing_task: None,
                done: None,
                packets_sent: 0,
                truncated_bytes: 0,
            })),
        }
    }

    /// Shared sender counters, for the RTCP engine's sender reports
    pub fn sender_state(&self) -> SharedSenderState {
        self.inner.lock().sender_state.clone()
    }

    /// Our SSRC on this stream
    pub fn ssrc(&self) -> u32 {
        self.inner.lock().sender_state.lock().ssrc
    }

    /// Packets transmitted so far
    pub fn packets_sent(&self) -> u64 {
        self.inner.lock().packets_sent
    }

    /// Frame bytes dropped because an unfragmentable frame exceeded the
    /// packet capacity
    pub fn truncated_bytes(&self) -> u64 {
        self.inner.lock().truncated_bytes
    }

    /// Start pulling frames from `source` and transmitting
    ///
    /// The first packet goes out on the next event-loop iteration. The
    /// returned channel resolves when the source is exhausted or
    /// [`Self::stop_playing`] is called.
    pub fn start_playing(
        &self,
        scheduler: &mut TaskScheduler,
        source: Box<dyn FrameSource>,
    ) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            if inner.frame_source.is_some() {
                return Err(Error::Session("sink is already playing".to_string()));
            }
            inner.frame_source = Some(source);
            inner.overflow = None;
            inner.next_send_time = None;
            inner.done = Some(tx);
        }

        let inner = self.inner.clone();
        let token = scheduler
            .schedule_delayed_task(Duration::ZERO, move |s| SinkInner::send_next(&inner, s));
        self.inner.lock().pacing_task = Some(token);
        Ok(rx)
    }

    /// Stop transmitting; the pending pacing task is cancelled
    pub fn stop_playing(&self, scheduler: &mut TaskScheduler) {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.pacing_task.take() {
            scheduler.unschedule_delayed_task(token);
        }
        inner.finish();
    }
}

impl SinkInner {
    /// The self-rescheduling pacing task: build and send one packet, then
    /// schedule the next send after the duration of the frames it carried
    fn send_next(inner: &Arc<Mutex<Self>>, scheduler: &mut TaskScheduler) {
        let outcome = inner.lock().build_and_send_packet(Instant::now());
        match outcome {
            SendOutcome::Continue(delay) => {
                let next = inner.clone();
                let token = scheduler
                    .schedule_delayed_task(delay, move |s| Self::send_next(&next, s));
                inner.lock().pacing_task = Some(token);
            }
            SendOutcome::Finished => {
                inner.lock().finish();
            }
        }
    }

    fn finish(&mut self) {
        if self.frame_source.take().is_some() {
            debug!("RTP sink playback finished after {} packets", self.packets_sent);
        }
        self.overflow = None;
        self.pacing_task = None;
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }

    /// Pack frames into one packet, send it, and report what to do next
    fn build_and_send_packet(&mut self, now: Instant) -> SendOutcome {
        let payload_capacity = self
            .config
            .preferred_packet_size
            .saturating_sub(RTP_MIN_HEADER_SIZE);

        let mut payload = BytesMut::with_capacity(payload_capacity);
        let mut packet_timestamp_time: Option<SystemTime> = None;
        let mut marker = false;
        let mut frames_duration = Duration::ZERO;
        let mut last_added_size = 0usize;
        let mut source_exhausted = false;

        loop {
            let room = payload_capacity - payload.len();

            let (frame, offset) = match self.overflow.take() {
                Some(o) => (o.frame, o.offset),
                None => {
                    if !payload.is_empty() && !self.packetizer.frame_can_appear_after_packet_start()
                    {
                        break;
                    }
                    let Some(source) = self.frame_source.as_mut() else {
                        source_exhausted = true;
                        break;
                    };
                    match source.next_frame(room) {
                        Some(f) => (f, 0),
                        None => {
                            source_exhausted = true;
                            break;
                        }
                    }
                }
            };

            let remaining = frame.data.len() - offset;
            packet_timestamp_time.get_or_insert(frame.presentation_time);

            // Fit is judged with the per-fragment special header included;
            // formats with non-empty headers shrink the usable room
            let whole_ctx = FragmentContext {
                frame: &frame.data,
                fragment_offset: offset,
                fragment_len: remaining,
                is_last_fragment: true,
                frame_starts_packet: payload.is_empty(),
            };
            let whole_special = self.packetizer.special_header(&whole_ctx);

            if whole_special.len() + remaining > room {
                if !payload.is_empty() {
                    // No room alongside earlier frames; defer it whole
                    self.overflow = Some(Overflow { frame, offset });
                    break;
                }
                if self.packetizer.allow_fragmentation() {
                    // Emit the next fragment and keep the rest for the
                    // following packet
                    let probe = FragmentContext {
                        frame: &frame.data,
                        fragment_offset: offset,
                        fragment_len: remaining.min(room),
                        is_last_fragment: false,
                        frame_starts_packet: true,
                    };
                    let special = self.packetizer.special_header(&probe);
                    let frag_len = room.saturating_sub(special.len());
                    let ctx = FragmentContext {
                        fragment_len: frag_len,
                        ..probe
                    };
                    marker |= self.packetizer.marker_bit(&ctx);
                    payload.extend_from_slice(&special);
                    payload.extend_from_slice(&frame.data[offset..offset + frag_len]);
                    trace!(
                        "Fragment at offset {} ({} of {} bytes)",
                        offset,
                        frag_len,
                        frame.data.len()
                    );
                    self.overflow = Some(Overflow {
                        frame,
                        offset: offset + frag_len,
                    });
                    break;
                }

                // Unfragmentable oversized frame: send what fits, drop the
                // rest
                let probe = FragmentContext {
                    frame: &frame.data,
                    fragment_offset: offset,
                    fragment_len: room,
                    is_last_fragment: true,
                    frame_starts_packet: true,
                };
                let special = self.packetizer.special_header(&probe);
                let cut = room.saturating_sub(special.len());
                warn!(
                    "Frame of {} bytes exceeds packet capacity, truncating to {}",
                    remaining, cut
                );
                self.truncated_bytes += (remaining - cut) as u64;
                let ctx = FragmentContext {
                    fragment_len: cut,
                    ..probe
                };
                marker |= self.packetizer.marker_bit(&ctx);
                payload.extend_from_slice(&special);
                payload.extend_from_slice(&frame.data[offset..offset + cut]);
                frames_duration += frame.duration;
                break;
            }

            // The rest of the frame fits, header included
            let is_final_fragment = offset > 0;
            marker |= self.packetizer.marker_bit(&whole_ctx);
            payload.extend_from_slice(&whole_special);
            payload.extend_from_slice(&frame.data[offset..]);
            last_added_size = whole_special.len() + remaining;
            frames_duration += frame.duration;

            if is_final_fragment && !self.packetizer.frame_can_appear_after_packet_start() {
                // Nothing may follow a completed fragmentation
                break;
            }
            if payload.len() >= payload_capacity {
                break;
            }
            // Conservative lookahead: flush if another frame the size of
            // the one just added would overflow
            if payload.len() + last_added_size > payload_capacity {
                break;
            }
        }

        if payload.is_empty() {
            return SendOutcome::Finished;
        }

        self.transmit(payload.freeze(), packet_timestamp_time, marker);

        if source_exhausted && self.overflow.is_none() {
            return SendOutcome::Finished;
        }

        // Pace against an absolute send clock so per-packet truncation does
        // not drift forward
        let step = truncate_micros(frames_duration);
        let next = self.next_send_time.unwrap_or(now) + step;
        self.next_send_time = Some(next);
        SendOutcome::Continue(next.saturating_duration_since(now))
    }

    fn transmit(&mut self, payload: Bytes, timestamp_time: Option<SystemTime>, marker: bool) {
        let (ssrc, timestamp) = {
            let state = self.sender_state.lock();
            let t = timestamp_time.unwrap_or_else(SystemTime::now);
            (state.ssrc, state.rtp_timestamp_for(t))
        };

        let mut header = RtpHeader::new(
            self.packetizer.payload_type(),
            self.sequence_number,
            timestamp,
            ssrc,
        );
        header.marker = marker;
        let packet = RtpPacket::new(header, payload);

        match packet.serialize() {
            Ok(bytes) => {
                debug_assert!(bytes.len() <= self.config.max_packet_size);
                if let Err(e) = self.transport.write_datagram(self.dest, &bytes) {
                    warn!("RTP send to {} failed: {}", self.dest, e);
                }
                self.sequence_number = self.sequence_number.wrapping_add(1);
                self.packets_sent += 1;
                self.sender_state
                    .lock()
                    .note_packet_sent(bytes.len() - RTP_MIN_HEADER_SIZE);
                trace!("Sent {:?}", packet);
            }
            Err(e) => warn!("Failed to serialize outgoing packet: {}", e),
        }
    }
}

/// Truncate (never round) to whole microseconds, avoiding forward drift
fn truncate_micros(d: Duration) -> Duration {
    Duration::from_micros(d.as_micros() as u64)
}
