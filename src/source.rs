//! RTP receive pipeline
//!
//! [`MultiFramedRtpSource`] turns a stream of RTP datagrams into complete
//! media frames. Datagrams are drained from the transport inside a
//! scheduler read handler, validated, noted in the reception statistics,
//! pushed through the reordering buffer, and finally reassembled: payload
//! headers are stripped by the [`Depacketizer`], frame chunks are
//! concatenated until a packet completes the frame, and partial frames are
//! dropped whenever the reorder buffer declares a gap. Completed frames
//! are delivered as [`SourceEvent`]s on an unbounded channel so the
//! consumer never blocks the event loop.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferedPacket, ReorderingPacketBuffer, StoreResult};
use crate::packet::RtpPacket;
use crate::payload::{Depacketizer, PacketContext};
use crate::scheduler::{SocketToken, TaskScheduler};
use crate::stats::reception::ReceptionStatsDb;
use crate::transport::{DatagramRead, DatagramTransport};
use crate::{RtpSsrc, RtpTimestamp};

/// Shared handle to the reception statistics, used by both the source and
/// the RTCP engine
pub type SharedReceptionStats = Arc<Mutex<ReceptionStatsDb>>;

/// Receive-side stream parameters
#[derive(Debug, Clone)]
pub struct RtpSourceConfig {
    /// Expected RTP payload type; packets with any other type are dropped
    pub payload_type: u8,
    /// RTP timestamp clock rate in Hz
    pub clock_rate: u32,
    /// How long the reorder buffer waits for a missing packet
    pub reordering_threshold: Duration,
    /// Receive buffer size; datagrams filling it completely are assumed
    /// truncated
    pub receive_buffer_size: usize,
    /// Upper bound on one reassembled frame; excess bytes are dropped and
    /// counted in the delivered frame
    pub max_frame_size: usize,
}

impl RtpSourceConfig {
    pub fn new(payload_type: u8, clock_rate: u32) -> Self {
        Self {
            payload_type,
            clock_rate,
            reordering_threshold: crate::buffer::DEFAULT_REORDERING_THRESHOLD,
            receive_buffer_size: 65536,
            max_frame_size: 1 << 20,
        }
    }

    pub fn with_reordering_threshold(mut self, threshold: Duration) -> Self {
        self.reordering_threshold = threshold;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }
}

/// One reassembled media frame
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// Frame data with all payload-format headers stripped
    pub data: Bytes,
    /// RTP timestamp of the frame's first packet
    pub rtp_timestamp: RtpTimestamp,
    /// Presentation time recovered through the stats synchronization anchor
    pub presentation_time: SystemTime,
    /// Marker bit of the packet that completed the frame
    pub marker: bool,
    /// SSRC of the sending source
    pub ssrc: RtpSsrc,
    /// Bytes dropped because the frame exceeded the configured maximum
    pub truncated_bytes: usize,
}

/// Events delivered to the source's consumer
#[derive(Debug)]
pub enum SourceEvent {
    /// A complete frame was reassembled
    Frame(ReceivedFrame),
    /// The transport closed; no further frames will arrive
    Closed,
}

/// Drop counters, visible for diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCounters {
    /// Valid RTP packets accepted
    pub packets_received: u64,
    /// Datagrams that failed RTP validation
    pub invalid_dropped: u64,
    /// Valid packets with an unexpected payload type
    pub wrong_payload_type: u64,
    /// Valid packets from an SSRC other than the stream's
    pub other_ssrc: u64,
    /// Datagrams that filled the receive buffer and were likely truncated
    pub truncated: u64,
}

enum FrameState {
    /// Waiting for a packet whose frame data begins a frame (stream start,
    /// or resynchronizing after loss)
    AwaitingStart,
    /// Mid-frame, accumulating chunks
    Assembling {
        data: BytesMut,
        rtp_timestamp: RtpTimestamp,
        presentation_time: SystemTime,
        truncated: usize,
    },
}

/// Append at most `max - data.len()` bytes, counting the overflow
fn append_limited(data: &mut BytesMut, chunk: &[u8], max: usize, truncated: &mut usize) {
    let take = chunk.len().min(max.saturating_sub(data.len()));
    data.extend_from_slice(&chunk[..take]);
    *truncated += chunk.len() - take;
}

struct Inner {
    transport: Arc<dyn DatagramTransport>,
    config: RtpSourceConfig,
    depacketizer: Box<dyn Depacketizer>,
    reorder: ReorderingPacketBuffer,
    stats: SharedReceptionStats,
    events: mpsc::UnboundedSender<SourceEvent>,

    /// First media SSRC seen; packets from any other are dropped
    stream_ssrc: Option<RtpSsrc>,
    frame: FrameState,
    /// Timestamp of the last packet handed to the depacketizer
    last_drained_timestamp: Option<RtpTimestamp>,
    counters: SourceCounters,
    socket_token: Option<SocketToken>,
    closed: bool,
}

/// The receive pipeline for one RTP stream
pub struct MultiFramedRtpSource {
    inner: Arc<Mutex<Inner>>,
    events: Option<mpsc::UnboundedReceiver<SourceEvent>>,
}

impl MultiFramedRtpSource {
    /// Create a source reading from `transport`
    ///
    /// `stats` is shared with the RTCP engine so receiver reports reflect
    /// what this pipeline actually saw.
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        config: RtpSourceConfig,
        depacketizer: Box<dyn Depacketizer>,
        stats: SharedReceptionStats,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let reorder = ReorderingPacketBuffer::with_threshold(config.reordering_threshold);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                transport,
                config,
                depacketizer,
                reorder,
                stats,
                events: tx,
                stream_ssrc: None,
                frame: FrameState::AwaitingStart,
                last_drained_timestamp: None,
                counters: SourceCounters::default(),
                socket_token: None,
                closed: false,
            })),
            events: Some(rx),
        }
    }

    /// Take the event receiver; yields `None` after the first call
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SourceEvent>> {
        self.events.take()
    }

    /// Current drop counters
    pub fn counters(&self) -> SourceCounters {
        self.inner.lock().counters
    }

    /// Register the read handler and start receiving
    pub fn start(&self, scheduler: &mut TaskScheduler) {
        let inner = self.inner.clone();
        let transport = inner.lock().transport.clone();
        let handler_inner = inner.clone();
        let token = scheduler.turn_on_background_read_handling(transport, move |scheduler| {
            Inner::drain_transport(&handler_inner, scheduler);
        });
        inner.lock().socket_token = Some(token);
        debug!("RTP source started, socket token {}", token);
    }

    /// Mark the stream as ended and deliver [`SourceEvent::Closed`]
    ///
    /// Used by the application when it learns out-of-band that the sender
    /// is gone, typically from an RTCP BYE. Idempotent, and a no-op after
    /// the transport itself closed.
    pub fn notify_closed(&self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.closed = true;
            let _ = inner.events.send(SourceEvent::Closed);
            debug!("RTP source closed by application");
        }
    }

    /// Deregister the read handler; queued events remain readable
    pub fn stop(&self, scheduler: &mut TaskScheduler) {
        let token = self.inner.lock().socket_token.take();
        if let Some(token) = token {
            scheduler.turn_off_background_read_handling(token);
            debug!("RTP source stopped, socket token {}", token);
        }
    }
}

impl Inner {
    fn drain_transport(inner: &Arc<Mutex<Self>>, scheduler: &mut TaskScheduler) {
        let mut guard = inner.lock();
        let transport = guard.transport.clone();
        let mut buf = vec![0u8; guard.config.receive_buffer_size];

        loop {
            match transport.read_datagram(&mut buf) {
                Ok(DatagramRead::Datagram { len, from }) => {
                    if len == buf.len() {
                        guard.counters.truncated += 1;
                        warn!("Datagram from {} filled the receive buffer, likely truncated", from);
                    }
                    guard.process_datagram(&buf[..len], Instant::now(), SystemTime::now());
                }
                Ok(DatagramRead::WouldBlock) => break,
                Ok(DatagramRead::Closed) => {
                    guard.close(scheduler);
                    break;
                }
                Err(e) => {
                    warn!("RTP read failed: {}", e);
                    break;
                }
            }
        }

        guard.drain_completed(Instant::now());
    }

    fn close(&mut self, scheduler: &mut TaskScheduler) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(token) = self.socket_token.take() {
            scheduler.turn_off_background_read_handling(token);
        }
        let _ = self.events.send(SourceEvent::Closed);
        debug!("RTP source transport closed");
    }

    /// Validate one datagram, note it in the stats, and queue it for
    /// reordering
    fn process_datagram(&mut self, data: &[u8], now: Instant, wall_now: SystemTime) {
        let packet = match RtpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                self.counters.invalid_dropped += 1;
                trace!("Dropping invalid RTP datagram: {}", e);
                return;
            }
        };

        if packet.header.payload_type != self.config.payload_type {
            self.counters.wrong_payload_type += 1;
            trace!(
                "Dropping packet with payload type {} (expected {})",
                packet.header.payload_type,
                self.config.payload_type
            );
            return;
        }

        let ssrc = packet.header.ssrc;
        match self.stream_ssrc {
            None => {
                debug!("Locking onto stream SSRC {:08x}", ssrc);
                self.stream_ssrc = Some(ssrc);
            }
            Some(expected) if expected != ssrc => {
                self.counters.other_ssrc += 1;
                trace!("Dropping packet from unexpected SSRC {:08x}", ssrc);
                return;
            }
            Some(_) => {}
        }

        self.counters.packets_received += 1;

        let ctx = PacketContext {
            payload: &packet.payload,
            seq: packet.header.sequence_number,
            rtp_timestamp: packet.header.timestamp,
            marker: packet.header.marker,
            timestamp_changed: self.last_drained_timestamp != Some(packet.header.timestamp),
        };
        let usable_for_jitter = self.depacketizer.packet_usable_for_jitter(&ctx);

        let presentation_time = self.stats.lock().note_incoming_packet(
            ssrc,
            self.config.clock_rate,
            packet.header.sequence_number,
            packet.header.timestamp,
            packet.payload.len(),
            usable_for_jitter,
            now,
            wall_now,
        );

        let buffered = BufferedPacket::new(
            packet.payload,
            packet.header.sequence_number,
            packet.header.timestamp,
            packet.header.marker,
            presentation_time,
            now,
        );
        match self.reorder.store_packet(buffered) {
            StoreResult::Stored => {}
            StoreResult::Duplicate | StoreResult::Stale => {
                trace!("Reorder buffer rejected seq={}", packet.header.sequence_number);
            }
        }
    }

    /// Pull in-order packets out of the reorder buffer and run the frame
    /// reassembly state machine over them
    fn drain_completed(&mut self, now: Instant) {
        loop {
            let ssrc = match self.stream_ssrc {
                Some(s) => s,
                None => return,
            };

            let Some((head, after_gap)) = self.reorder.next_completed_packet(now) else {
                return;
            };

            let seq = head.seq;
            let rtp_timestamp = head.rtp_timestamp;
            let marker = head.marker;
            let presentation_time = head.presentation_time;
            let payload = Bytes::copy_from_slice(head.remaining());
            self.reorder.release_used_packet();

            if after_gap {
                if matches!(self.frame, FrameState::Assembling { .. }) {
                    debug!("Packet loss before seq={}, dropping partial frame", seq);
                    self.frame = FrameState::AwaitingStart;
                }
            }

            let ctx = PacketContext {
                payload: &payload,
                seq,
                rtp_timestamp,
                marker,
                timestamp_changed: self.last_drained_timestamp != Some(rtp_timestamp),
            };
            self.last_drained_timestamp = Some(rtp_timestamp);

            let Some(special) = self.depacketizer.process_special_header(&ctx) else {
                trace!("Depacketizer discarded packet seq={}", seq);
                continue;
            };
            let header_size = special.header_size.min(payload.len());
            let chunk = payload.slice(header_size..);
            let max_frame = self.config.max_frame_size;

            match &mut self.frame {
                FrameState::AwaitingStart => {
                    if !special.begins_frame {
                        trace!("Discarding mid-frame packet seq={} while resynchronizing", seq);
                        continue;
                    }
                    let mut data = BytesMut::with_capacity(chunk.len().min(max_frame));
                    let mut truncated = 0;
                    append_limited(&mut data, &chunk, max_frame, &mut truncated);
                    if special.completes_frame {
                        self.emit_frame(
                            data.freeze(),
                            rtp_timestamp,
                            presentation_time,
                            marker,
                            ssrc,
                            truncated,
                        );
                    } else {
                        self.frame = FrameState::Assembling {
                            data,
                            rtp_timestamp,
                            presentation_time,
                            truncated,
                        };
                    }
                }
                FrameState::Assembling {
                    data,
                    rtp_timestamp: frame_ts,
                    presentation_time: frame_pt,
                    truncated,
                } => {
                    if special.begins_frame {
                        // The previous frame never saw its completing
                        // packet; drop it rather than deliver a hybrid
                        debug!("New frame at seq={} while assembling, dropping partial", seq);
                        data.clear();
                        *frame_ts = rtp_timestamp;
                        *frame_pt = presentation_time;
                        *truncated = 0;
                    }
                    append_limited(data, &chunk, max_frame, truncated);
                    if special.completes_frame {
                        let (frame_ts, frame_pt, truncated) = (*frame_ts, *frame_pt, *truncated);
                        let data = std::mem::take(data).freeze();
                        self.frame = FrameState::AwaitingStart;
                        self.emit_frame(data, frame_ts, frame_pt, marker, ssrc, truncated);
                    }
                }
            }
        }
    }

    fn emit_frame(
        &mut self,
        data: Bytes,
        rtp_timestamp: RtpTimestamp,
        presentation_time: SystemTime,
        marker: bool,
        ssrc: RtpSsrc,
        truncated_bytes: usize,
    ) {
        if truncated_bytes > 0 {
            warn!(
                "Frame ts={} exceeded {} bytes, dropped {} bytes",
                rtp_timestamp, self.config.max_frame_size, truncated_bytes
            );
        }
        trace!("Delivering frame of {} bytes, ts={}", data.len(), rtp_timestamp);
        let frame = ReceivedFrame {
            data,
            rtp_timestamp,
            presentation_time,
            marker,
            ssrc,
            truncated_bytes,
        };
        if self.events.send(SourceEvent::Frame(frame)).is_err() {
            trace!("Frame consumer gone, dropping frame");
        }
    }
}
