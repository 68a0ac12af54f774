//! RTCP engine
//!
//! [`RtcpInstance`] owns one control stream for an RTP session: it
//! schedules compound SR/RR+SDES reports on the randomized RFC 3550
//! interval, parses incoming compounds, feeds SR synchronization into the
//! reception statistics and RR blocks into the transmission statistics,
//! sends an immediate BYE when the local session ends, and surfaces peer
//! BYEs through a registered handler (which closure logic treats the same
//! as the media source closing).

pub mod interval;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::packet::rtcp::{
    NtpTimestamp, RtcpCompoundPacket, RtcpGoodbye, RtcpPacket, RtcpReceiverReport,
    RtcpReportBlock, RtcpSenderReport, RtcpSourceDescription,
};
use crate::scheduler::{SocketToken, TaskScheduler, TaskToken};
use crate::source::SharedReceptionStats;
use crate::stats::{SharedSenderState, TransmissionStatsDb};
use crate::transport::{DatagramRead, DatagramTransport};
use crate::RtpSsrc;

/// Invoked when a peer leaves the session via BYE
pub type ByeHandler = Box<dyn FnMut(RtpSsrc) + Send>;

/// RTCP session parameters
#[derive(Debug, Clone)]
pub struct RtcpConfig {
    /// Canonical name for our SDES chunk; derived from the hostname when
    /// `None`
    pub cname: Option<String>,
    /// Session media bandwidth in kilobits per second; RTCP takes a 5%
    /// share
    pub session_bandwidth_kbps: u32,
    /// Floor on the report interval; the RFC 3550 default is 5 seconds
    pub min_report_interval: Duration,
}

impl Default for RtcpConfig {
    fn default() -> Self {
        Self {
            cname: None,
            session_bandwidth_kbps: 500,
            min_report_interval: interval::MIN_REPORT_INTERVAL,
        }
    }
}

fn default_cname() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{:08x}@{}", rand::random::<u32>(), host)
}

struct RtcpInner {
    transport: Arc<dyn DatagramTransport>,
    dest: SocketAddr,
    ssrc: RtpSsrc,
    cname: String,
    config: RtcpConfig,

    /// Present when this instance drives an RTP sink (we send media)
    sender_state: Option<SharedSenderState>,
    /// Present when this instance drives an RTP source (we receive media)
    reception: Option<SharedReceptionStats>,
    transmission: TransmissionStatsDb,

    avg_packet_size: f64,
    report_task: Option<TaskToken>,
    socket_token: Option<SocketToken>,
    bye_handler: Option<ByeHandler>,
    bye_sent: bool,
    reports_sent: u64,
}

/// The RTCP control half of one RTP session
pub struct RtcpInstance {
    inner: Arc<Mutex<RtcpInner>>,
}

impl RtcpInstance {
    /// Create an RTCP instance for a session
    ///
    /// Pass `sender_state` when the session sends media (reports begin
    /// with an SR carrying its counters) and `reception` when it receives
    /// media (reports carry a block per remote sender). Either may be
    /// absent; a receive-only session sends RRs.
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        dest: SocketAddr,
        config: RtcpConfig,
        sender_state: Option<SharedSenderState>,
        reception: Option<SharedReceptionStats>,
    ) -> Self {
        let ssrc = sender_state
            .as_ref()
            .map(|s| s.lock().ssrc)
            .unwrap_or_else(rand::random);
        let cname = config.cname.clone().unwrap_or_else(default_cname);
        debug!("RTCP instance for {}: ssrc={:08x}, cname={}", dest, ssrc, cname);

        Self {
            inner: Arc::new(Mutex::new(RtcpInner {
                transport,
                dest,
                ssrc,
                cname,
                config,
                sender_state,
                reception,
                transmission: TransmissionStatsDb::new(),
                avg_packet_size: interval::INITIAL_AVG_PACKET_SIZE,
                report_task: None,
                socket_token: None,
                bye_handler: None,
                bye_sent: false,
                reports_sent: 0,
            })),
        }
    }

    /// Our SSRC in outgoing reports
    pub fn ssrc(&self) -> RtpSsrc {
        self.inner.lock().ssrc
    }

    /// Compound reports sent so far
    pub fn reports_sent(&self) -> u64 {
        self.inner.lock().reports_sent
    }

    /// Register the handler invoked when a peer sends BYE
    pub fn set_bye_handler(&self, handler: impl FnMut(RtpSsrc) + Send + 'static) {
        self.inner.lock().bye_handler = Some(Box::new(handler));
    }

    /// Inspect the transmission statistics (receiver reports about our
    /// outgoing stream)
    pub fn with_transmission_stats<R>(&self, f: impl FnOnce(&TransmissionStatsDb) -> R) -> R {
        f(&self.inner.lock().transmission)
    }

    /// Start report scheduling and incoming-packet handling
    ///
    /// The first report goes out after half a jittered interval, which
    /// spreads session-startup reports instead of bursting them.
    pub fn start(&self, scheduler: &mut TaskScheduler) {
        let transport = self.inner.lock().transport.clone();
        let read_inner = self.inner.clone();
        let token = scheduler.turn_on_background_read_handling(transport, move |_| {
            RtcpInner::drain_incoming(&read_inner);
        });
        self.inner.lock().socket_token = Some(token);

        let first_delay = self.inner.lock().next_interval() / 2;
        let task_inner = self.inner.clone();
        let task = scheduler
            .schedule_delayed_task(first_delay, move |s| RtcpInner::report_task(&task_inner, s));
        self.inner.lock().report_task = Some(task);
        debug!("RTCP started, first report in {:?}", first_delay);
    }

    /// Stop scheduling and deregister the read handler; no BYE is sent
    pub fn stop(&self, scheduler: &mut TaskScheduler) {
        let mut inner = self.inner.lock();
        if let Some(token) = inner.report_task.take() {
            scheduler.unschedule_delayed_task(token);
        }
        if let Some(token) = inner.socket_token.take() {
            scheduler.turn_off_background_read_handling(token);
        }
    }

    /// Send a compound report immediately, outside the schedule
    pub fn send_report_now(&self) {
        self.inner.lock().send_report();
    }

    /// Send BYE immediately and stop reporting
    ///
    /// BYE bypasses the scheduled interval: the session is ending now and
    /// peers should hear about it before the socket goes away.
    pub fn send_bye(&self, scheduler: &mut TaskScheduler, reason: Option<&str>) {
        let mut inner = self.inner.lock();
        if inner.bye_sent {
            return;
        }
        inner.bye_sent = true;
        if let Some(token) = inner.report_task.take() {
            scheduler.unschedule_delayed_task(token);
        }
        inner.send_bye_compound(reason);
    }
}

impl RtcpInner {
    /// The self-rescheduling report timer
    fn report_task(inner: &Arc<Mutex<Self>>, scheduler: &mut TaskScheduler) {
        let delay = {
            let mut guard = inner.lock();
            if guard.bye_sent {
                return;
            }
            guard.send_report();
            guard.next_interval()
        };
        trace!("Next RTCP report in {:?}", delay);
        let next = inner.clone();
        let token =
            scheduler.schedule_delayed_task(delay, move |s| Self::report_task(&next, s));
        inner.lock().report_task = Some(token);
    }

    /// Jittered interval from the current average size and member estimate
    fn next_interval(&self) -> Duration {
        let members = 1
            + self
                .reception
                .as_ref()
                .map(|db| db.lock().len())
                .unwrap_or(0)
            + self.transmission.len();
        let nominal = interval::nominal_interval(
            self.avg_packet_size,
            members,
            self.config.session_bandwidth_kbps,
            self.config.min_report_interval,
        );
        interval::jittered(nominal, &mut rand::thread_rng())
    }

    fn report_blocks(&mut self, now: Instant) -> Vec<RtcpReportBlock> {
        self.reception
            .as_ref()
            .map(|db| db.lock().make_report_blocks(now))
            .unwrap_or_default()
    }

    /// Build and send one SR/RR + SDES compound
    fn send_report(&mut self) {
        let now = Instant::now();
        let blocks = self.report_blocks(now);

        let mut compound = RtcpCompoundPacket::new();
        match &self.sender_state {
            Some(state) => {
                let state = state.lock();
                let (ntp, rtp_ts) = state.sender_report_times(SystemTime::now());
                let mut sr = RtcpSenderReport::new(state.ssrc);
                sr.ntp_timestamp = ntp;
                sr.rtp_timestamp = rtp_ts;
                sr.packet_count = state.packet_count;
                sr.octet_count = state.octet_count;
                sr.report_blocks = blocks;
                compound.push(RtcpPacket::SenderReport(sr));
            }
            None => {
                let mut rr = RtcpReceiverReport::new(self.ssrc);
                rr.report_blocks = blocks;
                compound.push(RtcpPacket::ReceiverReport(rr));
            }
        }
        compound.push(RtcpPacket::SourceDescription(
            RtcpSourceDescription::new_cname(self.ssrc, &self.cname),
        ));

        self.send_compound(&compound);
        self.reports_sent += 1;
    }

    fn send_bye_compound(&mut self, reason: Option<&str>) {
        let now = Instant::now();
        let blocks = self.report_blocks(now);

        let mut compound = RtcpCompoundPacket::new();
        let mut rr = RtcpReceiverReport::new(self.ssrc);
        rr.report_blocks = blocks;
        compound.push(RtcpPacket::ReceiverReport(rr));
        compound.push(RtcpPacket::SourceDescription(
            RtcpSourceDescription::new_cname(self.ssrc, &self.cname),
        ));
        let bye = match reason {
            Some(r) => RtcpGoodbye::with_reason(self.ssrc, r),
            None => RtcpGoodbye::new(self.ssrc),
        };
        compound.push(RtcpPacket::Goodbye(bye));

        debug!("Sending BYE for ssrc={:08x}", self.ssrc);
        self.send_compound(&compound);
    }

    fn send_compound(&mut self, compound: &RtcpCompoundPacket) {
        match compound.serialize() {
            Ok(bytes) => {
                self.avg_packet_size =
                    interval::update_avg_packet_size(self.avg_packet_size, bytes.len());
                if let Err(e) = self.transport.write_datagram(self.dest, &bytes) {
                    warn!("RTCP send to {} failed: {}", self.dest, e);
                }
            }
            Err(e) => warn!("Failed to serialize RTCP compound: {}", e),
        }
    }

    /// Read handler: drain every queued datagram, then fire the bye
    /// handler outside the lock so it may call back into the instance
    fn drain_incoming(inner: &Arc<Mutex<Self>>) {
        let byes = {
            let mut guard = inner.lock();
            guard.drain_transport()
        };
        if byes.is_empty() {
            return;
        }

        let handler = inner.lock().bye_handler.take();
        if let Some(mut handler) = handler {
            for ssrc in &byes {
                handler(*ssrc);
            }
            let mut guard = inner.lock();
            if guard.bye_handler.is_none() {
                guard.bye_handler = Some(handler);
            }
        }
    }

    fn drain_transport(&mut self) -> Vec<RtpSsrc> {
        let transport = self.transport.clone();
        let mut buf = [0u8; 4096];
        let mut byes = Vec::new();

        loop {
            match transport.read_datagram(&mut buf) {
                Ok(DatagramRead::Datagram { len, from }) => {
                    self.process_datagram(&buf[..len], from, Instant::now(), &mut byes);
                }
                Ok(DatagramRead::WouldBlock) | Ok(DatagramRead::Closed) => break,
                Err(e) => {
                    warn!("RTCP read failed: {}", e);
                    break;
                }
            }
        }
        byes
    }

    fn process_datagram(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
        byes: &mut Vec<RtpSsrc>,
    ) {
        let compound = match RtcpCompoundPacket::parse(data) {
            Ok(c) => c,
            Err(e) => {
                trace!("Dropping malformed RTCP datagram from {}: {}", from, e);
                return;
            }
        };
        self.avg_packet_size = interval::update_avg_packet_size(self.avg_packet_size, data.len());

        for packet in &compound.packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    trace!("SR from {:08x}: {} packets", sr.ssrc, sr.packet_count);
                    if let Some(reception) = &self.reception {
                        reception.lock().note_incoming_sr(
                            sr.ssrc,
                            sr.ntp_timestamp,
                            sr.rtp_timestamp,
                            now,
                        );
                    }
                    self.note_report_blocks(sr.ssrc, &sr.report_blocks, from, now);
                }
                RtcpPacket::ReceiverReport(rr) => {
                    self.note_report_blocks(rr.ssrc, &rr.report_blocks, from, now);
                }
                RtcpPacket::SourceDescription(sdes) => {
                    trace!("SDES with {} chunk(s)", sdes.chunks.len());
                }
                RtcpPacket::Goodbye(bye) => {
                    for &ssrc in &bye.sources {
                        debug!(
                            "BYE from {:08x}{}",
                            ssrc,
                            bye.reason
                                .as_deref()
                                .map(|r| format!(" ({})", r))
                                .unwrap_or_default()
                        );
                        if let Some(reception) = &self.reception {
                            reception.lock().remove_source(ssrc);
                        }
                        self.transmission.remove_receiver(ssrc);
                        byes.push(ssrc);
                    }
                }
            }
        }
    }

    /// Fold report blocks that describe our stream into the transmission
    /// statistics
    fn note_report_blocks(
        &mut self,
        reporter_ssrc: RtpSsrc,
        blocks: &[RtcpReportBlock],
        from: SocketAddr,
        now: Instant,
    ) {
        let now_mid32 = NtpTimestamp::now().to_middle_u32();
        for block in blocks {
            if block.ssrc == self.ssrc {
                self.transmission
                    .note_incoming_report(reporter_ssrc, block, from, now_mid32, now);
            }
        }
    }
}
