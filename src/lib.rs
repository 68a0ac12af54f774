//! Real-time media transport engine
//!
//! This crate implements the substrate on which codec-specific framers and
//! signaling layers are built: a single-threaded cooperative task scheduler,
//! an RTP receive pipeline (reordering, frame reassembly, jitter-aware
//! timestamp recovery), an RTP send pipeline (packetization, fragmentation,
//! send pacing), and an RTCP engine with RFC 3550 report scheduling and the
//! reception/transmission statistics databases that drive it.
//!
//! The engine is intentionally single-threaded: "concurrency" here means
//! interleaved callbacks multiplexed through one event loop, not
//! parallelism. All waits (for a timer, for a readable socket) happen inside
//! [`scheduler::TaskScheduler::run`]; nothing else in the crate blocks.
//!
//! Codec-specific payload formats plug in through the
//! [`payload::Depacketizer`] and [`payload::PayloadPacketizer`] traits;
//! socket creation and signaling are external collaborators reached through
//! the [`transport::DatagramTransport`] boundary.

pub mod buffer;
pub mod error;
pub mod packet;
pub mod payload;
pub mod rtcp;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stats;
pub mod time;
pub mod transport;

pub use error::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// RTP synchronization source identifier
pub type RtpSsrc = u32;

/// RTP contributing source identifier
pub type RtpCsrc = u32;

/// RTP sequence number (16-bit, wraps)
pub type RtpSequenceNumber = u16;

/// RTP media timestamp (32-bit, wraps)
pub type RtpTimestamp = u32;

pub use buffer::{BufferedPacket, ReorderingPacketBuffer};
pub use packet::{RtpHeader, RtpPacket};
pub use rtcp::{RtcpConfig, RtcpInstance};
pub use scheduler::{TaskScheduler, TaskToken};
pub use sink::{FrameSource, MediaFrame, MultiFramedRtpSink, RtpSinkConfig};
pub use source::{MultiFramedRtpSource, ReceivedFrame, RtpSourceConfig, SourceEvent};
pub use transport::{DatagramTransport, UdpTransport};
