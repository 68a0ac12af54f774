//! RTP and RTCP wire formats
//!
//! Bit-exact RFC 3550 packet layouts: the RTP fixed header (§5.1) with
//! optional CSRC list, header extension and trailing padding, and the RTCP
//! SR/RR/SDES/BYE packet family (§6.4–6.6). All parsing goes through
//! bounded `bytes` cursors with typed errors; no pointer reinterpretation.

pub mod header;
pub mod rtcp;
pub mod rtp;

pub use header::{RtpHeader, RTP_MIN_HEADER_SIZE, RTP_VERSION};
pub use rtp::RtpPacket;
