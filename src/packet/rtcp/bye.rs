use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP Goodbye (BYE) packet, RFC 3550 Section 6.6
///
/// Sent immediately when the local session ends; its arrival from a peer is
/// surfaced through the RTCP instance's bye handler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpGoodbye {
    /// SSRC/CSRC identifiers leaving the session
    pub sources: Vec<RtpSsrc>,

    /// Optional reason for leaving
    pub reason: Option<String>,
}

impl RtcpGoodbye {
    /// Create a BYE for a single source
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    /// Create a BYE for a single source with a reason
    pub fn with_reason(ssrc: RtpSsrc, reason: impl Into<String>) -> Self {
        Self {
            sources: vec![ssrc],
            reason: Some(reason.into()),
        }
    }

    /// Serialized body size (excluding the common RTCP header)
    pub fn size(&self) -> usize {
        let mut size = self.sources.len() * 4;
        if let Some(reason) = &self.reason {
            let len = 1 + reason.len().min(255);
            size += (len + 3) & !3; // length byte + text, padded to a word
        }
        size
    }

    /// Parse a BYE body; `count` is the SC field from the common header
    pub fn parse(buf: &mut impl Buf, count: u8) -> Result<Self> {
        let mut sources = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            sources.push(buf.get_u32());
        }

        let reason = if buf.has_remaining() {
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(Error::BufferTooSmall {
                    required: len,
                    available: buf.remaining(),
                });
            }
            let mut text = vec![0u8; len];
            buf.copy_to_slice(&mut text);

            // Skip padding to the word boundary
            let padding = (4 - ((1 + len) % 4)) % 4;
            for _ in 0..padding {
                if buf.has_remaining() {
                    buf.advance(1);
                }
            }
            Some(String::from_utf8_lossy(&text).to_string())
        } else {
            None
        };

        Ok(Self { sources, reason })
    }

    /// Serialize the BYE body
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(self.size());
        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }
        if let Some(reason) = &self.reason {
            let len = reason.len().min(255);
            buf.put_u8(len as u8);
            buf.put_slice(&reason.as_bytes()[..len]);
            let padding = (4 - ((1 + len) % 4)) % 4;
            for _ in 0..padding {
                buf.put_u8(0);
            }
        }
    }
}
