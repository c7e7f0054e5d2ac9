//! Length-prefixed framing for envelopes on a reliable stream, and the
//! JSON datagram form of discovery announcements.

use crate::{
    envelope::Envelope, error::CodecError, messages::DiscoveryPacket,
};

/// Size of the big-endian length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest discovery datagram that will be parsed
pub const MAX_DISCOVERY_PACKET_SIZE: usize = 2048;

/// Serializes an envelope and prefixes it with its length
pub fn encode_frame(envelope: &Envelope, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    let body = envelope.to_json()?;
    if body.len() > max_frame_size || body.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads a frame's length prefix, refusing lengths over `max_frame_size`
/// before any body bytes are buffered
pub fn frame_length(
    header: [u8; FRAME_HEADER_SIZE],
    max_frame_size: usize,
) -> Result<usize, CodecError> {
    let size = u32::from_be_bytes(header) as usize;
    if size > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }
    Ok(size)
}

/// Decodes a frame body into an envelope. Signature is not checked here.
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, CodecError> {
    Envelope::from_json(body)
}

/// Splits a buffered byte stream into frame bodies.
///
/// Useful where bytes arrive in arbitrary chunks rather than through an
/// async reader that can read exact lengths.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete frame body, `Ok(None)` if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
        let size = frame_length(header, self.max_frame_size)?;

        if self.buffer.len() < FRAME_HEADER_SIZE + size {
            return Ok(None);
        }
        let body = self.buffer[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + size].to_vec();
        self.buffer.drain(..FRAME_HEADER_SIZE + size);
        Ok(Some(body))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

pub fn encode_discovery(packet: &DiscoveryPacket) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(packet).map_err(|e| CodecError::malformed("discovery packet", e))
}

pub fn decode_discovery(bytes: &[u8]) -> Result<DiscoveryPacket, CodecError> {
    if bytes.len() > MAX_DISCOVERY_PACKET_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_DISCOVERY_PACKET_SIZE,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| CodecError::malformed("discovery packet", e))
}
