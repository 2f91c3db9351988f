//! Wire form of a shared-memory payload reference.
//!
//! ```text
//! 0        4          8        12       16
//! +--------+----------+--------+--------+
//! |protocol| segment  | chunk  |  len   |   all u32, little-endian
//! +--------+----------+--------+--------+
//! ```

use bytes::{Buf, BufMut};

use crate::error::ShmError;
use crate::types::{ChunkDescriptor, ProtocolId, SegmentKey};

/// Everything a receiver needs to resolve a payload: the protocol, the chunk
/// and how many of its bytes are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmDescriptor {
    pub protocol: ProtocolId,
    pub chunk: ChunkDescriptor,
    pub len: u32,
}

impl ShmDescriptor {
    pub const ENCODED_LEN: usize = 16;

    pub const fn new(protocol: ProtocolId, chunk: ChunkDescriptor, len: u32) -> Self {
        Self {
            protocol,
            chunk,
            len,
        }
    }

    #[inline]
    pub fn segment_key(&self) -> SegmentKey {
        SegmentKey::new(self.protocol, self.chunk.segment)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.protocol);
        buf.put_u32_le(self.chunk.segment);
        buf.put_u32_le(self.chunk.chunk);
        buf.put_u32_le(self.len);
    }

    /// Decode from the front of `buf`, advancing it by [`Self::ENCODED_LEN`].
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ShmError> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(ShmError::Truncated {
                needed: Self::ENCODED_LEN,
                available: buf.remaining(),
            });
        }
        let protocol = buf.get_u32_le();
        let segment = buf.get_u32_le();
        let chunk = buf.get_u32_le();
        let len = buf.get_u32_le();
        Ok(Self::new(protocol, ChunkDescriptor::new(segment, chunk), len))
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        self.encode(&mut &mut out[..]);
        out
    }
}
