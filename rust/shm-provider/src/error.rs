use std::fmt;
use std::io;

use crate::types::{ChunkDescriptor, ChunkId, ProtocolId, SegmentId};

/// Coarse classification shared by every error in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A size or chunk id is outside what the backend/segment supports.
    ConstraintViolation,
    /// No free capacity (`OUT_OF_MEMORY`).
    ResourceExhausted,
    /// Capacity exists but is fragmented; defragment and retry once.
    RecoverableFragmentation,
    /// The OS resource behind a segment could not be created, opened or mapped.
    ResourceUnavailable,
    /// The request names a segment, chunk or protocol this side does not own.
    ProtocolMismatch,
    /// Two backends or two clients registered for one protocol id.
    DuplicateRegistration,
}

/// Outcome code of an allocation attempt.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocResult {
    Ok = 0,
    NeedDefragment = 1,
    OutOfMemory = 2,
    OtherError = 3,
}

impl AllocResult {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(AllocResult::Ok),
            1 => Some(AllocResult::NeedDefragment),
            2 => Some(AllocResult::OutOfMemory),
            3 => Some(AllocResult::OtherError),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Why `alloc()` did not return a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Capacity exists but not in one piece; call `defragment()` and retry once.
    NeedDefragment,
    OutOfMemory,
    ZeroLength,
    /// `len` exceeds the backend's maximum chunk size.
    TooLarge { len: usize, max: usize },
    /// The backend could not create its segment.
    SegmentUnavailable(String),
    /// `teardown()` already released the backend's resources.
    TornDown,
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::NeedDefragment => ErrorKind::RecoverableFragmentation,
            AllocError::OutOfMemory => ErrorKind::ResourceExhausted,
            AllocError::ZeroLength | AllocError::TooLarge { .. } => ErrorKind::ConstraintViolation,
            AllocError::SegmentUnavailable(_) | AllocError::TornDown => {
                ErrorKind::ResourceUnavailable
            }
        }
    }

    /// The numeric outcome this error corresponds to.
    pub fn result(&self) -> AllocResult {
        match self {
            AllocError::NeedDefragment => AllocResult::NeedDefragment,
            AllocError::OutOfMemory => AllocResult::OutOfMemory,
            _ => AllocResult::OtherError,
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::NeedDefragment => write!(f, "allocation needs defragmentation"),
            AllocError::OutOfMemory => write!(f, "out of shared memory"),
            AllocError::ZeroLength => write!(f, "zero-length allocation"),
            AllocError::TooLarge { len, max } => {
                write!(f, "allocation of {len} bytes exceeds maximum chunk size {max}")
            }
            AllocError::SegmentUnavailable(e) => write!(f, "segment unavailable: {e}"),
            AllocError::TornDown => write!(f, "backend has been torn down"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Why `free()` refused a descriptor. Allocator state is unchanged in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// The descriptor names a segment this backend does not own.
    ForeignSegment {
        descriptor: ChunkDescriptor,
        owned: Option<SegmentId>,
    },
    /// The chunk id cannot exist in the segment's layout.
    InvalidChunk(ChunkDescriptor),
    /// The chunk is not currently allocated (double free).
    NotAllocated(ChunkDescriptor),
    /// A buffer allocated under another protocol.
    ForeignProtocol {
        protocol: ProtocolId,
        expected: ProtocolId,
        descriptor: ChunkDescriptor,
    },
    TornDown,
}

impl FreeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FreeError::InvalidChunk(_) => ErrorKind::ConstraintViolation,
            FreeError::TornDown => ErrorKind::ResourceUnavailable,
            FreeError::ForeignSegment { .. }
            | FreeError::NotAllocated(_)
            | FreeError::ForeignProtocol { .. } => ErrorKind::ProtocolMismatch,
        }
    }
}

impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeError::ForeignSegment {
                descriptor,
                owned: Some(owned),
            } => write!(f, "chunk {descriptor} does not belong to segment {owned}"),
            FreeError::ForeignSegment {
                descriptor,
                owned: None,
            } => write!(f, "chunk {descriptor} freed before any segment was created"),
            FreeError::InvalidChunk(d) => write!(f, "chunk {d} is outside the segment layout"),
            FreeError::NotAllocated(d) => write!(f, "chunk {d} is not allocated"),
            FreeError::ForeignProtocol {
                protocol,
                expected,
                descriptor,
            } => write!(
                f,
                "chunk {descriptor} belongs to protocol {protocol}, not {expected}"
            ),
            FreeError::TornDown => write!(f, "backend has been torn down"),
        }
    }
}

impl std::error::Error for FreeError {}

/// Errors from registry construction, attachment and chunk resolution.
#[derive(Debug)]
pub enum ShmError {
    /// Second backend for a protocol id.
    DuplicateBackend(ProtocolId),
    /// Second client for a protocol id.
    DuplicateClient(ProtocolId),
    /// No backend registered for this protocol id.
    NoBackend(ProtocolId),
    /// No client registered for this protocol id.
    NoClient(ProtocolId),
    /// Opening, sizing or mapping the named OS object failed.
    Unavailable { name: String, source: io::Error },
    /// The segment exists but its contents do not match the protocol's layout.
    Layout { name: String, reason: String },
    /// Chunk id outside the segment layout.
    ChunkOutOfRange { segment: SegmentId, chunk: ChunkId },
    /// The chunk id is in range but no chunk is allocated there.
    ChunkNotLive { segment: SegmentId, chunk: ChunkId },
    /// Payload length exceeds the chunk it is supposed to live in.
    LengthOutOfRange { len: usize, capacity: usize },
    /// A pushed chunk is not recognized by the protocol's backend.
    ForeignChunk {
        protocol: ProtocolId,
        descriptor: ChunkDescriptor,
    },
    /// A wire descriptor could not be decoded.
    Truncated { needed: usize, available: usize },
    InvalidConfig(String),
    Alloc(AllocError),
    Free(FreeError),
    /// A blocking attach task did not complete.
    Join(String),
}

impl ShmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShmError::DuplicateBackend(_) | ShmError::DuplicateClient(_) => {
                ErrorKind::DuplicateRegistration
            }
            ShmError::NoBackend(_)
            | ShmError::NoClient(_)
            | ShmError::Layout { .. }
            | ShmError::ChunkNotLive { .. }
            | ShmError::ForeignChunk { .. } => ErrorKind::ProtocolMismatch,
            ShmError::Unavailable { .. } | ShmError::Join(_) => ErrorKind::ResourceUnavailable,
            ShmError::ChunkOutOfRange { .. }
            | ShmError::LengthOutOfRange { .. }
            | ShmError::Truncated { .. }
            | ShmError::InvalidConfig(_) => ErrorKind::ConstraintViolation,
            ShmError::Alloc(e) => e.kind(),
            ShmError::Free(e) => e.kind(),
        }
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateBackend(id) => write!(f, "duplicate backend for protocol {id}"),
            Self::DuplicateClient(id) => write!(f, "duplicate client for protocol {id}"),
            Self::NoBackend(id) => write!(f, "no backend registered for protocol {id}"),
            Self::NoClient(id) => write!(f, "no client registered for protocol {id}"),
            Self::Unavailable { name, source } => {
                write!(f, "shared memory object {name:?} unavailable: {source}")
            }
            Self::Layout { name, reason } => write!(f, "segment {name:?}: {reason}"),
            Self::ChunkOutOfRange { segment, chunk } => {
                write!(f, "chunk {chunk} out of range for segment {segment}")
            }
            Self::ChunkNotLive { segment, chunk } => {
                write!(f, "chunk {chunk} of segment {segment} is not allocated")
            }
            Self::LengthOutOfRange { len, capacity } => {
                write!(f, "length {len} exceeds chunk capacity {capacity}")
            }
            Self::ForeignChunk {
                protocol,
                descriptor,
            } => write!(f, "chunk {descriptor} not recognized by protocol {protocol}"),
            Self::Truncated { needed, available } => {
                write!(f, "descriptor needs {needed} bytes, got {available}")
            }
            Self::InvalidConfig(e) => write!(f, "invalid config: {e}"),
            Self::Alloc(e) => write!(f, "{e}"),
            Self::Free(e) => write!(f, "{e}"),
            Self::Join(e) => write!(f, "attach task failed: {e}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unavailable { source, .. } => Some(source),
            Self::Alloc(e) => Some(e),
            Self::Free(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AllocError> for ShmError {
    fn from(e: AllocError) -> Self {
        ShmError::Alloc(e)
    }
}

impl From<FreeError> for ShmError {
    fn from(e: FreeError) -> Self {
        ShmError::Free(e)
    }
}
