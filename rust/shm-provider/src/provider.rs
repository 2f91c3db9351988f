//! The handle application code allocates and resolves through.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::client::ShmSegment;
use crate::context::ShmContext;
use crate::descriptor::ShmDescriptor;
use crate::error::{AllocError, FreeError, ShmError};
use crate::registry::BackendHandle;
use crate::types::{ChunkDescriptor, ProtocolId};

/// One protocol's local backend plus the session's remote-segment cache.
///
/// Obtained from [`ShmContext::provider_for`]. Cheap to copy; every call
/// locks the backend for its duration only.
#[derive(Clone, Copy)]
pub struct ShmProvider<'a> {
    context: &'a ShmContext,
    backend: BackendHandle<'a>,
}

impl<'a> ShmProvider<'a> {
    pub(crate) fn new(context: &'a ShmContext, backend: BackendHandle<'a>) -> Self {
        Self { context, backend }
    }

    #[inline]
    pub fn protocol(&self) -> ProtocolId {
        self.backend.protocol()
    }

    /// Allocate a buffer whose payload length starts at `len`.
    pub fn alloc(&self, len: usize) -> Result<ShmBuf<'a>, AllocError> {
        check_wire_len(len)?;
        let chunk = self.backend.lock().alloc(len)?;
        Ok(ShmBuf::new(self.protocol(), chunk.descriptor, chunk.data, chunk.len, len))
    }

    /// [`alloc`](Self::alloc), and on [`AllocError::NeedDefragment`] run
    /// [`defragment`](Self::defragment) and retry exactly once.
    ///
    /// The backend stays locked across both attempts.
    pub fn alloc_defragmenting(&self, len: usize) -> Result<ShmBuf<'a>, AllocError> {
        check_wire_len(len)?;
        let mut backend = self.backend.lock();
        let chunk = match backend.alloc(len) {
            Err(AllocError::NeedDefragment) => {
                let largest = backend.defragment();
                debug!(protocol = self.protocol(), len, largest, "defragmented, retrying alloc");
                backend.alloc(len)?
            }
            other => other?,
        };
        Ok(ShmBuf::new(self.protocol(), chunk.descriptor, chunk.data, chunk.len, len))
    }

    /// Returns the largest chunk size allocatable afterwards.
    pub fn defragment(&self) -> usize {
        self.backend.lock().defragment()
    }

    pub fn available(&self) -> usize {
        self.backend.lock().available()
    }

    pub fn max_chunk_size(&self) -> usize {
        self.backend.lock().max_chunk_size()
    }

    /// Return a buffer's chunk once every consumer is done with it.
    ///
    /// Takes the buffer, so nothing in this process can write the chunk after
    /// it is handed out again.
    ///
    /// ```compile_fail
    /// # use shm_provider::posix::{POSIX_SLOT_PROTOCOL_ID, PosixSlotBackend};
    /// # use shm_provider::{ShmContext, ShmRegistryBuilder, SlotBackendConfig};
    /// # let mut builder = ShmRegistryBuilder::new();
    /// # builder
    /// #     .add_backend(POSIX_SLOT_PROTOCOL_ID, PosixSlotBackend::new(SlotBackendConfig::default()).unwrap())
    /// #     .unwrap();
    /// # let context = ShmContext::new(builder.build());
    /// let provider = context.provider_for(POSIX_SLOT_PROTOCOL_ID).unwrap();
    /// let mut buf = provider.alloc(4).unwrap();
    /// provider.free(buf).unwrap();
    /// buf.write_payload(b"late").unwrap();
    /// ```
    pub fn free(&self, buf: ShmBuf<'a>) -> Result<(), FreeError> {
        let expected = self.protocol();
        if buf.protocol != expected {
            return Err(FreeError::ForeignProtocol {
                protocol: buf.protocol,
                expected,
                descriptor: buf.chunk,
            });
        }
        self.backend.lock().free(&buf.chunk)
    }

    /// Return a chunk known only by its descriptor, for instance one a
    /// consumer acknowledged after its [`ShmBuf`] was dropped.
    ///
    /// # Safety
    ///
    /// No [`ShmBuf`] for `chunk` may still be alive in this process. The
    /// descriptor carries no allocation generation: a stale one whose chunk id
    /// was handed out again releases the new occupant.
    pub unsafe fn free_chunk(&self, chunk: &ChunkDescriptor) -> Result<(), FreeError> {
        self.backend.lock().free(chunk)
    }

    /// Resolve a chunk of this protocol, local or remote.
    pub fn map(&self, chunk: &ChunkDescriptor) -> Result<ShmSlice, ShmError> {
        self.context.map_chunk(self.protocol(), chunk)
    }

    /// Wrap a chunk filled by an external producer (a driver's buffer pool,
    /// say) so it can be published like an allocated one.
    ///
    /// The backend must recognize the chunk. The local pointer comes from the
    /// backend's own mapping when it has one, else from this protocol's
    /// client.
    pub fn map_external(&self, chunk: ChunkDescriptor, len: usize) -> Result<ShmBuf<'a>, ShmError> {
        let protocol = self.protocol();
        if !self.backend.lock().recognizes(&chunk) {
            return Err(ShmError::ForeignChunk {
                protocol,
                descriptor: chunk,
            });
        }
        check_wire_len(len)?;
        let (segment, ptr) = self.context.resolve(protocol, &chunk)?;
        if len > ptr.len {
            return Err(ShmError::LengthOutOfRange {
                len,
                capacity: ptr.len,
            });
        }
        trace!(protocol, %chunk, len, "mapped external chunk");
        let mut buf = ShmBuf::new(protocol, chunk, ptr.data, ptr.len, len);
        buf.segment = Some(segment);
        Ok(buf)
    }
}

impl fmt::Debug for ShmProvider<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmProvider")
            .field("protocol", &self.protocol())
            .finish_non_exhaustive()
    }
}

fn check_wire_len(len: usize) -> Result<(), AllocError> {
    if len > u32::MAX as usize {
        return Err(AllocError::TooLarge {
            len,
            max: u32::MAX as usize,
        });
    }
    Ok(())
}

/// A writable chunk in the producing process.
///
/// Borrows the [`ShmContext`] it came from, so the backend cannot be torn
/// down while the buffer is alive. Dropping the buffer does *not* free the
/// chunk: consumers may still be reading it. Hand it to [`ShmProvider::free`]
/// when they are done.
pub struct ShmBuf<'a> {
    protocol: ProtocolId,
    chunk: ChunkDescriptor,
    data: NonNull<u8>,
    capacity: usize,
    len: usize,
    /// Keeps the mapping of an externally produced chunk alive.
    segment: Option<Arc<dyn ShmSegment>>,
    _context: PhantomData<&'a ShmContext>,
}

// SAFETY: the chunk is disjoint from every other live chunk of its backend.
unsafe impl Send for ShmBuf<'_> {}
unsafe impl Sync for ShmBuf<'_> {}

impl<'a> ShmBuf<'a> {
    fn new(
        protocol: ProtocolId,
        chunk: ChunkDescriptor,
        data: NonNull<u8>,
        capacity: usize,
        len: usize,
    ) -> Self {
        Self {
            protocol,
            chunk,
            data,
            capacity,
            len: len.min(capacity),
            segment: None,
            _context: PhantomData,
        }
    }

    #[inline]
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    #[inline]
    pub fn chunk(&self) -> ChunkDescriptor {
        self.chunk
    }

    /// Payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable bytes in the chunk (at least the requested length).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set the payload length published with [`descriptor`](Self::descriptor).
    pub fn set_len(&mut self, len: usize) -> Result<(), ShmError> {
        if len > self.capacity || len > u32::MAX as usize {
            return Err(ShmError::LengthOutOfRange {
                len,
                capacity: self.capacity.min(u32::MAX as usize),
            });
        }
        self.len = len;
        Ok(())
    }

    /// Copy `src` to the start of the chunk and make it the payload.
    pub fn write_payload(&mut self, src: &[u8]) -> Result<(), ShmError> {
        self.set_len(src.len())?;
        self.as_mut_slice().copy_from_slice(src);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: len <= capacity and the chunk is mapped while 'a lives.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; the chunk belongs to this buffer alone.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    /// What a receiver needs to resolve this payload.
    pub fn descriptor(&self) -> ShmDescriptor {
        ShmDescriptor::new(self.protocol, self.chunk, self.len as u32)
    }
}

impl Deref for ShmBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for ShmBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for ShmBuf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBuf")
            .field("protocol", &self.protocol)
            .field("chunk", &self.chunk)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A resolved payload in the consuming process.
///
/// Holds its segment, so the mapping outlives cache eviction and session
/// teardown for as long as the slice exists.
#[derive(Clone)]
pub struct ShmSlice {
    segment: Arc<dyn ShmSegment>,
    data: NonNull<u8>,
    len: usize,
}

// SAFETY: the slice only reads shared memory kept mapped by `segment`.
unsafe impl Send for ShmSlice {}
unsafe impl Sync for ShmSlice {}

impl ShmSlice {
    pub(crate) fn new(segment: Arc<dyn ShmSegment>, data: NonNull<u8>, len: usize) -> Self {
        Self { segment, data, len }
    }

    pub fn segment(&self) -> &Arc<dyn ShmSegment> {
        &self.segment
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for ShmSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the segment bounds-checked data..data+len and stays mapped
        // while we hold it.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for ShmSlice {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for ShmSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmSlice")
            .field("segment", &self.segment.id())
            .field("len", &self.len)
            .finish()
    }
}
