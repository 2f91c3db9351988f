//! Protocol id → (backend, client) lookup.
//!
//! A process registers at most one backend and at most one client per
//! protocol id. Either side may be missing: a pure publisher needs no
//! clients, a pure subscriber no backends.
//!
//! ```rust
//! use shm_provider::posix::{PosixSlotBackend, PosixSlotClient, POSIX_SLOT_PROTOCOL_ID};
//! use shm_provider::{ShmRegistryBuilder, SlotBackendConfig};
//!
//! let mut builder = ShmRegistryBuilder::new();
//! builder
//!     .add_backend(
//!         POSIX_SLOT_PROTOCOL_ID,
//!         PosixSlotBackend::new(SlotBackendConfig::default()).unwrap(),
//!     )
//!     .unwrap();
//! builder
//!     .add_client(POSIX_SLOT_PROTOCOL_ID, PosixSlotClient::default())
//!     .unwrap();
//! let registry = builder.build();
//! assert!(registry.has_backend(POSIX_SLOT_PROTOCOL_ID));
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::backend::ShmProviderBackend;
use crate::client::ShmClient;
use crate::error::ShmError;
use crate::types::ProtocolId;

type SharedBackend = Mutex<Box<dyn ShmProviderBackend>>;

#[derive(Default)]
struct ProtocolEntry {
    backend: Option<SharedBackend>,
    client: Option<Arc<dyn ShmClient>>,
}

/// Builder that rejects a second backend or client for the same protocol.
#[derive(Default)]
pub struct ShmRegistryBuilder {
    entries: HashMap<ProtocolId, ProtocolEntry>,
}

impl ShmRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the allocator for `protocol`.
    ///
    /// # Errors
    ///
    /// [`ShmError::DuplicateBackend`] if `protocol` already has one. The
    /// rejected backend is dropped.
    pub fn add_backend(
        &mut self,
        protocol: ProtocolId,
        backend: impl ShmProviderBackend + 'static,
    ) -> Result<&mut Self, ShmError> {
        self.add_boxed_backend(protocol, Box::new(backend))
    }

    pub fn add_boxed_backend(
        &mut self,
        protocol: ProtocolId,
        backend: Box<dyn ShmProviderBackend>,
    ) -> Result<&mut Self, ShmError> {
        let entry = self.entries.entry(protocol).or_default();
        if entry.backend.is_some() {
            return Err(ShmError::DuplicateBackend(protocol));
        }
        entry.backend = Some(Mutex::new(backend));
        Ok(self)
    }

    /// Register the attachment logic for `protocol`.
    ///
    /// # Errors
    ///
    /// [`ShmError::DuplicateClient`] if `protocol` already has one.
    pub fn add_client(
        &mut self,
        protocol: ProtocolId,
        client: impl ShmClient + 'static,
    ) -> Result<&mut Self, ShmError> {
        self.add_shared_client(protocol, Arc::new(client))
    }

    pub fn add_shared_client(
        &mut self,
        protocol: ProtocolId,
        client: Arc<dyn ShmClient>,
    ) -> Result<&mut Self, ShmError> {
        let entry = self.entries.entry(protocol).or_default();
        if entry.client.is_some() {
            return Err(ShmError::DuplicateClient(protocol));
        }
        entry.client = Some(client);
        Ok(self)
    }

    pub fn build(self) -> ShmRegistry {
        let registry = ShmRegistry {
            entries: self.entries,
        };
        debug!(
            protocols = registry.entries.len(),
            backends = registry.backend_count(),
            clients = registry.client_count(),
            "built shm registry"
        );
        registry
    }
}

/// Immutable routing table for allocation and resolution.
pub struct ShmRegistry {
    entries: HashMap<ProtocolId, ProtocolEntry>,
}

impl ShmRegistry {
    /// Build from explicit lists.
    ///
    /// Both lists are checked for duplicate protocol ids before anything is
    /// registered. Backends create their segments lazily, so a rejected build
    /// has no OS resources to clean up.
    pub fn build(
        backends: Vec<(ProtocolId, Box<dyn ShmProviderBackend>)>,
        clients: Vec<(ProtocolId, Arc<dyn ShmClient>)>,
    ) -> Result<Self, ShmError> {
        check_unique(backends.iter().map(|(id, _)| *id)).map_err(ShmError::DuplicateBackend)?;
        check_unique(clients.iter().map(|(id, _)| *id)).map_err(ShmError::DuplicateClient)?;

        let mut builder = ShmRegistryBuilder::new();
        for (protocol, backend) in backends {
            builder.add_boxed_backend(protocol, backend)?;
        }
        for (protocol, client) in clients {
            builder.add_shared_client(protocol, client)?;
        }
        Ok(builder.build())
    }

    /// Local allocator for `protocol`, if this process produces it.
    pub fn provider_for(&self, protocol: ProtocolId) -> Option<BackendHandle<'_>> {
        let backend = self.entries.get(&protocol)?.backend.as_ref()?;
        Some(BackendHandle { protocol, backend })
    }

    /// Attachment logic for `protocol`, if this process consumes it.
    pub fn client_for(&self, protocol: ProtocolId) -> Option<&Arc<dyn ShmClient>> {
        self.entries.get(&protocol)?.client.as_ref()
    }

    pub fn has_backend(&self, protocol: ProtocolId) -> bool {
        self.provider_for(protocol).is_some()
    }

    pub fn has_client(&self, protocol: ProtocolId) -> bool {
        self.client_for(protocol).is_some()
    }

    /// Every protocol id with a backend or a client, in no particular order.
    pub fn protocols(&self) -> impl Iterator<Item = ProtocolId> + '_ {
        self.entries.keys().copied()
    }

    fn backend_count(&self) -> usize {
        self.entries.values().filter(|e| e.backend.is_some()).count()
    }

    fn client_count(&self) -> usize {
        self.entries.values().filter(|e| e.client.is_some()).count()
    }

    /// Tear down every backend. Returns the first failure; all backends are
    /// attempted regardless.
    ///
    /// Dropping the registry tears down too, but swallows the errors.
    pub fn teardown(self) -> Result<(), ShmError> {
        let mut first_err = None;
        for (protocol, entry) in &self.entries {
            let Some(backend) = &entry.backend else {
                continue;
            };
            if let Err(e) = backend.lock().teardown() {
                warn!(protocol, error = %e, "backend teardown failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for ShmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.protocols().collect();
        protocols.sort_unstable();
        f.debug_struct("ShmRegistry")
            .field("protocols", &protocols)
            .field("backends", &self.backend_count())
            .field("clients", &self.client_count())
            .finish()
    }
}

fn check_unique(ids: impl Iterator<Item = ProtocolId>) -> Result<(), ProtocolId> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(id);
        }
    }
    Ok(())
}

/// Borrowed access to one registered backend.
#[derive(Clone, Copy)]
pub struct BackendHandle<'a> {
    protocol: ProtocolId,
    backend: &'a SharedBackend,
}

impl<'a> BackendHandle<'a> {
    #[inline]
    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// Lock the backend for exclusive use.
    pub fn lock(&self) -> MutexGuard<'a, Box<dyn ShmProviderBackend>> {
        self.backend.lock()
    }
}

impl fmt::Debug for ShmRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.entries.keys().copied().collect();
        protocols.sort_unstable();
        f.debug_struct("ShmRegistryBuilder")
            .field("protocols", &protocols)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for BackendHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ShmSegment;
    use crate::error::{AllocError, ErrorKind, FreeError};
    use crate::types::{AllocatedChunk, ChunkDescriptor, SegmentId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts teardowns; never allocates.
    struct NullBackend(Arc<AtomicUsize>);

    impl ShmProviderBackend for NullBackend {
        fn alloc(&mut self, _len: usize) -> Result<AllocatedChunk, AllocError> {
            Err(AllocError::OutOfMemory)
        }
        fn free(&mut self, chunk: &ChunkDescriptor) -> Result<(), FreeError> {
            Err(FreeError::NotAllocated(*chunk))
        }
        fn defragment(&mut self) -> usize {
            0
        }
        fn available(&self) -> usize {
            0
        }
        fn max_chunk_size(&self) -> usize {
            0
        }
        fn recognizes(&self, _chunk: &ChunkDescriptor) -> bool {
            false
        }
        fn teardown(&mut self) -> Result<(), ShmError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NullClient;

    impl ShmClient for NullClient {
        fn attach(&self, segment: SegmentId) -> Result<Arc<dyn ShmSegment>, ShmError> {
            Err(ShmError::ChunkOutOfRange { segment, chunk: 0 })
        }
    }

    fn null() -> NullBackend {
        NullBackend(Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn builder_rejects_duplicates() {
        let mut builder = ShmRegistryBuilder::new();
        builder.add_backend(1, null()).unwrap();
        let err = builder.add_backend(1, null()).unwrap_err();
        assert!(matches!(err, ShmError::DuplicateBackend(1)));
        assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);

        builder.add_client(1, NullClient).unwrap();
        assert!(matches!(
            builder.add_client(1, NullClient),
            Err(ShmError::DuplicateClient(1))
        ));
    }

    #[test]
    fn build_checks_both_lists() {
        let backends: Vec<(ProtocolId, Box<dyn ShmProviderBackend>)> = vec![
            (3, Box::new(null()) as Box<dyn ShmProviderBackend>),
            (3, Box::new(null()) as Box<dyn ShmProviderBackend>),
        ];
        assert!(matches!(
            ShmRegistry::build(backends, vec![]),
            Err(ShmError::DuplicateBackend(3))
        ));

        let client: Arc<dyn ShmClient> = Arc::new(NullClient);
        let clients = vec![(4, client.clone()), (4, client)];
        assert!(matches!(
            ShmRegistry::build(vec![], clients),
            Err(ShmError::DuplicateClient(4))
        ));
    }

    #[test]
    fn asymmetric_lookups() {
        let registry = ShmRegistry::build(
            vec![(1, Box::new(null()) as Box<dyn ShmProviderBackend>)],
            vec![(2, Arc::new(NullClient) as Arc<dyn ShmClient>)],
        )
        .unwrap();

        assert!(registry.has_backend(1));
        assert!(!registry.has_client(1));
        assert!(registry.has_client(2));
        assert!(!registry.has_backend(2));
        assert!(registry.provider_for(9).is_none());
        assert!(registry.client_for(9).is_none());

        let mut protocols: Vec<_> = registry.protocols().collect();
        protocols.sort_unstable();
        assert_eq!(protocols, vec![1, 2]);
        assert_eq!(registry.provider_for(1).unwrap().protocol(), 1);
    }

    #[test]
    fn teardown_reaches_every_backend() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut builder = ShmRegistryBuilder::new();
        builder
            .add_backend(1, NullBackend(count.clone()))
            .unwrap()
            .add_backend(2, NullBackend(count.clone()))
            .unwrap();
        let registry = builder.build();
        registry.teardown().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
