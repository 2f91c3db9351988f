//! Registry construction and routing.

mod common;

use std::path::Path;
use std::sync::Arc;

use shm_provider::posix::{
    POSIX_HEAP_PROTOCOL_ID, POSIX_SLOT_PROTOCOL_ID, PosixHeapBackend, PosixHeapClient,
    PosixSlotBackend, PosixSlotClient,
};
use shm_provider::{
    ErrorKind, HeapBackendConfig, ProtocolId, ShmClient, ShmContext, ShmError,
    ShmProviderBackend, ShmRegistry, ShmRegistryBuilder, SlotBackendConfig,
};

fn slot_backend(prefix: &str) -> Box<dyn ShmProviderBackend> {
    Box::new(
        PosixSlotBackend::new(SlotBackendConfig {
            name_prefix: prefix.to_string(),
            ..SlotBackendConfig::default()
        })
        .unwrap(),
    )
}

/// Names under /dev/shm starting with `prefix` (Linux only; empty elsewhere).
fn objects_with_prefix(prefix: &str) -> Vec<String> {
    let Ok(dir) = std::fs::read_dir(Path::new("/dev/shm")) else {
        return Vec::new();
    };
    dir.filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(prefix))
        .collect()
}

#[test]
fn duplicate_backend_fails_before_any_segment_exists() {
    common::init_tracing();
    let prefix = common::unique_prefix("dup");

    let backends = vec![
        (POSIX_SLOT_PROTOCOL_ID, slot_backend(&prefix)),
        (POSIX_SLOT_PROTOCOL_ID, slot_backend(&prefix)),
    ];
    let err = ShmRegistry::build(backends, vec![]).unwrap_err();
    assert!(matches!(err, ShmError::DuplicateBackend(POSIX_SLOT_PROTOCOL_ID)));
    assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
    assert!(objects_with_prefix(&prefix).is_empty());
}

#[test]
fn duplicate_client_is_rejected() {
    common::init_tracing();
    let slot: Arc<dyn ShmClient> = Arc::new(PosixSlotClient::default());
    let heap: Arc<dyn ShmClient> = Arc::new(PosixHeapClient::default());
    let clients: Vec<(ProtocolId, Arc<dyn ShmClient>)> =
        vec![(7, slot.clone()), (8, slot), (7, heap)];
    let err = ShmRegistry::build(vec![], clients).unwrap_err();
    assert!(matches!(err, ShmError::DuplicateClient(7)));
}

#[test]
fn same_id_for_backend_and_client_is_fine() {
    common::init_tracing();
    let prefix = common::unique_prefix("pair");
    let registry = ShmRegistry::build(
        vec![(POSIX_SLOT_PROTOCOL_ID, slot_backend(&prefix))],
        vec![(
            POSIX_SLOT_PROTOCOL_ID,
            Arc::new(PosixSlotClient::new(prefix)) as Arc<dyn ShmClient>,
        )],
    )
    .unwrap();
    assert!(registry.has_backend(POSIX_SLOT_PROTOCOL_ID));
    assert!(registry.has_client(POSIX_SLOT_PROTOCOL_ID));
}

#[test]
fn producer_only_and_consumer_only_processes() {
    common::init_tracing();
    let prefix = common::unique_prefix("asym");

    let mut producer = ShmRegistryBuilder::new();
    producer
        .add_backend(
            POSIX_HEAP_PROTOCOL_ID,
            PosixHeapBackend::new(HeapBackendConfig {
                size: 4096,
                name_prefix: prefix.clone(),
                ..HeapBackendConfig::default()
            })
            .unwrap(),
        )
        .unwrap();
    let producer = ShmContext::new(producer.build());

    let mut consumer = ShmRegistryBuilder::new();
    consumer
        .add_client(POSIX_HEAP_PROTOCOL_ID, PosixHeapClient::new(prefix))
        .unwrap();
    let consumer = ShmContext::new(consumer.build());

    assert!(consumer.provider_for(POSIX_HEAP_PROTOCOL_ID).is_none());
    let provider = producer.provider_for(POSIX_HEAP_PROTOCOL_ID).unwrap();
    let mut buf = provider.alloc(11).unwrap();
    buf.write_payload(b"hello world").unwrap();
    let descriptor = buf.descriptor();

    // No client, but the producer resolves its own segment.
    assert_eq!(&producer.map(&descriptor).unwrap()[..], b"hello world");
    assert_eq!(&consumer.map(&descriptor).unwrap()[..], b"hello world");

    provider.free(buf).unwrap();
    consumer.teardown().unwrap();
    producer.teardown().unwrap();
}

#[test]
fn protocols_lists_every_role() {
    let mut builder = ShmRegistryBuilder::new();
    builder
        .add_client(POSIX_SLOT_PROTOCOL_ID, PosixSlotClient::default())
        .unwrap()
        .add_client(POSIX_HEAP_PROTOCOL_ID, PosixHeapClient::default())
        .unwrap();
    let registry = builder.build();
    let mut ids: Vec<_> = registry.protocols().collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![POSIX_SLOT_PROTOCOL_ID, POSIX_HEAP_PROTOCOL_ID]);
}

#[test]
fn producer_only_context_maps_and_republishes_its_chunks() {
    common::init_tracing();
    let prefix = common::unique_prefix("solo");
    let mut builder = ShmRegistryBuilder::new();
    builder
        .add_boxed_backend(POSIX_SLOT_PROTOCOL_ID, slot_backend(&prefix))
        .unwrap();
    let ctx = ShmContext::new(builder.build());
    assert!(ctx.client_for(POSIX_SLOT_PROTOCOL_ID).is_none());
    let provider = ctx.provider_for(POSIX_SLOT_PROTOCOL_ID).unwrap();

    let mut buf = provider.alloc(5).unwrap();
    buf.write_payload(b"local").unwrap();
    assert_eq!(&ctx.map(&buf.descriptor()).unwrap()[..], b"local");
    assert_eq!(&provider.map(&buf.chunk()).unwrap()[..5], b"local");

    let wrapped = provider.map_external(buf.chunk(), 5).unwrap();
    assert_eq!(&wrapped[..], b"local");
    assert_eq!(wrapped.descriptor(), buf.descriptor());
    drop(wrapped);

    provider.free(buf).unwrap();
    ctx.teardown().unwrap();
    assert!(objects_with_prefix(&prefix).is_empty());
}
