#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};

use shm_provider::posix::{
    POSIX_HEAP_PROTOCOL_ID, POSIX_SLOT_PROTOCOL_ID, PosixHeapBackend, PosixHeapClient,
    PosixSlotBackend, PosixSlotClient,
};
use shm_provider::{HeapBackendConfig, ShmContext, ShmRegistryBuilder, SlotBackendConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Object-name prefix no other test (or test process) uses.
pub fn unique_prefix(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "it-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Producer and consumer for the slot protocol in one context.
pub fn slot_context(slot_count: u32, slot_size: u32) -> ShmContext {
    let prefix = unique_prefix("slot");
    let backend = PosixSlotBackend::new(SlotBackendConfig {
        slot_count,
        slot_size,
        name_prefix: prefix.clone(),
    })
    .unwrap();
    let mut builder = ShmRegistryBuilder::new();
    builder
        .add_backend(POSIX_SLOT_PROTOCOL_ID, backend)
        .unwrap()
        .add_client(POSIX_SLOT_PROTOCOL_ID, PosixSlotClient::new(prefix))
        .unwrap();
    ShmContext::new(builder.build())
}

/// Producer and consumer for the heap protocol in one context.
pub fn heap_context(size: usize) -> ShmContext {
    let prefix = unique_prefix("heap");
    let backend = PosixHeapBackend::new(HeapBackendConfig {
        size,
        alignment: 64,
        name_prefix: prefix.clone(),
    })
    .unwrap();
    let mut builder = ShmRegistryBuilder::new();
    builder
        .add_backend(POSIX_HEAP_PROTOCOL_ID, backend)
        .unwrap()
        .add_client(POSIX_HEAP_PROTOCOL_ID, PosixHeapClient::new(prefix))
        .unwrap();
    ShmContext::new(builder.build())
}
