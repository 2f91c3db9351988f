#![cfg(all(test, feature = "loom"))]

use crate::region::HeapRegion;
use crate::sync::{AtomicU32, Ordering, thread};
use crate::treiber::{AllocResult, TreiberSlab};
use crate::{SlotMeta, SlotState};
use loom::sync::Arc;

#[test]
fn treiber_concurrent_alloc_free() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let slab = unsafe { TreiberSlab::init(region_owner.region(), 0, 4, 64) }.unwrap();
        let slab = Arc::new(slab);

        let spawn = |slab: Arc<TreiberSlab>, owner: Arc<HeapRegion>| {
            thread::spawn(move || {
                let _keep = owner;
                if let AllocResult::Ok(handle) = slab.try_alloc() {
                    slab.free(handle.index).unwrap();
                }
            })
        };

        let t1 = spawn(slab.clone(), region_owner.clone());
        let t2 = spawn(slab.clone(), region_owner.clone());

        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(slab.free_count(), 4);
    });
}

#[test]
fn treiber_no_double_alloc() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let slab = unsafe { TreiberSlab::init(region_owner.region(), 0, 2, 64) }.unwrap();
        let slab = Arc::new(slab);
        let counter = Arc::new(AtomicU32::new(0));

        let run = |slab: Arc<TreiberSlab>, counter: Arc<AtomicU32>, owner: Arc<HeapRegion>| {
            let _keep = owner;
            for _ in 0..2 {
                if let AllocResult::Ok(_handle) = slab.try_alloc() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        };

        let t1 = thread::spawn({
            let slab = slab.clone();
            let counter = counter.clone();
            let owner = region_owner.clone();
            move || run(slab, counter, owner)
        });

        let t2 = thread::spawn({
            let slab = slab.clone();
            let counter = counter.clone();
            let owner = region_owner.clone();
            move || run(slab, counter, owner)
        });

        t1.join().unwrap();
        t2.join().unwrap();

        assert!(counter.load(Ordering::SeqCst) <= 2);
    });
}

#[test]
fn racing_double_free_only_one_wins() {
    loom::model(|| {
        let region_owner = Arc::new(HeapRegion::new_zeroed(4096));
        let slab = unsafe { TreiberSlab::init(region_owner.region(), 0, 2, 64) }.unwrap();
        let slab = Arc::new(slab);
        let AllocResult::Ok(handle) = slab.try_alloc() else {
            panic!("fresh slab exhausted");
        };

        let free = |slab: Arc<TreiberSlab>| thread::spawn(move || slab.free(handle.index).is_ok());
        let t1 = free(slab.clone());
        let t2 = free(slab.clone());

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        assert!(r1 != r2);
        assert_eq!(slab.free_count(), 2);
    });
}

#[test]
fn slot_state_transitions() {
    loom::model(|| {
        let meta = Arc::new(SlotMeta::new());

        let t1 = thread::spawn({
            let meta = meta.clone();
            move || meta.try_transition(SlotState::Free, SlotState::Allocated)
        });

        let t2 = thread::spawn({
            let meta = meta.clone();
            move || meta.try_transition(SlotState::Free, SlotState::Allocated)
        });

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        assert!(r1.is_ok() != r2.is_ok());
    });
}
