//! Reference heap growth and shrink-back.

use crate::fixtures::{bridge_with, Frame};
use tether_core::{BridgeConfig, ExternalRefCount, TrackerConfig};

const MINIMUM: usize = 1024;
const MAX_ITEMS: usize = 10_000;

fn config() -> BridgeConfig {
    BridgeConfig::default().with_tracker(TrackerConfig {
        minimum_references_to_cache: MINIMUM,
        ..TrackerConfig::default()
    })
}

#[test]
fn heap_grows_then_shrinks_back_to_minimum() {
    let (lib, bridge) = bridge_with(config());
    let heap = bridge.heap();
    assert_eq!(heap.capacity(), MINIMUM);

    let frames: Vec<_> = (0..MAX_ITEMS)
        .map(|_| Frame::register(&bridge, lib.create(1), ExternalRefCount::new()))
        .collect();
    assert!(heap.capacity() >= MAX_ITEMS);
    assert!(heap.stats().grows >= 1);
    assert_eq!(bridge.pinned_object_count(), MAX_ITEMS);

    drop(frames);
    bridge.collect();
    assert_eq!(lib.live_objects(), 0);

    let mut previous = heap.capacity();
    for _ in 0..1000 {
        if heap.capacity() == MINIMUM {
            break;
        }
        heap.sweep_and_collect();
        let capacity = heap.capacity();
        assert!(capacity <= previous);
        assert!(capacity >= MINIMUM);
        previous = capacity;
    }
    assert_eq!(heap.capacity(), MINIMUM);
    assert!(heap.stats().shrinks >= 1);

    // Sweeping an empty heap at the floor keeps it there.
    heap.sweep_and_collect();
    assert_eq!(heap.capacity(), MINIMUM);
}

#[test]
fn runtime_tuning_changes_the_floor() {
    let (lib, bridge) = bridge_with(config());
    let heap = bridge.heap();

    heap.set_minimum_references_to_cache(64).unwrap();
    heap.set_shrink_factor(99.0).unwrap();
    heap.set_expand_increment(100.0).unwrap();

    // 100% growth and 99% of that on shrink: one sweep nearly empties it.
    heap.sweep_and_collect();
    assert_eq!(heap.capacity(), 64);

    let _frames: Vec<_> = (0..65)
        .map(|_| Frame::register(&bridge, lib.create(1), ExternalRefCount::new()))
        .collect();
    assert_eq!(heap.capacity(), 128);
}

#[test]
fn invalid_tuning_is_rejected_synchronously() {
    let (_lib, bridge) = bridge_with(config());
    let bad = TrackerConfig {
        shrink_factor: 150.0,
        ..TrackerConfig::default()
    };
    assert!(bridge.configure(&bad).is_err());
    assert!(bridge.heap().set_minimum_references_to_cache(0).is_err());
    assert!((bridge.heap().shrink_factor() - 25.0).abs() < 1e-9);
}
