//! Many threads registering and releasing copies of one handle.

use crate::fixtures::{bridge_with, Frame};
use std::sync::{Arc, Barrier};
use tether_core::{BridgeConfig, ExternalRefCount, TrackerConfig};

const CYCLES: usize = 2_000;

fn threads() -> usize {
    num_cpus::get().clamp(2, 16)
}

fn small_heap() -> BridgeConfig {
    // A small floor forces the coarse path to run under contention.
    BridgeConfig::default().with_tracker(TrackerConfig {
        minimum_references_to_cache: 32,
        ..TrackerConfig::default()
    })
}

#[test]
fn explicit_release_cycles_restore_counts() {
    let (lib, bridge) = bridge_with(small_heap());
    let bridge = Arc::new(bridge);
    let handle = lib.create(4096);
    let base = Frame::register(&bridge, handle, ExternalRefCount::new());
    let external = base.link.wrapper().external_ref_count().clone();
    let pinned_before = bridge.pinned_object_count();

    let n = threads();
    let barrier = Arc::new(Barrier::new(n));
    let workers: Vec<_> = (0..n)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let barrier = Arc::clone(&barrier);
            let external = external.clone();
            std::thread::spawn(move || {
                let token = Arc::new(());
                barrier.wait();
                for _ in 0..CYCLES {
                    external.retain();
                    let link = bridge
                        .register_proxy(handle, &Arc::downgrade(&token), false, external.clone())
                        .unwrap();
                    bridge.release_proxy(&link).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    bridge.collect_with(true);
    assert_eq!(external.get(), 1);
    assert_eq!(bridge.pinned_object_count(), pinned_before);
    assert_eq!(lib.release_calls(handle), 0);
    assert!(lib.is_live(handle));
    assert!(bridge.heap().len() <= bridge.heap().capacity());
}

#[test]
fn dropped_links_restore_counts_after_collect() {
    let (lib, bridge) = bridge_with(small_heap());
    let bridge = Arc::new(bridge);
    let handle = lib.create(4096);
    let base = Frame::register(&bridge, handle, ExternalRefCount::new());
    let pinned_before = bridge.pinned_object_count();

    let n = threads();
    let barrier = Arc::new(Barrier::new(n));
    let workers: Vec<_> = (0..n)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let barrier = Arc::clone(&barrier);
            let external = base.link.wrapper().external_ref_count().clone();
            std::thread::spawn(move || {
                let token = Arc::new(());
                barrier.wait();
                for _ in 0..CYCLES {
                    external.retain();
                    let link = bridge
                        .register_proxy(handle, &Arc::downgrade(&token), false, external.clone())
                        .unwrap();
                    drop(link);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    bridge.collect_with(true);
    assert_eq!(base.link.wrapper().external_ref_count().get(), 1);
    assert_eq!(bridge.pinned_object_count(), pinned_before);
    assert_eq!(lib.release_calls(handle), 0);

    drop(base);
    bridge.collect();
    assert_eq!(lib.release_calls(handle), 1);
}

#[test]
fn independent_handles_from_many_threads() {
    let (lib, bridge) = bridge_with(small_heap());
    let bridge = Arc::new(bridge);
    bridge.start_background_collector().unwrap();

    let n = threads();
    let workers: Vec<_> = (0..n)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let lib = Arc::clone(&lib);
            std::thread::spawn(move || {
                for _ in 0..CYCLES / 4 {
                    let frame = Frame::register(&bridge, lib.create(8), ExternalRefCount::new());
                    drop(frame);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    bridge.stop_background_collector();
    bridge.collect_with(true);
    assert_eq!(bridge.pinned_object_count(), 0);
    assert_eq!(lib.live_objects(), 0);
}

#[test]
fn concurrent_registrations_each_get_their_own_slot() {
    const PER_THREAD: usize = 1_000;
    let (lib, bridge) = bridge_with(BridgeConfig::default().with_tracker(TrackerConfig {
        minimum_references_to_cache: 8,
        ..TrackerConfig::default()
    }));
    let bridge = Arc::new(bridge);

    let n = threads();
    let barrier = Arc::new(Barrier::new(n));
    let workers: Vec<_> = (0..n)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let barrier = Arc::clone(&barrier);
            let lib = Arc::clone(&lib);
            std::thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| Frame::register(&bridge, lib.create(8), ExternalRefCount::new()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let frames: Vec<Frame> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();

    assert_eq!(frames.len(), n * PER_THREAD);
    assert_eq!(bridge.pinned_object_count(), n * PER_THREAD);
    assert_eq!(bridge.heap().len(), n * PER_THREAD);
    assert!(bridge.heap().len() <= bridge.heap().capacity());
    assert_eq!(lib.live_objects(), n * PER_THREAD);

    drop(frames);
    bridge.collect_with(true);
    assert_eq!(bridge.pinned_object_count(), 0);
    assert_eq!(lib.live_objects(), 0);
}
