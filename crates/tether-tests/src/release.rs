//! Native release happens exactly once per handle.

use crate::fixtures::{bridge, Frame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use tether_core::{BridgeError, ExternalRefCount};
use tether_memory::Ownership;

#[test]
fn only_the_last_of_k_wrappers_releases() {
    let (lib, bridge) = bridge();
    let handle = lib.create(1024);
    let first = Frame::register(&bridge, handle, ExternalRefCount::new());
    assert_eq!(first.link.wrapper().ownership(), Ownership::Exclusive);

    let mut frames = vec![first];
    for _ in 1..8 {
        let copy = frames[0].copy(&bridge);
        assert_eq!(copy.link.wrapper().ownership(), Ownership::Shared);
        frames.push(copy);
    }
    assert_eq!(frames[0].link.wrapper().external_ref_count().get(), 8);

    let (last, rest) = frames.split_last().unwrap();
    for frame in rest {
        bridge.release_proxy(&frame.link).unwrap();
        assert_eq!(lib.release_calls(handle), 0);
        assert!(lib.is_live(handle));
    }
    bridge.release_proxy(&last.link).unwrap();
    assert_eq!(lib.release_calls(handle), 1);
    assert!(!lib.is_live(handle));

    drop(frames);
    bridge.collect_with(true);
    assert_eq!(lib.release_calls(handle), 1);
    assert_eq!(bridge.pinned_object_count(), 0);
}

#[test]
fn double_release_is_reported_not_repeated() {
    let (lib, bridge) = bridge();
    let handle = lib.create(64);
    let frame = Frame::register(&bridge, handle, ExternalRefCount::new());

    bridge.release_proxy(&frame.link).unwrap();
    let second = bridge.release_proxy(&frame.link);
    assert!(matches!(second, Err(BridgeError::AlreadyReleased(_))));
    assert!(!frame.link.wrapper().delete());
    assert_eq!(lib.release_calls(handle), 1);
}

#[test]
fn handle_is_unreadable_after_release() {
    let (lib, bridge) = bridge();
    let frame = Frame::register(&bridge, lib.create(64), ExternalRefCount::new());
    frame.link.release().unwrap();
    assert!(matches!(
        frame.link.handle(),
        Err(BridgeError::AlreadyReleased(_))
    ));
    assert!(bridge
        .dump_live_references()
        .contains("ReferenceWrapper[native=0x0;"));
}

#[test]
fn racing_deletes_have_one_winner() {
    let (lib, bridge) = bridge();
    let handle = lib.create(64);
    let frame = Frame::register(&bridge, handle, ExternalRefCount::new());
    let wrapper = Arc::clone(frame.link.wrapper());

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let winners = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            std::thread::spawn(move || {
                barrier.wait();
                if wrapper.delete() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(lib.release_calls(handle), 1);
    assert!(frame.link.is_released());
}
