//! Background collector lifecycle through the bridge.

use crate::fixtures::{bridge, Frame};
use std::time::{Duration, Instant};
use tether_core::{BridgeError, ExternalRefCount};

#[test]
fn starting_twice_is_an_error() {
    let (_lib, bridge) = bridge();
    bridge.start_background_collector().unwrap();
    assert!(bridge.is_collector_running());
    assert!(matches!(
        bridge.start_background_collector(),
        Err(BridgeError::CollectorRunning)
    ));
    assert!(bridge.stop_background_collector());
    assert!(!bridge.is_collector_running());
}

#[test]
fn stop_is_prompt_and_restartable() {
    let (lib, bridge) = bridge();
    for _ in 0..3 {
        bridge.start_background_collector().unwrap();
        let started = Instant::now();
        assert!(bridge.stop_background_collector());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!bridge.is_collector_running());
    }
    assert!(!bridge.stop_background_collector());

    // Stopped collector: reclamation falls back to explicit collects.
    let frame = Frame::register(&bridge, lib.create(8), ExternalRefCount::new());
    drop(frame);
    assert_eq!(bridge.queue().pending(), 1);
    assert_eq!(bridge.collect(), 1);
}

#[test]
fn shutdown_stops_the_collector_and_flushes() {
    let (lib, bridge) = bridge();
    bridge.start_background_collector().unwrap();
    let kept = Frame::register(&bridge, lib.create(8), ExternalRefCount::new());

    bridge.shutdown();
    assert!(!bridge.is_collector_running());
    assert!(kept.link.is_released());
    assert_eq!(lib.live_objects(), 0);
    assert_eq!(bridge.heap().capacity(), bridge.heap().minimum_references_to_cache());
}
