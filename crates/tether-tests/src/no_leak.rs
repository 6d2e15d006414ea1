//! Every proxy that becomes unreachable is eventually released.

use crate::fixtures::{bridge, bridge_with, Frame};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{BridgeConfig, ExternalRefCount, MemoryModel};

#[test]
fn unreachable_buffers_converge_to_zero_under_every_model() {
    for model in MemoryModel::ALL {
        let (lib, bridge) = bridge_with(BridgeConfig::default().with_memory_model(model));
        let buffers: Vec<_> = (0..200)
            .map(|_| bridge.make_buffer(4096).unwrap())
            .collect();
        assert_eq!(bridge.pinned_object_count(), 200, "{model:?}");

        drop(buffers);
        let mut passes = 0;
        while bridge.pinned_object_count() > 0 && passes < 10 {
            bridge.collect();
            passes += 1;
        }

        assert_eq!(bridge.pinned_object_count(), 0, "{model:?}");
        assert_eq!(lib.live_objects(), 0, "{model:?}");
        assert_eq!(bridge.allocator().outstanding_count(), 0, "{model:?}");
        assert_eq!(bridge.allocator().external_pressure(), 0, "{model:?}");
    }
}

#[test]
fn registration_reclaims_earlier_garbage() {
    let (lib, bridge) = bridge();
    let first = Frame::register(&bridge, lib.create(8), ExternalRefCount::new());
    drop(first);
    assert_eq!(lib.live_objects(), 1);

    // Registering drains the queue before claiming a slot.
    let _second = Frame::register(&bridge, lib.create(8), ExternalRefCount::new());
    assert_eq!(lib.live_objects(), 1);
    assert_eq!(bridge.pinned_object_count(), 1);
}

#[test]
fn background_collector_releases_without_explicit_collect() {
    let (lib, bridge) = bridge();
    bridge.start_background_collector().unwrap();

    let frames: Vec<_> = (0..500)
        .map(|_| Frame::register(&bridge, lib.create(16), ExternalRefCount::new()))
        .collect();
    drop(frames);

    let deadline = Instant::now() + Duration::from_secs(10);
    while bridge.pinned_object_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(bridge.pinned_object_count(), 0);
    assert_eq!(lib.live_objects(), 0);
    assert!(bridge.stop_background_collector());
}

#[test]
fn links_outliving_the_bridge_release_their_objects() {
    for model in MemoryModel::ALL {
        let (lib, bridge) = bridge_with(BridgeConfig::default().with_memory_model(model));
        let allocator = Arc::downgrade(bridge.allocator());
        let queued = Frame::register(&bridge, lib.create(64), ExternalRefCount::new());
        let survivor = Frame::register(&bridge, lib.create(64), ExternalRefCount::new());

        // Queued before the bridge goes away: released by its drop.
        drop(queued);
        drop(bridge);
        assert_eq!(lib.live_objects(), 1, "{model:?}");

        // Nothing left to drain: the link releases in place.
        drop(survivor);
        assert_eq!(lib.live_objects(), 0, "{model:?}");
        assert!(allocator.upgrade().is_none(), "{model:?}");
    }
}
