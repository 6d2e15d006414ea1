//! Shared setup for the integration tests.

use std::sync::Arc;
use tether_core::{BridgeConfig, ExternalRefCount, NativeHandle, RetryPolicy};
use tether_memory::{MemoryBridge, NativeLibrary, ProxyLink, SimulatedLibrary};
use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Retries that do not slow the suite down.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff_ms: 1,
        ..RetryPolicy::default()
    }
}

pub fn bridge_with(config: BridgeConfig) -> (Arc<SimulatedLibrary>, MemoryBridge) {
    init_tracing();
    let lib = Arc::new(SimulatedLibrary::new());
    let dyn_lib: Arc<dyn NativeLibrary> = lib.clone();
    let bridge = MemoryBridge::new(dyn_lib, config.with_retry(fast_retry())).unwrap();
    (lib, bridge)
}

pub fn bridge() -> (Arc<SimulatedLibrary>, MemoryBridge) {
    bridge_with(BridgeConfig::default())
}

/// A minimal proxy: the link dies with the frame.
pub struct Frame {
    _token: Arc<()>,
    pub link: ProxyLink,
}

impl Frame {
    pub fn register(bridge: &MemoryBridge, handle: NativeHandle, external: ExternalRefCount) -> Self {
        let token = Arc::new(());
        let link = bridge
            .register_proxy(handle, &Arc::downgrade(&token), false, external)
            .unwrap();
        Self {
            _token: token,
            link,
        }
    }

    /// A second frame on the same handle, sharing `external`.
    pub fn copy(&self, bridge: &MemoryBridge) -> Self {
        let external = self.link.wrapper().external_ref_count().clone();
        external.retain();
        Self::register(bridge, self.link.handle().unwrap(), external)
    }
}
