//! Tether Memory - Lifetime bridge between proxies and native objects
//!
//! Tracks every proxy that fronts a native object and releases the native
//! side once the proxy is gone.
//!
//! Architecture:
//! - `ReferenceHeap`: Slot table of live wrappers behind a spin flag and a coarse lock
//! - `ReferenceWrapper` / `ProxyLink`: Per-proxy record and the handle whose drop reports unreachability
//! - `ReclamationQueue`: Wrappers awaiting release, drained opportunistically or by `BackgroundCollector`
//! - `MemoryAllocator`: Retrying block allocation backed by a `Parachute` reserve
//! - `MemoryBridge`: Top-level owner of all of the above

pub mod allocator;
pub mod bridge;
pub mod buffer;
pub mod collector;
pub mod heap;
pub mod native;
pub mod parachute;
pub mod queue;
pub mod reference;
mod spin;

pub use allocator::{BackingStore, Block, BlockId, HeapStore, MemoryAllocator, RetryCancel};
pub use bridge::MemoryBridge;
pub use buffer::NativeBuffer;
pub use collector::BackgroundCollector;
pub use heap::{HeapStats, HeapTuning, ReferenceHeap};
pub use native::{NativeLibrary, SimulatedLibrary};
pub use parachute::Parachute;
pub use queue::ReclamationQueue;
pub use reference::{DebugInfo, Ownership, ProxyLink, ReferenceWrapper};
