//! Client side of pixcache.
//!
//! This crate provides the HTTP transport, request coalescing and the
//! [`ImageLoader`] that ties the core cache tiers to the network.

pub mod fetch;
pub mod inflight;
pub mod loader;

pub use fetch::{HttpTransport, ReqwestTransport, TransportConfig, TransportError, TrustPolicy};
pub use inflight::{InFlightRegistry, RegistryStats};
pub use loader::{
    CacheTask, CachedImage, Clock, ImageLoader, ImageLoaderBuilder, ImageRequest, LoadError, LoadEvent, LoadHandle,
    LoadSource, LoadedImage, SetupError, SystemClock,
};
