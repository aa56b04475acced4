//! Two-tier image cache: a bounded memory tier and a persistent disk tier.
//!
//! This module provides:
//!
//! - Content-addressed keys using SHA-256 hashing
//! - Byte-budgeted LRU memory cache
//! - Crash-safe disk store with metadata sidecars
//! - HTTP freshness and validation policy

pub mod disk;
pub mod key;
pub mod memory;
pub mod metadata;
pub mod policy;

pub use crate::Error;

pub use disk::DiskStore;
pub use key::ResourceKey;
pub use memory::MemoryCache;
pub use metadata::{CacheControl, CacheEntryMetadata, Validator};
pub use policy::CachePolicy;
