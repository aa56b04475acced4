//! Core types and shared functionality for pixcache.
//!
//! This crate provides:
//! - Memory and disk cache tiers with HTTP cache policy
//! - Unified error types
//! - Configuration structures

pub mod asset;
pub mod cache;
pub mod config;
pub mod error;

pub use asset::Asset;
pub use cache::{CacheEntryMetadata, CachePolicy, DiskStore, MemoryCache, ResourceKey};
pub use config::AppConfig;
pub use error::Error;
