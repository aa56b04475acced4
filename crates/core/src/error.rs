//! Unified error types for pixcache.
//!
//! Caller-facing load failures live in the client crate; these cover the
//! cache tiers, header interpretation and decoding.

use std::path::PathBuf;

/// Unified error types for the cache core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A response carried a Content-Type outside the accepted image set.
    #[error("CONTENT_TYPE: {0}")]
    ContentType(String),

    /// Reading or writing the cache directory failed.
    #[error("DISK_IO: {path}: {source}")]
    DiskIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Payload bytes are not a decodable image.
    #[error("DECODE_FAILED: {0}")]
    Decode(String),

    /// Metadata could not be serialized.
    #[error("METADATA_ERROR: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::DiskIo { path: path.into(), source }
    }
}
