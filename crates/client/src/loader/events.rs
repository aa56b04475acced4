//! What callers get back from a load: event streams, results and the
//! cancellation handle shared between a caller and its network task.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use pixcache_core::Asset;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use super::error::LoadError;

/// Where an image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    /// No image; the load failed.
    None,
    /// Downloaded and written to the disk cache.
    NetworkToDisk,
    /// The server confirmed the cached copy with a 304.
    NetworkNotModified,
    Disk,
    Memory,
}

impl LoadSource {
    pub fn is_cache(self) -> bool {
        matches!(self, LoadSource::Disk | LoadSource::Memory)
    }
}

/// Final result of [`ImageLoader::load`](super::ImageLoader::load).
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub image: Asset,
    pub source: LoadSource,
}

/// Final result of [`ImageLoader::cache_image`](super::ImageLoader::cache_image).
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub image: Asset,
    /// The URL the caller asked for, after canonicalization.
    pub url: String,
    /// Location of the cached payload, when one is on disk.
    pub path: Option<PathBuf>,
    /// One of `NetworkToDisk`, `Disk` or `Memory`.
    pub source: LoadSource,
}

/// Progress of a three-phase load, in the order they can occur.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// A cached image is available now. Sent at most once.
    HasCache { image: Asset, source: LoadSource },
    /// The network is about to be consulted. Sent at most once.
    SendingRequest { had_cached_image: bool },
    /// The load is over. Always the last event.
    Completed(Result<LoadedImage, LoadError>),
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Pending,
    /// This caller started the network task.
    Initiated(AbortHandle),
    /// This caller is waiting on another caller's network task.
    Joined,
    Finished,
}

#[derive(Debug, Default)]
struct ControlState {
    phase: Phase,
    cancel_requested: bool,
}

/// Cancellation state shared by a handle and the task running its load.
#[derive(Debug, Clone, Default)]
pub(crate) struct NetworkControl {
    state: Arc<Mutex<ControlState>>,
}

impl NetworkControl {
    /// Request cancellation.
    ///
    /// Before the network phase this stops the request from being sent. For
    /// the initiator it aborts the network task, which fails every joined
    /// caller with [`LoadError::Cancelled`]. For a joined caller it does
    /// nothing.
    pub(crate) fn cancel(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &state.phase {
            Phase::Pending => state.cancel_requested = true,
            Phase::Initiated(abort) => {
                abort.abort();
                state.cancel_requested = true;
            }
            Phase::Joined | Phase::Finished => {}
        }
    }

    /// Enter the network phase unless cancelled.
    ///
    /// `start` runs under the control lock, so a concurrent `cancel` sees
    /// either the pending phase or the phase `start` produced. Returns
    /// `None` if cancellation was already requested.
    pub(crate) fn begin_network<T>(&self, start: impl FnOnce() -> (T, Option<AbortHandle>)) -> Option<T> {
        let mut state = self.state.lock();
        if state.cancel_requested {
            state.phase = Phase::Finished;
            return None;
        }
        let (value, abort) = start();
        state.phase = match abort {
            Some(abort) => Phase::Initiated(abort),
            None => Phase::Joined,
        };
        Some(value)
    }

    pub(crate) fn finish(&self) {
        self.state.lock().phase = Phase::Finished;
    }

    #[cfg(test)]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancel_requested
    }

    pub(crate) fn is_initiator(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Initiated(_))
    }
}

/// Receiving end of a three-phase load.
#[derive(Debug)]
pub struct LoadHandle {
    events: mpsc::UnboundedReceiver<LoadEvent>,
    control: NetworkControl,
}

impl LoadHandle {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<LoadEvent>, control: NetworkControl) -> Self {
        Self { events, control }
    }

    /// Next event, or `None` once the load has completed and every event
    /// was read.
    pub async fn next_event(&mut self) -> Option<LoadEvent> {
        self.events.recv().await
    }

    /// Skip to the final result.
    pub async fn completion(mut self) -> Result<LoadedImage, LoadError> {
        while let Some(event) = self.events.recv().await {
            if let LoadEvent::Completed(result) = event {
                return result;
            }
        }
        Err(LoadError::Cancelled)
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Whether this load is the one performing the network request.
    pub fn is_initiator(&self) -> bool {
        self.control.is_initiator()
    }
}

/// A running disk-cache load.
#[derive(Debug)]
pub struct CacheTask {
    task: JoinHandle<Result<CachedImage, LoadError>>,
    control: NetworkControl,
}

impl CacheTask {
    pub(crate) fn new(task: JoinHandle<Result<CachedImage, LoadError>>, control: NetworkControl) -> Self {
        Self { task, control }
    }

    pub async fn wait(self) -> Result<CachedImage, LoadError> {
        self.task.await.unwrap_or(Err(LoadError::Cancelled))
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_initiator(&self) -> bool {
        self.control.is_initiator()
    }
}
