//! One load, from cache lookup to network outcome.

use std::path::PathBuf;
use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode, header};
use pixcache_core::cache::policy::response_warnings;
use pixcache_core::{Asset, CacheEntryMetadata, ResourceKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::LoaderInner;
use super::error::LoadError;
use super::events::{LoadEvent, LoadSource, NetworkControl};
use super::request::ImageRequest;
use crate::fetch::{TransportRequest, TransportResponse, canonicalize};
use crate::inflight::{InFlightTicket, Joined};

/// Which public entry point started the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Variant {
    /// Three-phase events.
    Loader,
    /// Single completion with a file location.
    DiskCache,
}

/// What the network task hands to every joined caller.
#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub(crate) image: Asset,
    /// `NetworkToDisk` or `NetworkNotModified`.
    pub(crate) source: LoadSource,
    pub(crate) path: Option<PathBuf>,
}

pub(crate) type NetworkOutcome = Result<Fetched, LoadError>;

/// A finished load, before it is shaped for its entry point.
pub(crate) struct Done {
    pub(crate) image: Asset,
    pub(crate) url: String,
    pub(crate) path: Option<PathBuf>,
    pub(crate) source: LoadSource,
}

/// A cached copy found before the network phase.
#[derive(Clone)]
struct Cached {
    image: Asset,
    source: LoadSource,
    metadata: Option<CacheEntryMetadata>,
}

pub(crate) struct Run {
    pub(crate) inner: Arc<LoaderInner>,
    pub(crate) variant: Variant,
    pub(crate) control: NetworkControl,
    pub(crate) events: Option<mpsc::UnboundedSender<LoadEvent>>,
}

impl Run {
    pub(crate) fn emit(&self, event: LoadEvent) {
        if let Some(events) = &self.events {
            // The handle may have been dropped.
            let _ = events.send(event);
        }
    }

    fn caches_in_memory(&self) -> bool {
        match self.variant {
            Variant::Loader => self.inner.config.cache_images_in_memory,
            Variant::DiskCache => true,
        }
    }

    pub(crate) async fn execute(&self, request: ImageRequest) -> Result<Done, LoadError> {
        let url = canonicalize(&request.url)?;
        let key = ResourceKey::compute(&request.method, url.as_str(), &request.headers);
        let inner = &self.inner;

        let mut cached = None;
        if let Some(image) = inner.memory.get(&key) {
            debug!(key = %key, "memory cache hit");
            self.emit(LoadEvent::HasCache { image: image.clone(), source: LoadSource::Memory });

            if !inner.policy.use_server_cache_policy && self.variant == Variant::DiskCache {
                let path = self.stored_path(&key).await;
                return Ok(Done { image, url: url.to_string(), path, source: LoadSource::Memory });
            }
            cached = Some(Cached { image, source: LoadSource::Memory, metadata: None });
        }

        match cached.as_mut() {
            // Without its payload the disk entry cannot back a memory hit.
            Some(hit) => {
                hit.metadata = match inner.disk.existing_payload(&key).await {
                    Some(_) => inner.disk.read_metadata(&key).await,
                    None => None,
                };
            }
            None => cached = self.read_disk(&key).await,
        }

        if let Some(Cached { image, source, metadata: Some(metadata) }) = &cached
            && !inner.policy.needs_revalidation(metadata, inner.clock.now())
        {
            debug!(key = %key, source = ?source, "cached image is fresh");
            return Ok(Done {
                image: image.clone(),
                url: url.to_string(),
                path: self.stored_path(&key).await,
                source: *source,
            });
        }

        if cached.is_none() && inner.config.log_cache_misses {
            info!(url = %url, "image cache miss");
        }

        self.emit(LoadEvent::SendingRequest { had_cached_image: cached.is_some() });

        let network = NetworkTask {
            inner: Arc::clone(inner),
            key: key.clone(),
            url,
            method: request.method,
            headers: request.headers,
            cached: cached.as_ref().and_then(|c| c.metadata.clone().map(|meta| (c.image.clone(), meta))),
        };
        let url = network.url.to_string();

        let joined = self.control.begin_network(|| {
            let Joined { receiver, ticket } = inner.registry.join(&key);
            let abort = ticket.map(|ticket| tokio::spawn(network.run(ticket)).abort_handle());
            (receiver, abort)
        });
        let Some(mut receiver) = joined else {
            debug!(key = %key, "load cancelled before the network phase");
            return Err(LoadError::Cancelled);
        };

        // A closed channel means the initiator's task was aborted.
        let fetched = receiver.recv().await.unwrap_or(Err(LoadError::Cancelled))?;

        let source = match (fetched.source, self.variant, &cached) {
            (LoadSource::NetworkNotModified, Variant::DiskCache, Some(hit)) => hit.source,
            (LoadSource::NetworkNotModified, Variant::DiskCache, None) => LoadSource::Disk,
            (source, _, _) => source,
        };
        if self.caches_in_memory() {
            inner.memory.put(key, fetched.image.clone());
        }

        Ok(Done { image: fetched.image, url, path: fetched.path, source })
    }

    /// Decode a disk entry, announcing and caching it on success.
    async fn read_disk(&self, key: &ResourceKey) -> Option<Cached> {
        let inner = &self.inner;
        let (bytes, metadata) = inner.disk.read(key).await?;

        match Asset::decode(&bytes, Some(&metadata.content_type)) {
            Ok(image) => {
                debug!(key = %key, bytes = bytes.len(), "disk cache hit");
                self.emit(LoadEvent::HasCache { image: image.clone(), source: LoadSource::Disk });
                if self.caches_in_memory() {
                    inner.memory.put(key.clone(), image.clone());
                }
                Some(Cached { image, source: LoadSource::Disk, metadata: Some(metadata) })
            }
            Err(err) => {
                warn!(target: "pixcache::disk", key = %key, error = %err, "cached payload is not decodable, removing entry");
                if let Err(err) = inner.disk.delete(key).await {
                    warn!(target: "pixcache::disk", key = %key, error = %err, "failed to remove cache entry");
                }
                None
            }
        }
    }

    async fn stored_path(&self, key: &ResourceKey) -> Option<PathBuf> {
        self.inner.disk.existing_payload(key).await
    }
}

/// The single network operation for a key, run by the initiating caller.
struct NetworkTask {
    inner: Arc<LoaderInner>,
    key: ResourceKey,
    url: url::Url,
    method: Method,
    headers: HeaderMap,
    /// Decoded copy and metadata of the current disk entry.
    cached: Option<(Asset, CacheEntryMetadata)>,
}

impl NetworkTask {
    async fn run(self, ticket: InFlightTicket<NetworkOutcome>) {
        let outcome = self.fetch().await;
        if let Err(err) = &outcome {
            debug!(key = %self.key, error = %err, "network load failed");
        }
        ticket.complete(outcome);
    }

    async fn fetch(&self) -> NetworkOutcome {
        if let Some((image, metadata)) = &self.cached {
            let validators = self.inner.policy.conditional_headers(metadata);
            if !validators.is_empty() {
                let response = self.send(validators).await?;
                if response.status != StatusCode::NOT_MODIFIED {
                    return self.accept(response).await;
                }
                if let Some(fetched) = self.confirm(image, metadata, &response.headers).await {
                    return Ok(fetched);
                }
                debug!(key = %self.key, "cached copy vanished after 304, refetching");
            }
        }

        let response = self.send(HeaderMap::new()).await?;
        self.accept(response).await
    }

    async fn send(&self, validators: HeaderMap) -> Result<TransportResponse, LoadError> {
        let conditional = !validators.is_empty();
        let mut headers = self.headers.clone();
        headers.extend(validators);

        let authorization = self.inner.authorization.read().clone();
        if let Some(authorization) = authorization {
            headers.insert(header::AUTHORIZATION, authorization);
        }

        debug!(url = %self.url, conditional, "sending image request");
        let response = self
            .inner
            .transport
            .send(TransportRequest { method: self.method.clone(), url: self.url.clone(), headers })
            .await?;

        if self.inner.config.log_response_warnings {
            for warning in response_warnings(&response.headers) {
                warn!(url = %self.url, warning, "response caching headers");
            }
        }
        Ok(response)
    }

    /// A 304 confirmed the cached copy. `None` when there is no longer an
    /// entry on disk to confirm.
    async fn confirm(&self, image: &Asset, previous: &CacheEntryMetadata, headers: &HeaderMap) -> Option<Fetched> {
        let inner = &self.inner;
        let refreshed = inner.policy.refresh_metadata(previous, headers, inner.clock.now());

        match inner.disk.refresh(&self.key, &refreshed).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!(target: "pixcache::disk", key = %self.key, error = %err, "failed to refresh cache metadata");
            }
        }

        Some(Fetched {
            image: image.clone(),
            source: LoadSource::NetworkNotModified,
            path: Some(inner.disk.payload_path(&self.key)),
        })
    }

    /// Handle a full response.
    async fn accept(&self, response: TransportResponse) -> NetworkOutcome {
        let inner = &self.inner;
        if !response.status.is_success() {
            return Err(LoadError::ResponseCode(response.status.as_u16()));
        }

        let metadata = inner
            .policy
            .derive_metadata(self.key.clone(), self.url.as_str(), &response.headers, inner.clock.now())
            .map_err(|err| match err {
                pixcache_core::Error::ContentType(value) => LoadError::ContentType(value),
                other => LoadError::ContentType(other.to_string()),
            })?;

        let image = Asset::decode(&response.body, Some(&metadata.content_type))
            .map_err(|err| LoadError::Decode(err.to_string()))?;

        let path = match inner.disk.write(&self.key, &response.body, &metadata).await {
            Ok(()) => Some(inner.disk.payload_path(&self.key)),
            Err(err) => {
                warn!(target: "pixcache::disk", key = %self.key, error = %err, "failed to store image, serving it uncached");
                None
            }
        };

        debug!(key = %self.key, bytes = response.body.len(), fetch_ms = response.fetch_ms, "downloaded image");
        Ok(Fetched { image, source: LoadSource::NetworkToDisk, path })
    }
}
