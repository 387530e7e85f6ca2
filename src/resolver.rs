//! Source resolution with a TTL cache
//!
//! Turns an identifier into a [`SourceDescriptor`] by running the external
//! extractor. Resolution is expensive, so descriptors are cached until they
//! expire or are invalidated after the upstream rejects them.

use crate::command::CommandRunner;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::models::{content_type_for_extension, ExtractorOutput, SourceDescriptor};
use crate::validator::IdentifierValidator;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings for the resolver
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Extractor executable
    pub program: String,
    /// Prefix the identifier is appended to
    pub url_prefix: String,
    /// Descriptor time-to-live
    pub ttl: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings {
            program: "yt-dlp".to_string(),
            url_prefix: "https://www.youtube.com/watch?v=".to_string(),
            ttl: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Resolves identifiers to source descriptors and caches the results
pub struct SourceResolver {
    runner: Arc<dyn CommandRunner>,
    settings: ResolverSettings,
    /// Lifetime given to newly resolved descriptors; adjustable at runtime
    ttl: RwLock<Duration>,
    cache: RwLock<HashMap<String, Arc<SourceDescriptor>>>,
    /// One async lock per identifier so concurrent misses run the extractor once
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    purger: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Arc<RelayMetrics>>,
}

impl SourceResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ResolverSettings) -> Self {
        SourceResolver {
            runner,
            ttl: RwLock::new(settings.ttl),
            settings,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            purger: Mutex::new(None),
            metrics: None,
        }
    }

    /// Record extractor invocations in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Lifetime given to descriptors resolved from now on
    pub fn ttl(&self) -> Duration {
        self.ttl.read().map(|ttl| *ttl).unwrap_or(self.settings.ttl)
    }

    /// Change the lifetime of future descriptors; cached ones keep their expiry
    pub fn set_ttl(&self, ttl: Duration) {
        if let Ok(mut current) = self.ttl.write() {
            *current = ttl;
        }
        info!("Descriptor TTL set to {:?}", ttl);
    }

    /// Fixed extractor argument list for a canonical resource URL
    pub fn extractor_args(url: &str) -> Vec<String> {
        vec![
            "--dump-single-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ]
    }

    /// Resolve `id` to a descriptor, using the cache when it is still fresh
    ///
    /// # Errors
    /// * `InvalidIdentifier` if `id` is malformed (no process is spawned)
    /// * `ExtractionFailed` on non-zero exit or unparsable output
    /// * `NoAudioFormat` if no audio-only format is reported
    pub async fn resolve(&self, id: &str) -> Result<Arc<SourceDescriptor>> {
        IdentifierValidator::validate(id)?;

        if let Some(descriptor) = self.cached(id) {
            debug!("Descriptor cache hit: id={}", id);
            return Ok(descriptor);
        }

        let lock = self.inflight_lock(id);
        let guard = lock.lock().await;

        // Another request may have resolved while we waited
        let result = match self.cached(id) {
            Some(descriptor) => {
                debug!("Descriptor resolved by concurrent request: id={}", id);
                Ok(descriptor)
            }
            None => self.extract(id).await.map(|descriptor| {
                let descriptor = Arc::new(descriptor);
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(id.to_string(), Arc::clone(&descriptor));
                }
                descriptor
            }),
        };

        // The cache is filled before the lock entry goes, so a later caller
        // either finds the descriptor or starts a fresh extraction
        self.release_inflight(id, &lock);
        drop(guard);
        result
    }

    /// Return the cached descriptor for `id` if it has not expired
    pub fn cached(&self, id: &str) -> Option<Arc<SourceDescriptor>> {
        let now = SystemTime::now();
        let cache = self.cache.read().ok()?;
        cache
            .get(id)
            .filter(|descriptor| descriptor.is_fresh_at(now))
            .cloned()
    }

    /// Remove any cached descriptor for `id` unconditionally
    pub fn invalidate(&self, id: &str) {
        if let Ok(mut cache) = self.cache.write() {
            if cache.remove(id).is_some() {
                info!("Invalidated cached descriptor: id={}", id);
            }
        }
    }

    /// Remove the cached descriptor only if it is still `stale`
    ///
    /// Two requests rejected with the same expired link should not evict the
    /// fresh descriptor the first one already re-resolved.
    pub fn invalidate_stale(&self, id: &str, stale: &Arc<SourceDescriptor>) {
        if let Ok(mut cache) = self.cache.write() {
            let matches = cache
                .get(id)
                .map(|current| Arc::ptr_eq(current, stale))
                .unwrap_or(false);
            if matches {
                cache.remove(id);
                info!("Invalidated stale descriptor: id={}", id);
            }
        }
    }

    /// Drop expired descriptors and idle in-flight locks, returning how many descriptors went
    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;
        if let Ok(mut cache) = self.cache.write() {
            let before = cache.len();
            cache.retain(|_, descriptor| descriptor.is_fresh_at(now));
            removed = before - cache.len();
        }
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        removed
    }

    /// Spawn the periodic purge of expired descriptors; a no-op while it runs
    pub fn start_purger(self: &Arc<Self>, period: Duration) {
        let mut purger = match self.purger.lock() {
            Ok(purger) => purger,
            Err(poisoned) => poisoned.into_inner(),
        };
        if purger.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let resolver = Arc::downgrade(self);
        *purger = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(resolver) = resolver.upgrade() else {
                    break;
                };
                let purged = resolver.purge_expired();
                if purged > 0 {
                    debug!(
                        "Purged {} expired descriptors, {} cached",
                        purged,
                        resolver.cache_len()
                    );
                }
            }
        }));
        info!("Descriptor purge started: interval={:?}", period);
    }

    /// Stop the periodic purge
    pub fn stop_purger(&self) {
        if let Ok(mut purger) = self.purger.lock() {
            if let Some(handle) = purger.take() {
                handle.abort();
            }
        }
    }

    /// Number of cached descriptors (fresh or not)
    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Identifiers with a resolution lock currently allocated
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().map(|inflight| inflight.len()).unwrap_or(0)
    }

    /// Drop `id`'s lock entry unless another caller still holds it
    fn release_inflight(&self, id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut inflight) = self.inflight.lock() {
            let unshared = inflight
                .get(id)
                .map(|current| Arc::ptr_eq(current, lock) && Arc::strong_count(lock) == 2)
                .unwrap_or(false);
            if unshared {
                inflight.remove(id);
            }
        }
    }

    fn inflight_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.inflight.lock() {
            Ok(mut inflight) => Arc::clone(
                inflight
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            ),
            // Poisoned map: fall back to an unshared lock
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    async fn extract(&self, id: &str) -> Result<SourceDescriptor> {
        let url = IdentifierValidator::canonical_url(&self.settings.url_prefix, id)?;
        let args = Self::extractor_args(&url);
        let started = Instant::now();

        if let Some(metrics) = &self.metrics {
            metrics.record_resolution();
        }

        let output = self.runner.run(&self.settings.program, &args).await?;

        if !output.success() {
            warn!(
                "Extractor failed: id={} exit_code={:?} stderr={}",
                id,
                output.exit_code,
                output.stderr_text()
            );
            return Err(RelayError::extraction_failed(
                output.exit_code,
                output.stderr_text(),
            ));
        }

        let parsed: ExtractorOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            warn!("Extractor output unparsable: id={} error={}", id, e);
            RelayError::extraction_failed(output.exit_code, format!("unparsable output: {}", e))
        })?;

        let format = parsed.best_audio_format().ok_or_else(|| {
            warn!(
                "No audio-only format: id={} formats={}",
                id,
                parsed.formats.len()
            );
            RelayError::NoAudioFormat(id.to_string())
        })?;

        let source_url = format
            .url
            .clone()
            .ok_or_else(|| RelayError::extraction_failed(output.exit_code, "format has no url"))?;

        let total_length = format.byte_length().ok_or_else(|| {
            warn!("Selected format reports no byte size: id={}", id);
            RelayError::extraction_failed(output.exit_code, "selected format reports no byte size")
        })?;

        let content_type = content_type_for_extension(format.ext.as_deref());

        info!(
            "Resolved id={} format={:?} abr={} size={} content_type={} in {:?}",
            id,
            format.format_id,
            format.audio_bitrate(),
            total_length,
            content_type,
            started.elapsed()
        );

        Ok(SourceDescriptor::new(
            source_url,
            total_length,
            content_type,
            format.http_headers.clone(),
            self.ttl(),
        ))
    }
}

impl Drop for SourceResolver {
    fn drop(&mut self) {
        self.stop_purger();
    }
}
