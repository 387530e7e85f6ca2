//! Range relay
//!
//! Answers one client request for a resource: resolves the source, serves the
//! requested byte range from the resource buffer when it can, and otherwise
//! fetches a read-ahead window from upstream that is split between the client
//! and the buffer.
//!
//! # Request flow
//!
//! 1. Validate the identifier and parse the Range header
//! 2. Resolve the source descriptor (cached)
//! 3. Get or create the resource buffer
//! 4. Hit: serve from memory, schedule read-ahead below the low-water mark
//! 5. Miss: reset on seek, fetch upstream, stream to client while filling
//!
//! An upstream 401/403 invalidates the descriptor and retries once with a
//! freshly resolved one.

use crate::buffer::{FillStarted, FillTicket, ResourceBuffer};
use crate::command::{CommandRunner, ProcessCommandRunner};
use crate::config::{ConfigChanges, RelayConfig};
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::models::{ByteRange, RangeRequest, SourceDescriptor};
use crate::registry::BufferRegistry;
use crate::resolver::{ResolverSettings, SourceResolver};
use crate::splitter::{pump_upstream, ClientSink, PumpPlan, CLIENT_CHANNEL_CAPACITY};
use crate::upstream::UpstreamClient;
use crate::validator::IdentifierValidator;
use bytes::Bytes;
use http::StatusCode;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upstream attempts per request: the original plus one after re-resolving
pub const MAX_FETCH_ATTEMPTS: u32 = 2;

/// Body of a relay response
#[derive(Debug)]
pub enum RelayBody {
    /// Entire body available up front
    Full(Bytes),
    /// Body streamed while the upstream read progresses
    Stream(mpsc::Receiver<Bytes>),
}

/// Successful answer to a stream request
#[derive(Debug)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub content_type: String,
    /// `bytes start-end/total`, absent on 200
    pub content_range: Option<String>,
    pub content_length: u64,
    pub body: RelayBody,
}

impl RelayResponse {
    fn headers_for(descriptor: &SourceDescriptor, served: &ByteRange, full: bool) -> Self {
        RelayResponse {
            status: if full {
                StatusCode::OK
            } else {
                StatusCode::PARTIAL_CONTENT
            },
            content_type: descriptor.content_type.clone(),
            content_range: if full {
                None
            } else {
                Some(served.to_content_range(descriptor.total_length))
            },
            content_length: served.size(),
            body: RelayBody::Full(Bytes::new()),
        }
    }

    fn with_body(mut self, body: RelayBody) -> Self {
        self.body = body;
        self
    }

    /// Collect the whole body; streams are read to the end
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            RelayBody::Full(bytes) => bytes,
            RelayBody::Stream(mut rx) => {
                let mut out = bytes::BytesMut::with_capacity(self.content_length as usize);
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                out.freeze()
            }
        }
    }
}

/// What a request resolves to once the resource length is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServePlan {
    /// Bytes returned to the client
    pub served: ByteRange,
    /// Upstream window fetched on a miss; always starts at `served.start`
    pub fetch: ByteRange,
    /// Answer 200 with the whole resource instead of 206
    pub full: bool,
}

impl ServePlan {
    /// Work out the served range and fetch window for a request
    ///
    /// Without a Range header the client gets the initial chunk; the whole
    /// resource is sent as 200 when it fits. An open-ended range is served up
    /// to the end of the fetch window, and an explicit end beyond that window
    /// widens the fetch.
    pub fn for_request(
        range: Option<&RangeRequest>,
        total: u64,
        initial_chunk: u64,
        read_ahead: u64,
    ) -> Result<Self> {
        let window_end = |start: u64| (start + read_ahead.max(1)).min(total) - 1;

        let Some(range) = range else {
            if total == 0 {
                return Err(RelayError::UnsatisfiableRange {
                    start: 0,
                    end: 0,
                    total,
                });
            }
            let served_end = initial_chunk.max(1).min(total) - 1;
            return Ok(ServePlan {
                served: ByteRange::new(0, served_end)?,
                fetch: ByteRange::new(0, window_end(0).max(served_end))?,
                full: total <= initial_chunk,
            });
        };

        let requested = range.resolve(total)?;
        let fetch_end = window_end(requested.start);
        let served = if range.is_open_ended() {
            ByteRange::new(requested.start, fetch_end)?
        } else {
            requested
        };

        Ok(ServePlan {
            served,
            fetch: ByteRange::new(served.start, fetch_end.max(served.end))?,
            full: false,
        })
    }
}

/// Request handler owning the resolver, buffer registry and upstream client
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct RangeRelay {
    /// Swapped whole on reload; requests work from the snapshot they started with
    config: Arc<RwLock<Arc<RelayConfig>>>,
    resolver: Arc<SourceResolver>,
    registry: Arc<BufferRegistry>,
    upstream: UpstreamClient,
    metrics: Arc<RelayMetrics>,
}

impl RangeRelay {
    /// Create a relay from configuration
    pub fn new(config: RelayConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RelayMetrics::new());
        let resolver = SourceResolver::new(
            runner,
            ResolverSettings {
                program: config.extractor_program.clone(),
                url_prefix: config.resource_url_prefix.clone(),
                ttl: config.descriptor_ttl(),
            },
        )
        .with_metrics(Arc::clone(&metrics));
        let registry = BufferRegistry::new(config.buffer_settings(), config.sweep_interval());
        let upstream = UpstreamClient::new(config.upstream_timeout())?;

        Ok(Self::with_components(
            config,
            Arc::new(resolver),
            Arc::new(registry),
            upstream,
            metrics,
        ))
    }

    /// Create a relay that runs the configured extractor as a child process
    pub fn with_process_runner(config: RelayConfig) -> Result<Self> {
        let runner = Arc::new(ProcessCommandRunner::new(config.extractor_timeout()));
        Self::new(config, runner)
    }

    /// Assemble a relay from existing parts
    pub fn with_components(
        config: RelayConfig,
        resolver: Arc<SourceResolver>,
        registry: Arc<BufferRegistry>,
        upstream: UpstreamClient,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        RangeRelay {
            config: Arc::new(RwLock::new(Arc::new(config))),
            resolver,
            registry,
            upstream,
            metrics,
        }
    }

    /// Configuration currently in effect
    pub fn config(&self) -> Arc<RelayConfig> {
        match self.config.read() {
            Ok(config) => Arc::clone(&*config),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Apply a new configuration to the running relay
    ///
    /// Request sizing and the descriptor TTL take effect for the next
    /// request. Other changed settings are reported in the returned
    /// [`ConfigChanges`] and keep their running values until restart.
    pub fn reload_config(&self, new_config: &RelayConfig) -> Result<ConfigChanges> {
        new_config.validate()?;
        let current = self.config();
        let changes = ConfigChanges::between(&current, new_config);

        let applied = current.with_runtime_settings(new_config);
        applied.validate()?;
        if changes.descriptor_ttl_changed {
            self.resolver.set_ttl(applied.descriptor_ttl());
        }

        match self.config.write() {
            Ok(mut config) => *config = Arc::new(applied),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(applied),
        }

        if changes.has_changes() {
            info!("Configuration reloaded: changed={:?}", changes.summary());
        }
        if changes.requires_restart() {
            warn!(
                "Configuration changes need a restart to take effect: {:?}",
                changes.restart_fields()
            );
        }
        Ok(changes)
    }

    pub fn resolver(&self) -> &Arc<SourceResolver> {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Start background maintenance: the registry sweep and descriptor purge
    pub fn start(&self) {
        self.registry.start_sweeper();
        self.resolver.start_purger(self.config().sweep_interval());
    }

    /// Stop background work and release every buffer
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.resolver.stop_purger();
        let purged = self.resolver.purge_expired();
        info!(
            "Relay shut down: purged {} expired descriptors, {} cached",
            purged,
            self.resolver.cache_len()
        );
    }

    /// Serve a GET for `id` with an optional Range header value
    pub async fn serve(&self, id: &str, range_header: Option<&str>) -> Result<RelayResponse> {
        self.handle(id, range_header, false).await
    }

    /// Answer a HEAD for `id`: same headers as [`serve`](Self::serve), empty body
    pub async fn head(&self, id: &str, range_header: Option<&str>) -> Result<RelayResponse> {
        self.handle(id, range_header, true).await
    }

    async fn handle(
        &self,
        id: &str,
        range_header: Option<&str>,
        head_only: bool,
    ) -> Result<RelayResponse> {
        let started = Instant::now();
        let result = self.handle_inner(id, range_header, head_only).await;
        self.metrics.record_request(result.is_ok(), started.elapsed());

        if let Err(e) = &result {
            warn!(
                "Stream request failed: id={} range={} status={} error={}",
                id,
                range_header.unwrap_or("none"),
                e.to_http_status(),
                e
            );
        }
        result
    }

    async fn handle_inner(
        &self,
        id: &str,
        range_header: Option<&str>,
        head_only: bool,
    ) -> Result<RelayResponse> {
        IdentifierValidator::validate(id)?;
        let range = range_header.map(RangeRequest::from_header).transpose()?;
        let config = self.config();

        let descriptor = self.resolver.resolve(id).await?;
        let plan = ServePlan::for_request(
            range.as_ref(),
            descriptor.total_length,
            config.initial_chunk_bytes,
            config.read_ahead_bytes,
        )?;
        let buffer = self.registry.get_or_create(id);

        let response = RelayResponse::headers_for(&descriptor, &plan.served, plan.full);
        if head_only {
            return Ok(response);
        }

        // Hit
        if let Some(data) = buffer.slice(plan.served.start, plan.served.end) {
            debug!(
                "Buffer hit: id={} range={}-{}",
                id, plan.served.start, plan.served.end
            );
            self.metrics.record_buffer_hit();
            self.metrics.record_bytes_from_buffer(data.len() as u64);
            self.metrics.record_bytes_to_client(data.len() as u64);

            if buffer.remaining_from(plan.served.end + 1) < config.low_water_bytes {
                self.schedule_read_ahead(&buffer, Arc::clone(&descriptor), config.read_ahead_bytes);
            }
            return Ok(response.with_body(RelayBody::Full(data)));
        }

        // Miss
        debug!(
            "Buffer miss: id={} fetch={}-{} serve={}-{}",
            id, plan.fetch.start, plan.fetch.end, plan.served.start, plan.served.end
        );
        self.metrics.record_buffer_miss();

        let had_data = buffer.snapshot().total_buffered > 0;
        let (buffer, fill) = self.claim_fill(id, buffer, plan.fetch.start);
        if fill.was_reset && had_data {
            info!(
                "Seek outside buffered window: id={} start={}, buffer reset",
                id, plan.fetch.start
            );
            self.metrics.record_buffer_reset();
        }

        let fetched = self.fetch_with_reresolve(id, descriptor, &plan.fetch).await;
        let (upstream_response, _) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                buffer.finish_fill(&fill.ticket);
                return Err(e);
            }
        };

        let skip = if upstream_response.status() == reqwest::StatusCode::OK {
            plan.fetch.start
        } else {
            0
        };
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let sink = ClientSink::new(tx, plan.served.size());

        // Not attached to the buffer: a superseded pump keeps serving its client
        tokio::spawn(pump_upstream(
            upstream_response,
            PumpPlan {
                skip,
                limit: plan.fetch.size(),
            },
            buffer,
            fill.ticket,
            sink,
            Arc::clone(&self.metrics),
        ));

        Ok(response.with_body(RelayBody::Stream(rx)))
    }

    /// Start a miss fill at `start`, replacing a buffer destroyed in the meantime
    ///
    /// An empty buffer can be swept between lookup and fill; filling it would
    /// stream to the client while caching nothing.
    fn claim_fill(
        &self,
        id: &str,
        buffer: Arc<ResourceBuffer>,
        start: u64,
    ) -> (Arc<ResourceBuffer>, FillStarted) {
        let fill = buffer.begin_fill_at(start);
        if !fill.destroyed {
            return (buffer, fill);
        }
        debug!("Buffer destroyed before fill, recreating: id={}", id);
        let fresh = self.registry.get_or_create(id);
        let fill = fresh.begin_fill_at(start);
        (fresh, fill)
    }

    /// Fetch `range`, re-resolving once if upstream rejects the link
    ///
    /// Returns the response together with the descriptor that produced it.
    async fn fetch_with_reresolve(
        &self,
        id: &str,
        descriptor: Arc<SourceDescriptor>,
        range: &ByteRange,
    ) -> Result<(reqwest::Response, Arc<SourceDescriptor>)> {
        let mut descriptor = descriptor;
        let mut attempt = 1;

        loop {
            match self.upstream.fetch_range(&descriptor, range).await {
                Ok(response) => {
                    self.metrics.record_upstream_fetch(true);
                    return Ok((response, descriptor));
                }
                Err(e) if e.triggers_reresolve() && attempt < MAX_FETCH_ATTEMPTS => {
                    self.metrics.record_upstream_fetch(false);
                    self.metrics.record_reresolution();
                    info!(
                        "Upstream link rejected, re-resolving: id={} range={}-{} attempt={} error={}",
                        id, range.start, range.end, attempt, e
                    );
                    self.resolver.invalidate_stale(id, &descriptor);
                    descriptor = self.resolver.resolve(id).await?;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.record_upstream_fetch(false);
                    warn!(
                        "Upstream fetch failed: id={} range={}-{} attempt={} error={}",
                        id, range.start, range.end, attempt, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Extend the buffer past its end in the background
    ///
    /// Does nothing when a fill is running, the buffer is empty, or it already
    /// reaches the end of the resource. Failures only leave the buffer smaller.
    fn schedule_read_ahead(
        &self,
        buffer: &Arc<ResourceBuffer>,
        descriptor: Arc<SourceDescriptor>,
        window: u64,
    ) {
        let Some(ticket) = buffer.begin_read_ahead(descriptor.total_length) else {
            return;
        };
        let end = (ticket.start + window).min(descriptor.total_length) - 1;
        let Ok(range) = ByteRange::new(ticket.start, end) else {
            buffer.finish_fill(&ticket);
            return;
        };

        debug!(
            "Read-ahead scheduled: id={} range={}-{}",
            buffer.id(),
            range.start,
            range.end
        );
        self.metrics.record_read_ahead_started();

        let relay = self.clone();
        let task_buffer = Arc::clone(buffer);
        let task = tokio::spawn(async move {
            relay.read_ahead(task_buffer, descriptor, ticket, range).await;
        });
        buffer.attach_fill_task(&ticket, task.abort_handle());
    }

    async fn read_ahead(
        &self,
        buffer: Arc<ResourceBuffer>,
        descriptor: Arc<SourceDescriptor>,
        ticket: FillTicket,
        range: ByteRange,
    ) {
        let id = buffer.id().to_string();
        let response = match self.fetch_with_reresolve(&id, descriptor, &range).await {
            Ok((response, _)) => response,
            Err(e) => {
                debug!(
                    "Read-ahead failed: id={} range={}-{} error={}",
                    id, range.start, range.end, e
                );
                self.metrics.record_read_ahead_failed();
                buffer.finish_fill(&ticket);
                return;
            }
        };

        let skip = if response.status() == reqwest::StatusCode::OK {
            range.start
        } else {
            0
        };
        let outcome = pump_upstream(
            response,
            PumpPlan {
                skip,
                limit: range.size(),
            },
            Arc::clone(&buffer),
            ticket,
            ClientSink::detached(),
            Arc::clone(&self.metrics),
        )
        .await;

        if !outcome.completed {
            self.metrics.record_read_ahead_failed();
        }
    }
}
