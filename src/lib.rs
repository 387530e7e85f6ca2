//! Audio Relay
//!
//! An HTTP relay that serves byte ranges of remote audio resources whose
//! upstream links are short-lived. Each resource keeps an in-memory read-ahead
//! window so consecutive range requests from a player are answered without a
//! new upstream fetch.
//!
//! # Overview
//!
//! A client asks for `/stream/{id}` with an optional `Range` header. The relay
//! resolves the identifier to a source descriptor by running an external
//! extractor, caches that descriptor for hours, and then either serves the
//! range from the resource's buffer or fetches a larger window from upstream,
//! streaming the requested part to the client while storing everything in
//! the buffer.
//!
//! # Features
//!
//! - **Read-ahead buffering**: one bounded window per resource, trimmed from the front
//! - **Seek handling**: a start outside the window resets the buffer
//! - **Link expiry recovery**: upstream 401/403 re-resolves and retries once
//! - **Idle eviction**: per-buffer idle timers plus a periodic registry sweep
//! - **Metrics**: atomic counters exported in Prometheus text format
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use audio_relay::{RangeRelay, RelayConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::from_file("audio_relay.yaml")?;
//! let relay = RangeRelay::with_process_runner(config)?;
//! relay.start();
//!
//! let response = relay.serve("dQw4w9WgXcQ", Some("bytes=0-1023")).await?;
//! println!("status: {}", response.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`IdentifierValidator`]: rejects malformed identifiers before any external call
//! - [`SourceResolver`]: runs the extractor through a [`CommandRunner`] and caches descriptors
//! - [`ResourceBuffer`]: per-resource byte window with single-writer fill tickets
//! - [`BufferRegistry`]: identifier to buffer map with a periodic sweep
//! - [`RangeRelay`]: the per-request state machine
//! - [`RelayServer`]: hyper HTTP/1 front end
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "127.0.0.1:3001"
//! extractor_program: "yt-dlp"
//! descriptor_ttl_secs: 14400         # 4 hours
//! initial_chunk_bytes: 2097152       # 2MB
//! read_ahead_bytes: 5242880          # 5MB
//! max_buffer_bytes: 52428800         # 50MB
//! low_water_bytes: 1048576           # 1MB
//! buffer_idle_ttl_secs: 60
//! sweep_interval_secs: 120
//! ```
//!
//! See [`RelayConfig`] for every option.

pub mod buffer;
pub mod command;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod splitter;
pub mod upstream;
pub mod validator;

// Re-export commonly used types
pub use buffer::{BufferSettings, BufferStats, BufferWindow, FillTicket, ResourceBuffer};
pub use command::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigChanges, RelayConfig};
pub use error::{RelayError, Result};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use models::{ByteRange, RangeRequest, SourceDescriptor};
pub use registry::BufferRegistry;
pub use relay::{RangeRelay, RelayBody, RelayResponse, ServePlan};
pub use resolver::{ResolverSettings, SourceResolver};
pub use server::{ChannelBody, RelayServer};
pub use upstream::UpstreamClient;
pub use validator::IdentifierValidator;
