//! Fan-out of one upstream body to a client and a buffer
//!
//! A single reader pulls chunks from upstream. Each chunk is appended to the
//! resource buffer (unbounded, guarded by the fill ticket) and offered to a
//! [`ClientSink`] that forwards only the bytes the client asked for.

use crate::buffer::{FillTicket, ResourceBuffer};
use crate::metrics::RelayMetrics;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Chunks queued towards a client before upstream reads wait for it
pub const CLIENT_CHANNEL_CAPACITY: usize = 16;

/// Byte-counting writer in front of a client body channel
///
/// Closes once `budget` bytes were forwarded or the receiving side went away.
#[derive(Debug)]
pub struct ClientSink {
    tx: Option<mpsc::Sender<Bytes>>,
    remaining: u64,
    sent: u64,
}

impl ClientSink {
    pub fn new(tx: mpsc::Sender<Bytes>, budget: u64) -> Self {
        ClientSink {
            tx: if budget > 0 { Some(tx) } else { None },
            remaining: budget,
            sent: 0,
        }
    }

    /// Sink with no client attached (background read-ahead)
    pub fn detached() -> Self {
        ClientSink {
            tx: None,
            remaining: 0,
            sent: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Bytes the client still expects
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Bytes forwarded so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Forward up to the remaining budget of `chunk`; returns the bytes forwarded
    pub async fn offer(&mut self, chunk: &Bytes) -> u64 {
        let Some(tx) = &self.tx else {
            return 0;
        };
        if chunk.is_empty() {
            return 0;
        }

        let take = (chunk.len() as u64).min(self.remaining);
        let piece = chunk.slice(..take as usize);
        if tx.send(piece).await.is_err() {
            debug!("Client went away after {} bytes", self.sent);
            self.tx = None;
            return 0;
        }

        self.sent += take;
        self.remaining -= take;
        if self.remaining == 0 {
            // Dropping the sender ends the client body
            self.tx = None;
        }
        take
    }
}

/// Which part of an upstream body belongs to the fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpPlan {
    /// Leading bytes to discard (upstream ignored the Range header)
    pub skip: u64,
    /// Bytes to accept after `skip`
    pub limit: u64,
}

/// Totals for one pump run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    pub bytes_received: u64,
    pub bytes_buffered: u64,
    pub bytes_to_client: u64,
    /// Upstream body ended or the plan's limit was reached
    pub completed: bool,
}

/// Source of upstream body chunks
#[async_trait::async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Bytes>, String>;
}

#[async_trait::async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Bytes>, String> {
        self.chunk().await.map_err(|e| e.to_string())
    }
}

/// Read `source` to the end of `plan`, feeding both the buffer and the client
///
/// Buffer writes stop as soon as `ticket` is superseded; reading then
/// continues only while the client still needs bytes. A client that goes away
/// does not stop the buffer fill. The ticket's fill is finished on return.
pub async fn pump_upstream<S: ChunkSource>(
    mut source: S,
    plan: PumpPlan,
    buffer: Arc<ResourceBuffer>,
    ticket: FillTicket,
    mut sink: ClientSink,
    metrics: Arc<RelayMetrics>,
) -> PumpOutcome {
    let mut outcome = PumpOutcome::default();
    let mut to_skip = plan.skip;
    let mut accepted = 0u64;
    let mut buffering = true;

    while accepted < plan.limit {
        if !buffering && sink.is_closed() {
            break;
        }

        let chunk = match source.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                outcome.completed = true;
                break;
            }
            Err(e) => {
                warn!(
                    "Upstream read failed: id={} range={}-{} after {} bytes: {}",
                    buffer.id(),
                    ticket.start,
                    ticket.start + plan.limit.saturating_sub(1),
                    accepted,
                    e
                );
                break;
            }
        };

        outcome.bytes_received += chunk.len() as u64;
        metrics.record_bytes_from_upstream(chunk.len() as u64);

        let mut chunk = chunk;
        if to_skip > 0 {
            let skipped = to_skip.min(chunk.len() as u64);
            to_skip -= skipped;
            chunk = chunk.slice(skipped as usize..);
        }
        let take = (chunk.len() as u64).min(plan.limit - accepted);
        if take == 0 {
            continue;
        }
        let chunk = chunk.slice(..take as usize);
        accepted += take;

        if buffering {
            if buffer.append(&ticket, chunk.clone()) {
                outcome.bytes_buffered += take;
            } else {
                debug!(
                    "Fill superseded: id={} start={}, serving client only",
                    buffer.id(),
                    ticket.start
                );
                buffering = false;
            }
        }

        outcome.bytes_to_client += sink.offer(&chunk).await;
    }

    if accepted >= plan.limit {
        outcome.completed = true;
    }
    buffer.finish_fill(&ticket);
    metrics.record_bytes_to_client(outcome.bytes_to_client);

    debug!(
        "Pump finished: id={} start={} received={} buffered={} to_client={} completed={}",
        buffer.id(),
        ticket.start,
        outcome.bytes_received,
        outcome.bytes_buffered,
        outcome.bytes_to_client,
        outcome.completed
    );
    outcome
}
