//! Per-resource read-ahead buffer
//!
//! [`BufferWindow`] is the pure byte-window arithmetic: a contiguous run of
//! segments covering `[window_start, window_end]`, trimmed from the front when
//! it grows past its capacity.
//!
//! [`ResourceBuffer`] wraps a window with fill state, an idle timer and
//! registry membership. Writers must hold a [`FillTicket`]; starting a new fill
//! invalidates every older ticket, so at most one writer can extend the window
//! at a time and a cancelled fill can never append.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Map owned by the registry; buffers keep a weak reference to remove themselves
pub(crate) type BufferMap = RwLock<HashMap<String, Arc<ResourceBuffer>>>;

/// Contiguous in-memory window of resource bytes
#[derive(Debug, Clone)]
pub struct BufferWindow {
    start: u64,
    segments: VecDeque<Bytes>,
    total: u64,
    capacity: u64,
}

impl BufferWindow {
    /// Create an empty window positioned at 0
    pub fn new(capacity: u64) -> Self {
        BufferWindow {
            start: 0,
            segments: VecDeque::new(),
            total: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window_start(&self) -> u64 {
        self.start
    }

    /// Last buffered offset; equal to `window_start` when empty
    pub fn window_end(&self) -> u64 {
        if self.total == 0 {
            self.start
        } else {
            self.start + self.total - 1
        }
    }

    pub fn total_buffered(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Whether `[a, b]` can be served from memory
    pub fn covers(&self, a: u64, b: u64) -> bool {
        self.total > 0 && a <= b && a >= self.start && b <= self.window_end()
    }

    /// Whether a new start position continues the current window
    ///
    /// An empty window continues only at its own start, where the next
    /// append will land.
    pub fn is_contiguous(&self, s: u64) -> bool {
        if self.total == 0 {
            return s == self.start;
        }
        s >= self.start && s <= self.window_end()
    }

    /// Bytes available from `pos` to the end of the window, 0 if outside
    pub fn remaining_from(&self, pos: u64) -> u64 {
        if self.total == 0 || pos < self.start || pos > self.window_end() {
            0
        } else {
            self.window_end() - pos + 1
        }
    }

    /// Copy out `[a, b]`; `None` unless `covers(a, b)`
    ///
    /// A range inside one segment is returned without copying.
    pub fn slice(&self, a: u64, b: u64) -> Option<Bytes> {
        if !self.covers(a, b) {
            return None;
        }

        let mut skip = (a - self.start) as usize;
        let mut needed = (b - a + 1) as usize;
        let mut iter = self.segments.iter();

        // Find the first segment containing `a`
        let first = loop {
            let segment = iter.next()?;
            if skip < segment.len() {
                break segment;
            }
            skip -= segment.len();
        };

        if skip + needed <= first.len() {
            return Some(first.slice(skip..skip + needed));
        }

        let mut out = BytesMut::with_capacity(needed);
        out.extend_from_slice(&first[skip..]);
        needed -= first.len() - skip;
        for segment in iter {
            if needed == 0 {
                break;
            }
            let take = needed.min(segment.len());
            out.extend_from_slice(&segment[..take]);
            needed -= take;
        }
        Some(out.freeze())
    }

    /// Extend the window forward, trimming the oldest bytes past capacity
    pub fn append(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.total += bytes.len() as u64;
        self.segments.push_back(bytes);
        self.trim();
    }

    /// Discard all contents and reposition the (empty) window at `new_start`
    pub fn reset(&mut self, new_start: u64) {
        self.segments.clear();
        self.total = 0;
        self.start = new_start;
    }

    /// Keep `[window_start, pos)` and drop everything from `pos` on
    ///
    /// Positions at or before `window_start` empty the window at `pos`;
    /// positions past the end leave it unchanged.
    pub fn truncate_from(&mut self, pos: u64) {
        if pos <= self.start {
            self.reset(pos);
            return;
        }
        if pos > self.window_end() {
            return;
        }

        let mut keep = (pos - self.start) as usize;
        let mut kept = VecDeque::with_capacity(self.segments.len());
        while keep > 0 {
            let Some(segment) = self.segments.pop_front() else {
                break;
            };
            if segment.len() <= keep {
                keep -= segment.len();
                kept.push_back(segment);
            } else {
                kept.push_back(segment.slice(..keep));
                keep = 0;
            }
        }
        self.segments = kept;
        self.total = pos - self.start;
    }

    fn trim(&mut self) {
        while self.total > self.capacity && self.segments.len() > 1 {
            if let Some(removed) = self.segments.pop_front() {
                self.total -= removed.len() as u64;
                self.start += removed.len() as u64;
            }
        }

        // A single segment larger than capacity keeps only its tail
        if self.total > self.capacity {
            let excess = self.total - self.capacity;
            if let Some(front) = self.segments.front_mut() {
                *front = front.slice(excess as usize..);
                self.total -= excess;
                self.start += excess;
            }
        }
    }
}

/// Settings shared by every buffer of a registry
#[derive(Debug, Clone, Copy)]
pub struct BufferSettings {
    /// Maximum bytes held per resource
    pub capacity: u64,
    /// Inactivity after which the buffer destroys itself
    pub idle_ttl: Duration,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            capacity: 50 * 1024 * 1024,
            idle_ttl: Duration::from_secs(60),
        }
    }
}

/// Write permission for one fill of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    generation: u64,
    /// Offset of the first byte this fill will append
    pub start: u64,
}

/// Outcome of [`ResourceBuffer::begin_fill_at`]
#[derive(Debug, Clone, Copy)]
pub struct FillStarted {
    pub ticket: FillTicket,
    /// The start was outside the window, so the buffer was discarded (a seek)
    pub was_reset: bool,
    /// The buffer was already destroyed; appends under this ticket are refused
    pub destroyed: bool,
}

/// Point-in-time view of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub window_start: u64,
    pub window_end: u64,
    pub total_buffered: u64,
    pub filling: bool,
}

struct BufferState {
    window: BufferWindow,
    generation: u64,
    filling: bool,
    fill_abort: Option<AbortHandle>,
    idle_timer: Option<AbortHandle>,
    destroyed: bool,
}

impl BufferState {
    /// Invalidate outstanding tickets and stop any background fill task
    fn cancel_fill(&mut self) {
        self.generation += 1;
        self.filling = false;
        if let Some(handle) = self.fill_abort.take() {
            handle.abort();
        }
    }
}

/// Read-ahead buffer for one resource identifier
pub struct ResourceBuffer {
    id: String,
    settings: BufferSettings,
    state: Mutex<BufferState>,
    registry: Weak<BufferMap>,
    self_ref: Weak<ResourceBuffer>,
}

impl ResourceBuffer {
    /// Create a standalone buffer that belongs to no registry
    pub fn new(id: impl Into<String>, settings: BufferSettings) -> Arc<Self> {
        Self::with_registry(id.into(), settings, Weak::new())
    }

    pub(crate) fn with_registry(
        id: String,
        settings: BufferSettings,
        registry: Weak<BufferMap>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ResourceBuffer {
            id,
            settings,
            state: Mutex::new(BufferState {
                window: BufferWindow::new(settings.capacity),
                generation: 0,
                filling: false,
                fill_abort: None,
                idle_timer: None,
                destroyed: false,
            }),
            registry,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Every mutation leaves the window consistent, so poisoning is recoverable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn covers(&self, a: u64, b: u64) -> bool {
        self.lock().window.covers(a, b)
    }

    pub fn is_contiguous(&self, s: u64) -> bool {
        self.lock().window.is_contiguous(s)
    }

    pub fn remaining_from(&self, pos: u64) -> u64 {
        self.lock().window.remaining_from(pos)
    }

    /// Bytes `[a, b]` if currently held in memory
    pub fn slice(&self, a: u64, b: u64) -> Option<Bytes> {
        self.lock().window.slice(a, b)
    }

    pub fn is_filling(&self) -> bool {
        self.lock().filling
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Empty and not filling: a candidate for the registry sweep
    pub fn is_idle_and_empty(&self) -> bool {
        let state = self.lock();
        state.window.is_empty() && !state.filling
    }

    pub fn snapshot(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            window_start: state.window.window_start(),
            window_end: state.window.window_end(),
            total_buffered: state.window.total_buffered(),
            filling: state.filling,
        }
    }

    /// Start a fill whose first byte is `start`
    ///
    /// Cancels any fill in progress. If `start` continues the window, bytes
    /// before it are kept and everything from `start` on is dropped; otherwise
    /// the buffer is reset at `start`.
    pub fn begin_fill_at(&self, start: u64) -> FillStarted {
        let mut state = self.lock();
        state.cancel_fill();

        let was_reset = !state.window.is_contiguous(start);
        if was_reset {
            state.window.reset(start);
        } else {
            state.window.truncate_from(start);
        }
        state.filling = !state.destroyed;

        FillStarted {
            ticket: FillTicket {
                generation: state.generation,
                start,
            },
            was_reset,
            destroyed: state.destroyed,
        }
    }

    /// Start a read-ahead fill that extends the window past its end
    ///
    /// Returns `None` when a fill is already running, the buffer is empty or
    /// destroyed, or the window already reaches `total_length`.
    pub fn begin_read_ahead(&self, total_length: u64) -> Option<FillTicket> {
        let mut state = self.lock();
        if state.destroyed || state.filling || state.window.is_empty() {
            return None;
        }
        let next = state.window.window_end() + 1;
        if next >= total_length {
            return None;
        }
        state.cancel_fill();
        state.filling = true;
        Some(FillTicket {
            generation: state.generation,
            start: next,
        })
    }

    /// Register the task driving `ticket`'s fill so it can be aborted
    ///
    /// A task whose ticket is already stale is aborted immediately.
    pub fn attach_fill_task(&self, ticket: &FillTicket, handle: AbortHandle) {
        let mut state = self.lock();
        if state.generation == ticket.generation && !state.destroyed {
            state.fill_abort = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Whether `ticket` still owns the buffer
    pub fn is_current(&self, ticket: &FillTicket) -> bool {
        let state = self.lock();
        !state.destroyed && state.generation == ticket.generation
    }

    /// Append bytes for `ticket`'s fill; false once the ticket is stale
    pub fn append(&self, ticket: &FillTicket, bytes: Bytes) -> bool {
        let mut state = self.lock();
        if state.destroyed || state.generation != ticket.generation {
            return false;
        }
        state.window.append(bytes);
        true
    }

    /// Mark `ticket`'s fill as finished
    pub fn finish_fill(&self, ticket: &FillTicket) {
        let mut state = self.lock();
        if state.generation == ticket.generation {
            state.filling = false;
            state.fill_abort = None;
        }
    }

    /// Cancel any fill and discard contents, repositioning at `new_start`
    pub fn reset(&self, new_start: u64) {
        let mut state = self.lock();
        state.cancel_fill();
        state.window.reset(new_start);
    }

    /// Extend the idle deadline; false if the buffer is already destroyed
    ///
    /// Outside a tokio runtime no timer is armed.
    pub fn touch(&self) -> bool {
        let mut state = self.lock();
        if state.destroyed {
            return false;
        }
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak = self.self_ref.clone();
            let ttl = self.settings.idle_ttl;
            let task = runtime.spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(buffer) = weak.upgrade() {
                    debug!("Idle timeout reached: id={}", buffer.id());
                    buffer.destroy();
                }
            });
            state.idle_timer = Some(task.abort_handle());
        }
        true
    }

    /// Cancel fills, free memory and leave the registry; idempotent
    pub fn destroy(&self) {
        {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.cancel_fill();
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            state.window = BufferWindow::new(self.settings.capacity);
        }

        if let Some(map) = self.registry.upgrade() {
            if let Ok(mut buffers) = map.write() {
                let is_self = buffers
                    .get(&self.id)
                    .map(|entry| std::ptr::eq(Arc::as_ptr(entry), self))
                    .unwrap_or(false);
                if is_self {
                    buffers.remove(&self.id);
                }
            }
        }
        info!("Destroyed buffer: id={}", self.id);
    }
}

impl std::fmt::Debug for ResourceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBuffer")
            .field("id", &self.id)
            .field("stats", &self.snapshot())
            .finish()
    }
}
