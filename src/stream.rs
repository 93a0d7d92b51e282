//! Stream connections: poll an [`OutputSource`] and push SSE frames.
//!
//! Each open connection is one tokio task driving a single interval timer.
//! The task and the connection share exactly one [`CancellationToken`]; every
//! way a connection can end (source failure, explicit close, client
//! disconnect, server shutdown) goes through that token. Cancelling twice is
//! a no-op.
//!
//! ```text
//! Open ──▶ Polling ──▶ Closing ──▶ Closed
//! ```

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::protocol::{encode_comment, encode_event, StreamEvent, KEEP_ALIVE_COMMENT};
use crate::session::SessionName;
use crate::source::{Cursor, OutputSource};

/// Default delay between two polls of the output source.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default silence after which a keep-alive comment is written.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum number of concurrently open stream connections.
///
/// Each connection costs one task and one source call per tick.
pub const MAX_STREAMS: usize = 256;

/// Frames buffered between the poll task and the HTTP body.
const FRAME_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub max_streams: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_streams: MAX_STREAMS,
        }
    }
}

/// Lifecycle of one stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created; the poll task has not started yet.
    Open,
    /// The timer is running and each tick queries the source.
    Polling,
    /// The timer is cancelled; the task is flushing and exiting.
    Closing,
    /// The task has exited. No further frames will be produced.
    Closed,
}

#[derive(Debug, Error)]
#[error("too many open streams (max {0})")]
pub struct StreamLimitReached(pub usize);

/// Why a poll task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Cancelled,
    Disconnected,
    SourceFailed,
}

/// Opens and tracks stream connections.
///
/// Cheap to clone; clones share the source, the open-stream counter and the
/// shutdown token.
#[derive(Clone)]
pub struct StreamManager {
    source: Arc<dyn OutputSource>,
    config: StreamConfig,
    shutdown: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl StreamManager {
    pub fn new(source: Arc<dyn OutputSource>, config: StreamConfig) -> Self {
        Self {
            source,
            config,
            shutdown: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn OutputSource> {
        &self.source
    }

    /// Number of connections whose poll task has not exited yet.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Close every open connection and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Open a connection for `session` and start polling.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// [`EventStream`] is the transport-close notification: it cancels the
    /// connection immediately.
    pub fn open_stream(
        &self,
        session: SessionName,
    ) -> Result<(StreamHandle, EventStream), StreamLimitReached> {
        let guard = self.admit()?;
        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        if self.shutdown.is_cancelled() {
            state_tx.send_replace(ConnectionState::Closed);
        } else {
            let conn = Connection {
                id,
                session: session.clone(),
                cursor: Cursor::start(),
                source: Arc::clone(&self.source),
                config: self.config.clone(),
                cancel: cancel.clone(),
                frames: frame_tx,
                state: state_tx,
                _guard: guard,
            };
            tokio::spawn(conn.run());
        }

        tracing::debug!(%id, session = %session, "stream opened");
        let handle = StreamHandle {
            id,
            session,
            cancel: cancel.clone(),
            state: state_rx,
        };
        let stream = EventStream {
            frames: ReceiverStream::new(frame_rx),
            _close_on_drop: cancel.drop_guard(),
        };
        Ok((handle, stream))
    }

    fn admit(&self) -> Result<StreamGuard, StreamLimitReached> {
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current >= self.config.max_streams {
                return Err(StreamLimitReached(self.config.max_streams));
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(StreamGuard {
                    counter: Arc::clone(&self.active),
                });
            }
        }
    }
}

/// RAII guard that decrements the open-stream count on drop.
struct StreamGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

/// Control side of an open connection.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: Uuid,
    session: SessionName,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
}

impl StreamHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &SessionName {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Stop the connection. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the poll task has exited.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

/// Encoded SSE frames for one connection, suitable as an HTTP body.
///
/// Ends after an `agent_error` frame or when the connection is closed.
pub struct EventStream {
    frames: ReceiverStream<Bytes>,
    _close_on_drop: DropGuard,
}

impl Stream for EventStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames)
            .poll_next(cx)
            .map(|frame| frame.map(Ok))
    }
}

struct Connection {
    id: Uuid,
    session: SessionName,
    cursor: Cursor,
    source: Arc<dyn OutputSource>,
    config: StreamConfig,
    cancel: CancellationToken,
    frames: mpsc::Sender<Bytes>,
    state: watch::Sender<ConnectionState>,
    _guard: StreamGuard,
}

impl Connection {
    async fn run(mut self) {
        self.state.send_replace(ConnectionState::Polling);

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_write = Instant::now();

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break CloseReason::Cancelled,
                _ = ticker.tick() => {}
            }

            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break CloseReason::Cancelled,
                polled = self.source.read_since(&self.session, &self.cursor) => polled,
            };

            match polled {
                Ok(Some(capture)) => {
                    self.cursor = capture.cursor;
                    let event = StreamEvent::AgentOutput {
                        session: self.session.to_string(),
                        chunk: capture.chunk,
                    };
                    if !self.send(encode_event(&event)).await {
                        break CloseReason::Disconnected;
                    }
                    last_write = Instant::now();
                }
                Ok(None) => {
                    if last_write.elapsed() >= self.config.heartbeat_interval {
                        if !self.send(encode_comment(KEEP_ALIVE_COMMENT)).await {
                            break CloseReason::Disconnected;
                        }
                        last_write = Instant::now();
                    }
                }
                Err(err) => {
                    tracing::warn!(id = %self.id, session = %self.session, error = %err, "output source failed, closing stream");
                    self.state.send_replace(ConnectionState::Closing);
                    let event = StreamEvent::AgentError {
                        session: self.session.to_string(),
                        message: err.to_string(),
                    };
                    self.send(encode_event(&event)).await;
                    break CloseReason::SourceFailed;
                }
            }
        };

        self.state.send_replace(ConnectionState::Closing);
        drop(ticker);
        // Terminal errors and explicit closes both leave the token cancelled.
        self.cancel.cancel();
        tracing::debug!(id = %self.id, session = %self.session, ?reason, delivered = self.cursor.seq(), "stream closed");
        let Connection { frames, state, _guard, .. } = self;
        drop(frames);
        drop(_guard);
        state.send_replace(ConnectionState::Closed);
    }

    /// Queue a frame for the client. Returns `false` once the client is gone
    /// or the connection was cancelled.
    async fn send(&self, frame: Bytes) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.frames.send(frame) => sent.is_ok(),
        }
    }
}
