//! Streaming client for the agent output endpoint.
//!
//! [`subscribe`] opens `GET /agents/{name}/stream`, decodes the event stream
//! and hands each event to the callback registered for its [`EventKind`].
//! Dropped connections are retried per [`ReconnectPolicy`]; an `agent_error`
//! event or a 4xx response ends the subscription for good.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::protocol::{decode_event, EventKind, FrameDecoder, ProtocolError, StreamEvent};
use crate::source::AgentSession;

/// Callback invoked for each event of one kind.
pub type Handler = Box<dyn FnMut(&StreamEvent) + Send>;

/// Dispatch table from event kind to callback.
#[derive(Default)]
pub struct Handlers {
    table: HashMap<EventKind, Handler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any earlier one.
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: FnMut(&StreamEvent) + Send + 'static,
    {
        self.table.insert(kind, Box::new(handler));
        self
    }

    /// Run the handler for the event's kind. Returns `false` if none is
    /// registered.
    pub fn dispatch(&mut self, event: &StreamEvent) -> bool {
        match self.table.get_mut(&event.kind()) {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}

/// Bounded exponential backoff between reconnection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnects tried after a drop before giving up. Zero disables
    /// reconnection.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1)`, applied symmetrically.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before reconnect `attempt` (1-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before reconnect `attempt` (1-based), jittered and capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        nominal.mul_f64(factor).min(self.max_delay)
    }
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The server reported a terminal `agent_error`.
    ServerError { message: String },
    /// [`Subscription::unsubscribe`] was called or the handle dropped.
    Unsubscribed,
    /// The server refused the stream with a 4xx status.
    Rejected { status: u16 },
    /// Every reconnect attempt failed.
    RetriesExhausted { attempts: u32 },
}

/// Reasons a single connection was lost.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("stream ended without a terminal event")]
    UnexpectedEof,
}

/// Handle on a running subscription.
pub struct Subscription {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    end: watch::Receiver<Option<SubscriptionEnd>>,
}

struct Shared {
    closed: AtomicBool,
    handlers: Mutex<Handlers>,
}

impl Shared {
    /// Dispatch one event unless the subscription is closed. Returns `false`
    /// once closed.
    fn dispatch(&self, event: &StreamEvent) -> bool {
        let mut handlers = self.handlers.lock();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if !handlers.dispatch(event) {
            tracing::trace!(kind = event.kind().as_str(), "no handler registered");
        }
        true
    }
}

impl Subscription {
    /// Stop the subscription.
    ///
    /// When this returns no handler is running and none will run again, even
    /// for events already received. Must not be called from inside a handler.
    pub fn unsubscribe(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        // Wait out a handler that is mid-dispatch.
        drop(self.shared.handlers.lock());
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Wait for the subscription to end.
    pub async fn finished(&self) -> SubscriptionEnd {
        let mut rx = self.end.clone();
        // Bound to a local so the borrow of `rx` ends before `rx` drops.
        let end = match rx.wait_for(Option::is_some).await {
            Ok(end) => end.clone().unwrap_or(SubscriptionEnd::Unsubscribed),
            // The task is gone without reporting, which only happens on panic.
            Err(_) => SubscriptionEnd::Unsubscribed,
        };
        end
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// URL of the stream endpoint for `session` under `base`.
pub fn stream_url(base: &str, session: &str) -> String {
    format!("{}/agents/{}/stream", base.trim_end_matches('/'), session)
}

#[derive(Deserialize)]
struct AgentList {
    agents: Vec<AgentSession>,
}

/// Fetch the sessions a server can stream.
pub async fn list_agents(
    client: &reqwest::Client,
    base: &str,
) -> Result<Vec<AgentSession>, ClientError> {
    let response = client
        .get(format!("{}/agents", base.trim_end_matches('/')))
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Status(status.as_u16()));
    }
    Ok(response.json::<AgentList>().await?.agents)
}

/// Subscribe to an event stream endpoint. Must be called within a tokio
/// runtime.
pub fn subscribe(
    endpoint: impl Into<String>,
    handlers: Handlers,
    policy: ReconnectPolicy,
) -> Subscription {
    subscribe_with(reqwest::Client::new(), endpoint, handlers, policy)
}

/// Like [`subscribe`], reusing an existing HTTP client.
pub fn subscribe_with(
    client: reqwest::Client,
    endpoint: impl Into<String>,
    handlers: Handlers,
    policy: ReconnectPolicy,
) -> Subscription {
    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        handlers: Mutex::new(handlers),
    });
    let cancel = CancellationToken::new();
    let (end_tx, end_rx) = watch::channel(None);

    let task = Consumer {
        client,
        endpoint: endpoint.into(),
        shared: shared.clone(),
        policy,
        cancel: cancel.clone(),
    };
    tokio::spawn(async move {
        let end = task.run().await;
        tracing::debug!(endpoint = %task.endpoint, ?end, "subscription ended");
        let _ = end_tx.send(Some(end));
    });

    Subscription {
        shared,
        cancel,
        end: end_rx,
    }
}

/// Outcome of one connection.
enum Attempt {
    Ended(SubscriptionEnd),
    Dropped { delivered: bool, error: ClientError },
}

struct Consumer {
    client: reqwest::Client,
    endpoint: String,
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
}

impl Consumer {
    async fn run(&self) -> SubscriptionEnd {
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SubscriptionEnd::Unsubscribed,
                outcome = self.connect_once() => outcome,
            };

            let (delivered, error) = match outcome {
                Attempt::Ended(end) => return end,
                Attempt::Dropped { delivered, error } => (delivered, error),
            };
            if delivered {
                attempt = 0;
            }
            attempt += 1;
            if attempt > self.policy.max_attempts {
                tracing::warn!(endpoint = %self.endpoint, %error, "giving up on stream");
                return SubscriptionEnd::RetriesExhausted {
                    attempts: self.policy.max_attempts,
                };
            }

            let delay = self.policy.delay(attempt);
            tracing::info!(
                endpoint = %self.endpoint,
                %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "stream dropped, reconnecting"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SubscriptionEnd::Unsubscribed,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect_once(&self) -> Attempt {
        let dropped = |delivered: bool, error: ClientError| Attempt::Dropped { delivered, error };

        let response = match self
            .client
            .get(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return dropped(false, e.into()),
        };

        let status = response.status();
        if status.is_client_error() {
            return Attempt::Ended(SubscriptionEnd::Rejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return dropped(false, ClientError::Status(status.as_u16()));
        }

        let mut body = response.bytes_stream();
        let mut decoder = FrameDecoder::new();
        let mut delivered = false;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return dropped(delivered, e.into()),
            };
            let frames = match decoder.push(&chunk) {
                Ok(frames) => frames,
                Err(e) => return dropped(delivered, e.into()),
            };
            for frame in frames {
                let event = match decode_event(&frame) {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        tracing::trace!(event = ?frame.event, "ignoring unknown event type");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed event");
                        continue;
                    }
                };
                delivered = true;
                if !self.shared.dispatch(&event) {
                    return Attempt::Ended(SubscriptionEnd::Unsubscribed);
                }
                if let StreamEvent::AgentError { message, .. } = event {
                    return Attempt::Ended(SubscriptionEnd::ServerError { message });
                }
            }
        }

        dropped(delivered, ClientError::UnexpectedEof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(chunk: &str) -> StreamEvent {
        StreamEvent::AgentOutput {
            session: "build".into(),
            chunk: chunk.into(),
        }
    }

    #[test]
    fn handlers_dispatch_by_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handlers = Handlers::new().on(EventKind::AgentOutput, move |event| {
            if let StreamEvent::AgentOutput { chunk, .. } = event {
                sink.lock().push(chunk.clone());
            }
        });

        assert!(handlers.dispatch(&output("a")));
        assert!(handlers.dispatch(&output("b")));
        assert!(!handlers.dispatch(&StreamEvent::AgentError {
            session: "build".into(),
            message: "gone".into(),
        }));
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (hits.clone(), hits.clone());
        let mut handlers = Handlers::new()
            .on(EventKind::AgentOutput, move |_| first.lock().push(1))
            .on(EventKind::AgentOutput, move |_| second.lock().push(2));
        handlers.dispatch(&output("x"));
        assert_eq!(*hits.lock(), vec![2]);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.nominal_delay(1), Duration::from_millis(500));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(6), Duration::from_secs(10));
        assert_eq!(policy.nominal_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..=8 {
            let nominal = policy.nominal_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= nominal.mul_f64(0.8), "{delay:?} < 80% of {nominal:?}");
                assert!(delay <= nominal.mul_f64(1.2), "{delay:?} > 120% of {nominal:?}");
                assert!(delay <= policy.max_delay);
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay(2), Duration::from_secs(1));
    }

    #[test]
    fn stream_url_joins_base_and_session() {
        assert_eq!(
            stream_url("http://127.0.0.1:7681/", "build"),
            "http://127.0.0.1:7681/agents/build/stream"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let policy = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        };
        let subscription = subscribe(
            stream_url(&format!("http://127.0.0.1:{port}"), "build"),
            Handlers::new(),
            policy,
        );
        assert_eq!(
            subscription.finished().await,
            SubscriptionEnd::RetriesExhausted { attempts: 2 }
        );
    }

    #[tokio::test]
    async fn unsubscribe_ends_a_pending_subscription() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(30),
            ..ReconnectPolicy::default()
        };
        let subscription = subscribe(
            stream_url(&format!("http://127.0.0.1:{port}"), "build"),
            Handlers::new(),
            policy,
        );
        subscription.unsubscribe();
        assert!(subscription.is_closed());
        assert_eq!(subscription.finished().await, SubscriptionEnd::Unsubscribed);
    }

    #[tokio::test]
    async fn finished_reports_the_same_end_to_every_caller() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let subscription = subscribe(
            stream_url(&format!("http://127.0.0.1:{port}"), "build"),
            Handlers::new(),
            ReconnectPolicy::never(),
        );
        let (first, second) = tokio::join!(subscription.finished(), subscription.finished());
        assert_eq!(first, second);
        assert_eq!(subscription.finished().await, first);
    }
}
