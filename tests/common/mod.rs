#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentdash::api;
use agentdash::protocol::{decode_event, FrameDecoder, StreamEvent};
use agentdash::session::SessionName;
use agentdash::source::{AgentSession, Capture, Cursor, OutputSource, SourceError};
use agentdash::stream::{StreamConfig, StreamManager};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpListener;

/// What the fake source answers to one poll.
#[derive(Debug, Clone)]
pub enum Step {
    Output(String),
    Idle,
    Fail,
}

/// What the fake source answers once its script runs out.
#[derive(Debug, Clone, Copy)]
pub enum Exhausted {
    Idle,
    /// Emit `tick <n>` on every poll.
    Tick,
}

/// Scripted [`OutputSource`] that records every call.
pub struct FakeSource {
    script: Mutex<VecDeque<Step>>,
    exhausted: Exhausted,
    sessions: Vec<AgentSession>,
    calls: AtomicUsize,
    seqs: Mutex<Vec<u64>>,
}

impl FakeSource {
    pub fn new(script: Vec<Step>, exhausted: Exhausted) -> Arc<Self> {
        Self::with_sessions(script, exhausted, Vec::new())
    }

    pub fn with_sessions(
        script: Vec<Step>,
        exhausted: Exhausted,
        sessions: Vec<AgentSession>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            exhausted,
            sessions,
            calls: AtomicUsize::new(0),
            seqs: Mutex::new(Vec::new()),
        })
    }

    /// Outputs followed by a failure.
    pub fn outputs_then_fail(chunks: &[&str]) -> Arc<Self> {
        let mut script: Vec<Step> = chunks.iter().map(|c| Step::Output(c.to_string())).collect();
        script.push(Step::Fail);
        Self::new(script, Exhausted::Idle)
    }

    pub fn ticking() -> Arc<Self> {
        Self::new(Vec::new(), Exhausted::Tick)
    }

    pub fn idle() -> Arc<Self> {
        Self::new(Vec::new(), Exhausted::Idle)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Cursor sequence numbers seen by `read_since`, in call order.
    pub fn seen_seqs(&self) -> Vec<u64> {
        self.seqs.lock().clone()
    }
}

impl OutputSource for FakeSource {
    fn read_since<'a>(
        &'a self,
        session: &'a SessionName,
        cursor: &'a Cursor,
    ) -> BoxFuture<'a, Result<Option<Capture>, SourceError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seqs.lock().push(cursor.seq());
        let step = self.script.lock().pop_front();
        let step = step.unwrap_or_else(|| match self.exhausted {
            Exhausted::Idle => Step::Idle,
            Exhausted::Tick => Step::Output(format!("tick {call}\n")),
        });
        let result = match step {
            Step::Output(chunk) => Ok(Some(Capture {
                chunk,
                cursor: cursor.advance(),
            })),
            Step::Idle => Ok(None),
            Step::Fail => Err(SourceError::SessionGone(session.to_string())),
        };
        Box::pin(async move { result })
    }

    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>, SourceError>> {
        let sessions = self.sessions.clone();
        Box::pin(async move { Ok(sessions) })
    }
}

pub fn fast_config() -> StreamConfig {
    StreamConfig {
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(60),
        max_streams: 8,
    }
}

/// Serve `app` on an ephemeral port.
pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// Start the real router over `source`. Returns the manager for inspection.
pub async fn start_stream_server(
    source: Arc<FakeSource>,
    config: StreamConfig,
) -> (SocketAddr, StreamManager) {
    let streams = StreamManager::new(source, config);
    let app = api::router(
        api::AppState {
            streams: streams.clone(),
        },
        api::RouterConfig::default(),
    );
    (start_server(app).await, streams)
}

/// Decode every event in a complete SSE body.
pub fn decode_all(body: &[u8]) -> Vec<StreamEvent> {
    let mut decoder = FrameDecoder::new();
    decoder
        .push(body)
        .unwrap()
        .iter()
        .filter_map(|frame| decode_event(frame).unwrap())
        .collect()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
