//! Output sources: where stream connections pull agent output from.
//!
//! A source answers "what has this session printed since `cursor`?". The
//! production source shells out to tmux; tests plug in scripted sources.

use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::session::SessionName;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("session {0} no longer exists")]
    SessionGone(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with status {status:?}: {stderr}")]
    Command {
        command: &'static str,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unexpected output from source: {0}")]
    InvalidOutput(String),
}

impl SourceError {
    /// `true` when the backing session is gone rather than the source failing.
    pub fn is_session_gone(&self) -> bool {
        matches!(self, SourceError::SessionGone(_))
    }
}

/// Opaque marker of how much output a connection has already received.
///
/// `seq` counts the chunks delivered through this cursor. The rest is
/// continuation state owned by whichever source produced the cursor.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    seq: u64,
    lines: Option<Arc<[String]>>,
}

impl Cursor {
    /// Cursor for a connection that has not received anything yet.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Cursor positioned after one more delivered chunk.
    pub fn advance(&self) -> Self {
        Self {
            seq: self.seq + 1,
            lines: self.lines.clone(),
        }
    }

    fn advance_to(&self, lines: Arc<[String]>) -> Self {
        Self {
            seq: self.seq + 1,
            lines: Some(lines),
        }
    }
}

/// New output returned by a source, with the cursor that follows it.
#[derive(Debug, Clone)]
pub struct Capture {
    pub chunk: String,
    pub cursor: Cursor,
}

/// A session known to the source, as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub name: String,
    pub windows: u32,
    pub attached: bool,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
}

/// Pull-based access to agent output.
///
/// Implementations are shared by every open stream and must tolerate
/// concurrent calls for the same or different sessions.
pub trait OutputSource: Send + Sync {
    /// Output produced by `session` since `cursor`.
    ///
    /// `Ok(None)` means nothing new. `Ok(Some(_))` always carries a
    /// non-empty chunk.
    fn read_since<'a>(
        &'a self,
        session: &'a SessionName,
        cursor: &'a Cursor,
    ) -> BoxFuture<'a, Result<Option<Capture>, SourceError>>;

    /// Sessions currently available to stream.
    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>, SourceError>>;
}

/// Default number of scrollback lines captured per poll.
pub const DEFAULT_HISTORY_LINES: u32 = 2000;

/// Reads agent output from tmux panes with `capture-pane`.
#[derive(Debug, Clone)]
pub struct TmuxSource {
    program: String,
    history_lines: u32,
}

impl Default for TmuxSource {
    fn default() -> Self {
        Self::new("tmux", DEFAULT_HISTORY_LINES)
    }
}

impl TmuxSource {
    pub fn new(program: impl Into<String>, history_lines: u32) -> Self {
        Self {
            program: program.into(),
            history_lines: history_lines.max(1),
        }
    }

    async fn run(&self, command: &'static str, args: &[&str]) -> Result<String, SourceError> {
        let output = Command::new(&self.program)
            .arg(command)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SourceError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SourceError::Command {
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn capture(&self, session: &SessionName, cursor: &Cursor) -> Result<Option<Capture>, SourceError> {
        // `=` forces an exact session-name match instead of tmux's prefix matching.
        let target = format!("={}:", session.as_str());
        let start = format!("-{}", self.history_lines);
        // One invocation so the cursor position matches the captured screen.
        let stdout = self
            .run(
                "capture-pane",
                &[
                    "-p", "-J", "-t", &target, "-S", &start, ";",
                    "display-message", "-p", "-t", &target, CURSOR_FORMAT,
                ],
            )
            .await
            .map_err(|e| classify_missing(session, e))?;

        let (rows, cursor_pos) = split_capture(&stdout);
        if cursor_pos.is_none() {
            tracing::debug!(session = %session, "no cursor position in capture output");
        }
        let lines = complete_lines(rows, cursor_pos);
        let previous = cursor.lines.as_deref().unwrap_or(&[]);
        let fresh = lines_after(previous, &lines);
        if fresh.is_empty() {
            return Ok(None);
        }

        let mut chunk = fresh.join("\n");
        chunk.push('\n');
        tracing::trace!(session = %session, lines = fresh.len(), "captured new output");
        Ok(Some(Capture {
            chunk,
            cursor: cursor.advance_to(lines.into()),
        }))
    }

    async fn sessions(&self) -> Result<Vec<AgentSession>, SourceError> {
        let format = "#{session_name}\t#{session_windows}\t#{session_attached}\t#{session_created}";
        match self.run("list-sessions", &["-F", format]).await {
            Ok(stdout) => parse_session_list(&stdout),
            Err(SourceError::Command { stderr, .. }) if is_no_server(&stderr) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

impl OutputSource for TmuxSource {
    fn read_since<'a>(
        &'a self,
        session: &'a SessionName,
        cursor: &'a Cursor,
    ) -> BoxFuture<'a, Result<Option<Capture>, SourceError>> {
        Box::pin(self.capture(session, cursor))
    }

    fn list_sessions(&self) -> BoxFuture<'_, Result<Vec<AgentSession>, SourceError>> {
        Box::pin(self.sessions())
    }
}

fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting to")
}

fn classify_missing(session: &SessionName, err: SourceError) -> SourceError {
    match err {
        SourceError::Command { ref stderr, .. }
            if stderr.contains("can't find") || is_no_server(stderr) =>
        {
            SourceError::SessionGone(session.to_string())
        }
        other => other,
    }
}

/// `display-message` format appended to every capture.
const CURSOR_FORMAT: &str = "#{cursor_x} #{cursor_y} #{pane_height}";

/// Cursor position within the visible pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CursorPos {
    x: u32,
    y: u32,
    pane_height: u32,
}

/// Split combined capture output into screen rows and the trailing cursor
/// line. Rows keep tmux's blank padding so they can be indexed from the
/// bottom of the pane.
fn split_capture(stdout: &str) -> (Vec<&str>, Option<CursorPos>) {
    let body = stdout.strip_suffix('\n').unwrap_or(stdout);
    let (rows, status) = match body.rsplit_once('\n') {
        Some((rows, status)) => (Some(rows), status),
        None => (None, body),
    };
    let mut fields = status.split(' ').map(|f| f.trim().parse::<u32>().ok());
    let pos = match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(Some(x)), Some(Some(y)), Some(Some(pane_height)), None) => {
            Some(CursorPos { x, y, pane_height })
        }
        _ => None,
    };
    match (pos, rows) {
        (Some(pos), Some(rows)) => (rows.split('\n').collect(), Some(pos)),
        (Some(pos), None) => (Vec::new(), Some(pos)),
        (None, _) => (body.lines().collect(), None),
    }
}

/// Lines of a capture that are finished.
///
/// Trailing blank rows are padding. The cursor row is held back while the
/// cursor sits past its first column, since that row is still being written
/// (a prompt, a progress bar). Rows are counted from the bottom of the pane
/// because `-J` joins wrapped rows above the cursor.
fn complete_lines(rows: Vec<&str>, cursor: Option<CursorPos>) -> Vec<String> {
    let mut lines: Vec<String> = rows.into_iter().map(|l| l.trim_end().to_string()).collect();
    if let Some(pos) = cursor.filter(|pos| pos.x > 0) {
        let below = pos.pane_height.saturating_sub(1).saturating_sub(pos.y) as usize;
        if let Some(index) = lines.len().checked_sub(below + 1) {
            lines.remove(index);
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// The part of `current` not already covered by `previous`.
///
/// The two captures overlap where a suffix of `previous` equals a prefix of
/// `current`; the longest such overlap wins. With no overlap at all (screen
/// cleared, or more output than the history window) everything is new.
///
/// Content alone cannot tell a repeat from a scroll: if the window is full of
/// a repeating block and the same block is printed again, the captures are
/// identical and the repeat is not reported.
fn lines_after<'a>(previous: &[String], current: &'a [String]) -> &'a [String] {
    let Some(first) = current.first() else {
        return current;
    };
    let max = previous.len().min(current.len());
    for overlap in (1..=max).rev() {
        let tail = &previous[previous.len() - overlap..];
        // Cheap check first so the full comparison only runs on candidates.
        if &tail[0] == first && tail == &current[..overlap] {
            return &current[overlap..];
        }
    }
    current
}

fn parse_session_list(stdout: &str) -> Result<Vec<AgentSession>, SourceError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            let [name, windows, attached, created] = fields.as_slice() else {
                return Err(SourceError::InvalidOutput(line.to_string()));
            };
            let number = |value: &str| {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| SourceError::InvalidOutput(line.to_string()))
            };
            Ok(AgentSession {
                name: name.to_string(),
                windows: u32::try_from(number(*windows)?)
                    .map_err(|_| SourceError::InvalidOutput(line.to_string()))?,
                attached: number(*attached)? > 0,
                created: number(*created)?,
            })
        })
        .collect()
}
