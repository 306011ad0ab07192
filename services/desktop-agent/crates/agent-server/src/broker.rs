//! Per-connection message broker.
//!
//! Each WebSocket gets one task running a `select!` loop over inbound frames
//! and the run events of its current scan. Events are only ever written to
//! the connection that started the scan.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use desktop_agent_common::{
    ClientCommand, ErrorReason, OutputStream, ProtocolError, ServerEvent, validate_target,
};
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::error::CommandError;
use crate::runner::{RunEvent, Termination};
use crate::session::{LineAdmission, ScanSession, SessionState};
use crate::state::AppState;

/// Outbound events buffered per connection before producers wait.
const OUTBOUND_QUEUE: usize = 256;

const WELCOME_MESSAGE: &str = "Desktop Agent connected";

// ===================================================================
// Rate limiting
// ===================================================================

/// Sliding-window counter of inbound messages.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    recent: VecDeque<Instant>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            recent: VecDeque::new(),
        }
    }

    /// Record a message at `now`; false when it exceeds the budget.
    /// Rejected messages do not consume budget.
    pub fn check(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.recent.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.limit {
            return false;
        }
        self.recent.push_back(now);
        true
    }
}

// ===================================================================
// Keepalive
// ===================================================================

/// What the keepalive timer asks of the connection loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a ping; the client now owes a pong.
    Ping,
    /// The client did not answer in time.
    Expired,
}

/// Ping schedule for one connection. Any inbound frame counts as an answer.
#[derive(Debug)]
pub struct Keepalive {
    ticker: tokio::time::Interval,
    timeout: Duration,
    outstanding: Option<tokio::time::Instant>,
}

impl Keepalive {
    #[must_use]
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            timeout,
            outstanding: None,
        }
    }

    /// Resolves when the next ping is due or the pending one expires.
    /// Cancel safe.
    pub async fn next(&mut self) -> Beat {
        if let Some(sent) = self.outstanding {
            tokio::time::sleep_until(sent + self.timeout).await;
            return Beat::Expired;
        }
        self.ticker.tick().await;
        self.outstanding = Some(tokio::time::Instant::now());
        Beat::Ping
    }

    pub fn heard(&mut self) {
        if self.outstanding.take().is_some() {
            self.ticker.reset();
        }
    }
}

// ===================================================================
// Connection entry point
// ===================================================================

/// Drive one upgraded WebSocket until the client goes away.
pub async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let Some(id) = state.register(peer).await else {
        tracing::warn!(%peer, max = state.config.max_connections, "connection limit reached; rejecting");
        let frame = CloseFrame {
            code: close_code::AGAIN,
            reason: Utf8Bytes::from_static("too many connections"),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    };
    tracing::info!(connection_id = id, %peer, "client connected");

    let (sink, mut inbound) = socket.split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(sink, outbound_rx));

    let mut ctx = ConnectionContext::new(id, Arc::clone(&state), outbound);
    ctx.send(ServerEvent::Welcome {
        message: WELCOME_MESSAGE.to_string(),
        connection_id: id,
        available_tools: state.registry.names(),
    })
    .await;

    let mut keepalive = Keepalive::new(state.config.ping_interval(), state.config.ping_timeout());
    loop {
        tokio::select! {
            frame = inbound.next() => {
                keepalive.heard();
                match frame {
                    Some(Ok(Message::Text(text))) => ctx.on_text(text.as_str()).await,
                    Some(Ok(Message::Binary(bytes))) => ctx.on_binary(&bytes).await,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = id, error = %e, "websocket receive failed");
                        break;
                    }
                }
            }
            event = ctx.next_run_event() => ctx.on_run_event(event).await,
            beat = keepalive.next() => match beat {
                Beat::Ping => ctx.ping().await,
                Beat::Expired => {
                    tracing::warn!(connection_id = id, %peer, "client missed keepalive; dropping connection");
                    break;
                }
            },
        }
    }

    ctx.disconnect().await;
    drop(ctx);
    let _ = writer.await;
    tracing::info!(connection_id = id, %peer, "client disconnected");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

// ===================================================================
// Connection context
// ===================================================================

/// Everything one connection owns: its outbound queue, its rate-limit
/// window, and at most one scan session.
pub struct ConnectionContext {
    id: u64,
    state: Arc<AppState>,
    outbound: mpsc::Sender<Message>,
    limiter: RateLimiter,
    session: Option<ScanSession>,
}

impl ConnectionContext {
    #[must_use]
    pub fn new(id: u64, state: Arc<AppState>, outbound: mpsc::Sender<Message>) -> Self {
        let limiter = RateLimiter::new(
            state.config.rate_limit_requests,
            state.config.rate_limit_window(),
        );
        Self {
            id,
            state,
            outbound,
            limiter,
            session: None,
        }
    }

    /// Queue one event for the client. A closed queue means the writer is
    /// gone and the read loop is about to end.
    pub async fn send(&self, event: ServerEvent) {
        match event.to_json() {
            Ok(json) => {
                let _ = self.outbound.send(Message::Text(json.into())).await;
            }
            Err(e) => {
                tracing::error!(connection_id = self.id, error = %e, "failed to encode event");
            }
        }
    }

    /// Queue a keepalive ping.
    pub async fn ping(&self) {
        let _ = self.outbound.send(Message::Ping(Bytes::new())).await;
    }

    async fn send_error(&self, err: &CommandError) {
        self.send(ServerEvent::error(err.reason(), err.to_string())).await;
    }

    pub async fn on_binary(&mut self, bytes: &[u8]) {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.on_text(text).await,
            Err(_) => {
                if self.admit() {
                    self.send_error(&CommandError::Protocol(ProtocolError::NotUtf8)).await;
                }
            }
        }
    }

    pub async fn on_text(&mut self, text: &str) {
        if !self.admit() {
            return;
        }
        if let Err(err) = guarded(self.dispatch(text)).await {
            tracing::debug!(connection_id = self.id, reason = %err.reason(), "request rejected");
            self.send_error(&err).await;
        }
    }

    /// Apply the rate limit, reporting a rejection to the client.
    fn admit(&mut self) -> bool {
        if self.limiter.check(Instant::now()) {
            return true;
        }
        let err = CommandError::RateLimited {
            limit: self.state.config.rate_limit_requests,
            window_secs: self.state.config.rate_limit_window_secs,
        };
        tracing::warn!(connection_id = self.id, "rate limit exceeded");
        let event = ServerEvent::error(err.reason(), err.to_string());
        // Dropped when the outbound queue is full.
        if let Ok(json) = event.to_json() {
            let _ = self.outbound.try_send(Message::Text(json.into()));
        }
        false
    }

    async fn dispatch(&mut self, text: &str) -> Result<(), CommandError> {
        match ClientCommand::parse(text)? {
            ClientCommand::ExecuteTool {
                tool,
                target,
                context,
            } => self.execute(&tool, &target, context).await,
            ClientCommand::Cancel => self.cancel(),
            ClientCommand::Ping => {
                self.send(ServerEvent::pong()).await;
                Ok(())
            }
        }
    }

    async fn execute(
        &mut self,
        tool: &str,
        target: &str,
        context: Option<Value>,
    ) -> Result<(), CommandError> {
        let state = Arc::clone(&self.state);
        let definition = state
            .registry
            .lookup(tool)
            .ok_or_else(|| CommandError::UnsupportedTool(tool.to_string()))?;
        let target = validate_target(target).inspect_err(|e| {
            tracing::warn!(
                connection_id = self.id,
                tool = definition.name,
                reason = %e.reason(),
                "rejected target",
            );
        })?;
        if let Some(current) = self.session.as_ref().filter(|s| s.is_active()) {
            return Err(CommandError::Busy(current.tool().name.to_string()));
        }

        let mut session = ScanSession::new(self.id, definition.clone(), target, context);
        session.transition(SessionState::Starting)?;
        match state.runner.start(definition, session.target()) {
            Ok((handle, events)) => session.attach(handle, events)?,
            Err(e) => {
                tracing::warn!(connection_id = self.id, tool = definition.name, error = %e, "spawn failed");
                session.transition(SessionState::Failed)?;
                return Err(e.into());
            }
        }

        tracing::info!(
            connection_id = self.id,
            tool = definition.name,
            target = %session.target(),
            pid = session.pid(),
            "scan started",
        );
        self.send(session.start_event()).await;
        state.set_active_tool(self.id, Some(definition.name)).await;
        self.session = Some(session);
        Ok(())
    }

    fn cancel(&mut self) -> Result<(), CommandError> {
        match self.session.as_mut().filter(|s| s.is_active()) {
            Some(session) => {
                tracing::info!(connection_id = self.id, tool = session.tool().name, "scan cancel requested");
                session.cancel();
                Ok(())
            }
            None => Err(CommandError::NotRunning),
        }
    }

    /// Next event of the current scan; pending forever when idle.
    pub async fn next_run_event(&mut self) -> Option<RunEvent> {
        match self.session.as_mut() {
            Some(session) => session.next_event().await,
            None => std::future::pending().await,
        }
    }

    pub async fn on_run_event(&mut self, event: Option<RunEvent>) {
        match event {
            Some(RunEvent::Line { stream, line }) => self.on_line(stream, line).await,
            Some(RunEvent::Finished(outcome)) => {
                let Some(mut session) = self.session.take() else {
                    return;
                };
                if outcome.termination == Termination::TimedOut {
                    let limit = session.tool().timeout(&self.state.config.timeouts());
                    self.send(ServerEvent::error(
                        ErrorReason::Timeout,
                        format!(
                            "'{}' exceeded its {}s limit and was stopped",
                            session.tool().name,
                            limit.as_secs()
                        ),
                    ))
                    .await;
                }
                match session.finish(&outcome) {
                    Ok(complete) => self.send(complete).await,
                    Err(e) => {
                        tracing::error!(connection_id = self.id, error = %e, "session finish failed");
                        self.send_error(&CommandError::from(e)).await;
                    }
                }
                tracing::info!(
                    connection_id = self.id,
                    tool = session.tool().name,
                    exit_code = outcome.return_code(),
                    status = ?outcome.status(),
                    "scan finished",
                );
                self.state.set_active_tool(self.id, None).await;
            }
            None => {
                // Channel closed without a Finished event.
                if let Some(session) = self.session.take() {
                    tracing::error!(
                        connection_id = self.id,
                        tool = session.tool().name,
                        "run event channel closed unexpectedly",
                    );
                    self.send_error(&CommandError::Internal).await;
                    self.state.set_active_tool(self.id, None).await;
                }
            }
        }
    }

    async fn on_line(&mut self, stream: OutputStream, line: String) {
        let limit = self.state.config.max_output_bytes;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.admit_line(line.len(), limit) {
            LineAdmission::Forward => {
                let tool = session.tool().name.to_string();
                self.send(ServerEvent::Output { tool, line, stream }).await;
            }
            LineAdmission::LimitReached => {
                let tool = session.tool().name;
                tracing::warn!(connection_id = self.id, tool, limit, "output limit reached");
                let message =
                    format!("'{tool}' produced more than {limit} bytes of output; further lines are dropped");
                self.send(ServerEvent::error(ErrorReason::OutputLimitExceeded, message))
                    .await;
            }
            LineAdmission::Drop => {}
        }
    }

    /// Release the connection, cancelling any scan still in flight.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            if session.is_active() {
                tracing::info!(
                    connection_id = self.id,
                    tool = session.tool().name,
                    pid = session.pid(),
                    "client left mid-scan; cancelling",
                );
                session.cancel();
            }
        }
        self.state.unregister(self.id).await;
    }
}

/// Run one message handler, turning a panic into `internal_error`.
async fn guarded<F>(handler: F) -> Result<(), CommandError>
where
    F: Future<Output = Result<(), CommandError>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(panic = panic_message(panic.as_ref()), "message handler panicked");
            Err(CommandError::Internal)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
