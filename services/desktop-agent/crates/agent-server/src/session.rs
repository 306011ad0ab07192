//! One tool invocation bound to one connection.

use std::time::Instant;

use desktop_agent_common::{ServerEvent, Target, ToolDefinition};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransitionError;
use crate::runner::{ProcessHandle, RunEvent, RunOutcome};

/// Scan session lifecycle.
///
/// `Idle → Starting → Running → Completed | Failed | Cancelled`, plus
/// `Starting → Failed` on spawn failure and `Starting → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Running | Self::Failed | Self::Cancelled)
                | (Self::Running, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

/// What to do with the next output line under the per-session budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAdmission {
    Forward,
    /// This line crossed the budget; report it once.
    LimitReached,
    Drop,
}

/// A scan owned exclusively by one connection.
#[derive(Debug)]
pub struct ScanSession {
    connection_id: u64,
    tool: ToolDefinition,
    target: Target,
    context: Option<Value>,
    state: SessionState,
    started_at: Instant,
    forwarded_bytes: usize,
    limit_reached: bool,
    handle: Option<ProcessHandle>,
    events: Option<mpsc::Receiver<RunEvent>>,
}

impl ScanSession {
    #[must_use]
    pub fn new(
        connection_id: u64,
        tool: ToolDefinition,
        target: Target,
        context: Option<Value>,
    ) -> Self {
        Self {
            connection_id,
            tool,
            target,
            context,
            state: SessionState::Idle,
            started_at: Instant::now(),
            forwarded_bytes: 0,
            limit_reached: false,
            handle: None,
            events: None,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub fn tool(&self) -> &ToolDefinition {
        &self.tool
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True until the session reaches a terminal state.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            connection_id = self.connection_id,
            tool = self.tool.name,
            from = ?self.state,
            to = ?next,
            "session transition",
        );
        self.state = next;
        Ok(())
    }

    /// Bind the spawned process and move to `Running`.
    pub fn attach(
        &mut self,
        handle: ProcessHandle,
        events: mpsc::Receiver<RunEvent>,
    ) -> Result<(), TransitionError> {
        self.transition(SessionState::Running)?;
        self.started_at = Instant::now();
        self.handle = Some(handle);
        self.events = Some(events);
        Ok(())
    }

    /// Next event from the running process; pending forever when nothing is
    /// attached. `None` means the process channel closed unexpectedly.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Stop the process. Its `Finished` event still arrives through
    /// [`Self::next_event`].
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.cancel();
        }
    }

    /// Account one output line against `limit` bytes of forwarded output.
    pub fn admit_line(&mut self, len: usize, limit: usize) -> LineAdmission {
        if self.limit_reached {
            return LineAdmission::Drop;
        }
        let next = self.forwarded_bytes.saturating_add(len);
        if next > limit {
            self.limit_reached = true;
            return LineAdmission::LimitReached;
        }
        self.forwarded_bytes = next;
        LineAdmission::Forward
    }

    #[must_use]
    pub fn start_event(&self) -> ServerEvent {
        ServerEvent::Start {
            tool: self.tool.name.to_string(),
            target: self.target.to_string(),
            command: self.tool.command_line(&self.target),
            context: self.context.clone(),
        }
    }

    /// Move to the outcome's terminal state, release the process, and build
    /// the `complete` event.
    pub fn finish(&mut self, outcome: &RunOutcome) -> Result<ServerEvent, TransitionError> {
        self.transition(outcome.session_state())?;
        self.handle = None;
        self.events = None;
        Ok(ServerEvent::Complete {
            tool: self.tool.name.to_string(),
            target: self.target.to_string(),
            return_code: outcome.return_code(),
            success: outcome.success(),
            status: outcome.status(),
            duration_ms: outcome.duration_ms(),
            context: self.context.clone(),
        })
    }
}
