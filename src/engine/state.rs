//! Engine state — the snapshot presentation reads, and the transitions the
//! engine applies to it.
//!
//! Every mutation here is synchronous and runs inside
//! `watch::Sender::send_if_modified`, which makes each one an atomic
//! read-modify-write with respect to the push listener.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::model::{ChatResponse, Message, Session, SessionStatus};

/// Lifecycle of one chat.
///
/// `Uninitialized → Initializing → Ready ⇄ Sending → Completed`, with
/// `Failed` reachable from `Initializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePhase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Sending,
    Completed,
    Failed,
}

impl EnginePhase {
    /// Whether `initialize` may start from this phase.
    pub fn can_initialize(&self) -> bool {
        matches!(self, Self::Uninitialized | Self::Failed)
    }

    /// Whether presentation should accept user input.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Ready | Self::Sending)
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Append-only message sequence keyed by message id.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    /// Append unless a message with the same id is already present.
    pub fn admit(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// What presentation sees.
#[derive(Debug, Clone, Default)]
pub struct ChatSnapshot {
    session: Option<Session>,
    log: MessageLog,
    is_loading: bool,
    is_typing: bool,
    error: Option<String>,
    phase: EnginePhase,
    /// Push messages that arrived before the history seed, with the session
    /// whose listener received them.
    held: Vec<(String, Message)>,
    sends_in_flight: usize,
    /// Bumped by every initialize and reset; an initialize only lands if
    /// the generation it started with is still current.
    generation: u64,
}

impl ChatSnapshot {
    /// The active session. `None` until initialization succeeds.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn messages(&self) -> &[Message] {
        self.log.as_slice()
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing
    }

    /// User-facing description of the last failure, cleared by the next
    /// initialize or send.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn is_completed(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.status.is_completed())
    }

    /// 0 before a session exists.
    pub fn progress_percent(&self) -> u8 {
        self.session.as_ref().map_or(0, Session::progress_percent)
    }

    // ── Initialization ─────────────────────────────────────────────

    /// Start a fresh initialization and return its generation, or `None`
    /// if one may not start from the current phase.
    pub(crate) fn begin_initialize(&mut self) -> Option<u64> {
        if !self.phase.can_initialize() {
            return None;
        }
        *self = Self {
            is_loading: true,
            phase: EnginePhase::Initializing,
            generation: self.generation + 1,
            ..Self::default()
        };
        Some(self.generation)
    }

    /// Whether the initialize started as `generation` may still land.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.phase == EnginePhase::Initializing
    }

    /// Seed history, expose the session, then admit anything pushed while
    /// history was in flight. Returns false, changing nothing, if the
    /// initialize was superseded.
    pub(crate) fn finish_initialize(
        &mut self,
        generation: u64,
        session: Session,
        history: Vec<Message>,
    ) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        for message in history {
            if !self.log.admit(message) {
                debug!("Duplicate id in fetched history");
            }
        }

        self.phase = if session.status.is_completed() {
            EnginePhase::Completed
        } else {
            EnginePhase::Ready
        };
        self.is_loading = false;
        self.error = None;

        let held = std::mem::take(&mut self.held);
        for (listener_session, message) in held {
            if listener_session == session.id {
                self.admit_live(message, &session.id);
            }
        }
        self.session = Some(session);
        true
    }

    /// Record a failed initialize. Returns false if it was superseded.
    pub(crate) fn fail_initialize(&mut self, generation: u64, error: &str) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        *self = Self {
            error: Some(error.to_string()),
            phase: EnginePhase::Failed,
            generation: self.generation,
            ..Self::default()
        };
        true
    }

    /// Back to `Uninitialized`, invalidating any initialize in flight.
    /// Returns false if there was nothing to clear.
    pub(crate) fn reset(&mut self) -> bool {
        if self.phase == EnginePhase::Uninitialized && self.log.is_empty() {
            return false;
        }
        *self = Self {
            generation: self.generation + 1,
            ..Self::default()
        };
        true
    }

    // ── Push delivery ───────────────────────────────────────────────

    /// Route one pushed message for `session_id`. Returns true if the
    /// visible snapshot changed.
    pub(crate) fn accept_push(&mut self, message: Message, session_id: &str) -> bool {
        match self.phase {
            EnginePhase::Initializing => {
                self.held.push((session_id.to_string(), message));
                false
            }
            EnginePhase::Uninitialized | EnginePhase::Failed => {
                debug!(message_id = %message.id, "Push arrived with no active session");
                false
            }
            _ if self.session_id() != Some(session_id) => {
                debug!(message_id = %message.id, "Push for a replaced session");
                false
            }
            _ => self.admit_live(message, session_id),
        }
    }

    fn admit_live(&mut self, message: Message, session_id: &str) -> bool {
        if !message.belongs_to(session_id) {
            warn!(
                session_id,
                message_id = %message.id,
                foreign_session = %message.session_id,
                "Dropping message for another session"
            );
            return false;
        }

        let from_bot = message.is_from_bot();
        let id = message.id.clone();
        if !self.log.admit(message) {
            debug!(message_id = %id, "Duplicate message ignored");
            return false;
        }
        if from_bot {
            self.is_typing = false;
        }
        true
    }

    // ── Sending ─────────────────────────────────────────────────────

    pub(crate) fn begin_send(&mut self) {
        self.is_typing = true;
        self.error = None;
        self.sends_in_flight += 1;
        if self.phase == EnginePhase::Ready {
            self.phase = EnginePhase::Sending;
        }
    }

    /// Apply the acknowledgment of a send made for `session_id`.
    ///
    /// Returns true if the service reported `active` for a session already
    /// known to be completed (the report is ignored).
    pub(crate) fn apply_send_response(&mut self, session_id: &str, response: &ChatResponse) -> bool {
        let Some(session) = self.session.as_mut().filter(|s| s.id == session_id) else {
            return false;
        };
        let regressed = session.status.is_completed()
            && response.session_status == SessionStatus::Active;

        session.status = session.status.merge(response.session_status);
        session.current_step.clone_from(&response.current_step);
        let completed = session.status.is_completed();

        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
        self.settle_phase(completed);
        regressed
    }

    pub(crate) fn fail_send(&mut self, session_id: &str, error: &str) {
        if self.session_id() != Some(session_id) {
            return;
        }
        self.error = Some(error.to_string());
        self.is_typing = false;
        self.sends_in_flight = self.sends_in_flight.saturating_sub(1);
        let completed = self.is_completed();
        self.settle_phase(completed);
    }

    fn settle_phase(&mut self, completed: bool) {
        self.phase = if completed {
            EnginePhase::Completed
        } else if self.sends_in_flight > 0 {
            EnginePhase::Sending
        } else {
            EnginePhase::Ready
        };
    }

    // ── Refresh ─────────────────────────────────────────────────────

    /// Merge a freshly fetched copy of the active session. Returns true if
    /// the service reported a status regression (ignored).
    pub(crate) fn apply_session(&mut self, fresh: Session) -> bool {
        let Some(session) = self.session.as_mut().filter(|s| s.id == fresh.id) else {
            return false;
        };
        let regressed = session.status.is_completed() && !fresh.status.is_completed();

        session.status = session.status.merge(fresh.status);
        session.current_step = fresh.current_step;
        if fresh.data.is_some() {
            session.data = fresh.data;
        }

        if session.status.is_completed() {
            self.phase = EnginePhase::Completed;
        }
        regressed
    }
}
