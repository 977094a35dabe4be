//! Synchronization engine — merges the initial history load, send
//! acknowledgments, and push deliveries into one duplicate-free
//! conversation that presentation observes through a `watch` channel.

pub mod state;

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{error, info, warn};

pub use state::{ChatSnapshot, EnginePhase, MessageLog};

use crate::config::ClientConfig;
use crate::error::{EngineError, Result, TransportError};
use crate::model::{PushEvent, Session};
use crate::push::{ListenerHandle, PushChannel};
use crate::transport::{RestClient, SessionApi};

/// Shown when the startup sequence fails.
pub const INIT_FAILED: &str = "Failed to initialize chat session";
/// Shown when a send fails; the engine stays usable.
pub const SEND_FAILED: &str = "Failed to send message. Please try again.";

/// Owns session and message state for one chat.
///
/// Collaborators are injected so several engines (or test doubles) can
/// coexist. Whoever builds the engine owns its lifetime: call
/// [`ChatEngine::teardown`] when the chat ends. Dropping the engine
/// releases its listener as well.
pub struct ChatEngine {
    api: Arc<dyn SessionApi>,
    push: Arc<PushChannel>,
    state: Arc<watch::Sender<ChatSnapshot>>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl ChatEngine {
    pub fn new(api: Arc<dyn SessionApi>, push: Arc<PushChannel>) -> Self {
        let (state, _) = watch::channel(ChatSnapshot::default());
        Self {
            api,
            push,
            state: Arc::new(state),
            listener: Mutex::new(None),
        }
    }

    /// Engine over the real REST client and WebSocket push channel.
    pub fn from_config(config: ClientConfig) -> Self {
        let api = Arc::new(RestClient::new(config.clone()));
        let push = Arc::new(PushChannel::websocket(config));
        Self::new(api, push)
    }

    /// Reactive view of the engine state.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.state.subscribe()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ChatSnapshot {
        self.state.borrow().clone()
    }

    pub fn push_channel(&self) -> &Arc<PushChannel> {
        &self.push
    }

    /// Progress of the active session, 0 when there is none.
    pub fn progress_percent(&self) -> u8 {
        self.state.borrow().progress_percent()
    }

    // ── Initialize ─────────────────────────────────────────────────

    /// Create a session, open its push channel, and seed history.
    ///
    /// On failure the snapshot carries [`INIT_FAILED`], no session is
    /// exposed, and the push channel is shut down. Calling again after a
    /// failure starts over. A [`ChatEngine::teardown`] that lands while
    /// this is running wins: the initialize releases what it opened and
    /// returns [`EngineError::Cancelled`].
    pub async fn initialize(&self) -> Result<()> {
        let mut generation = None;
        self.state.send_if_modified(|s| {
            generation = s.begin_initialize();
            generation.is_some()
        });
        let Some(generation) = generation else {
            return Err(EngineError::AlreadyInitialized.into());
        };

        let mut opened = Opened::default();
        match self.start_session(generation, &mut opened).await {
            Ok(Some(session)) => {
                info!(
                    session_id = %session.id,
                    step = %session.current_step,
                    messages = self.state.borrow().messages().len(),
                    "Chat session ready"
                );
                Ok(())
            }
            Ok(None) => {
                info!("Initialization cancelled by teardown");
                self.abandon(opened).await;
                Err(EngineError::Cancelled.into())
            }
            Err(e) => {
                error!(error = %e, "Session initialization failed");
                let failed = self
                    .state
                    .send_if_modified(|s| s.fail_initialize(generation, INIT_FAILED));
                self.abandon(opened).await;
                if failed {
                    Err(e.into())
                } else {
                    Err(EngineError::Cancelled.into())
                }
            }
        }
    }

    /// Runs the startup sequence. `Ok(None)` means a teardown superseded it.
    async fn start_session(
        &self,
        generation: u64,
        opened: &mut Opened,
    ) -> std::result::Result<Option<Session>, TransportError> {
        let session = self.api.create_session().await?;
        if !self.is_current(generation) {
            return Ok(None);
        }

        // Listen before connecting so nothing pushed during the history
        // fetch is missed; the snapshot holds those until the seed lands.
        opened.listener = Some(self.register_listener(&session.id));
        opened.session_id = Some(session.id.clone());
        self.push.connect(&session.id).await;
        if !self.is_current(generation) {
            return Ok(None);
        }

        let history = self.api.fetch_messages(&session.id).await?;
        let landed = self
            .state
            .send_if_modified(|s| s.finish_initialize(generation, session.clone(), history));
        Ok(landed.then_some(session))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.borrow().is_current(generation)
    }

    /// Release what a failed or cancelled initialize opened, leaving alone
    /// anything a later initialize has set up since.
    async fn abandon(&self, opened: Opened) {
        if let Some(handle) = opened.listener {
            let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            if *slot == Some(handle) {
                *slot = None;
            }
            drop(slot);
            self.push.remove_listener(handle);
        }
        let Some(session_id) = opened.session_id else {
            return;
        };
        if self.push.session_id().as_deref() == Some(session_id.as_str()) {
            self.push.disconnect().await;
        }
    }

    fn register_listener(&self, session_id: &str) -> ListenerHandle {
        let state = Arc::clone(&self.state);
        let session_id = session_id.to_string();
        let handle = self.push.add_listener(move |event| match event {
            PushEvent::Message { message } => {
                state.send_if_modified(|s| s.accept_push(message.clone(), &session_id));
            }
        });

        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            self.push.remove_listener(previous);
        }
        handle
    }

    fn release_listener(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            self.push.remove_listener(handle);
        }
    }

    // ── Send ───────────────────────────────────────────────────────

    /// Submit user text.
    ///
    /// Does nothing without an active session or for blank text. The
    /// user's own message is not appended here; it arrives through the
    /// push channel like every other stored message. Completed sessions
    /// are not gated: presentation disables input from the snapshot.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let Some(session_id) = self.state.borrow().session_id().map(str::to_string) else {
            return Ok(());
        };

        self.state.send_modify(ChatSnapshot::begin_send);

        match self.api.send_message(&session_id, text).await {
            Ok(response) => {
                let mut regressed = false;
                self.state.send_modify(|s| {
                    regressed = s.apply_send_response(&session_id, &response);
                });
                if regressed {
                    warn!(session_id = %session_id, "Ignoring reported reopen of a completed session");
                }
                if response.session_status.is_completed() {
                    info!(session_id = %session_id, "Intake completed");
                }
                Ok(())
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Send message failed");
                self.state
                    .send_modify(|s| s.fail_send(&session_id, SEND_FAILED));
                Err(e.into())
            }
        }
    }

    // ── Refresh ────────────────────────────────────────────────────

    /// Re-read the active session from the service and merge it.
    pub async fn refresh_session(&self) -> Result<()> {
        let Some(session_id) = self.state.borrow().session_id().map(str::to_string) else {
            return Err(EngineError::NotInitialized.into());
        };

        let fresh = self.api.get_session(&session_id).await?;
        let mut regressed = false;
        self.state.send_modify(|s| regressed = s.apply_session(fresh));
        if regressed {
            warn!(session_id = %session_id, "Ignoring reported reopen of a completed session");
        }
        Ok(())
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Close the push channel and clear all state. Safe to call again.
    pub async fn teardown(&self) {
        // Invalidate any initialize in flight first, so it cannot connect
        // again after the channel is closed below.
        self.state.send_if_modified(ChatSnapshot::reset);
        self.release_listener();
        self.push.disconnect().await;
    }
}

/// Resources an initialize has acquired so far.
#[derive(Default)]
struct Opened {
    listener: Option<ListenerHandle>,
    session_id: Option<String>,
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        self.release_listener();
    }
}
