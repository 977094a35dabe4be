//! Shared test doubles for the push channel and engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ChannelError, TransportError};
use crate::model::{ChatResponse, Message, Sender, Session, SessionStatus};
use crate::push::{PushConnector, PushStream};
use crate::transport::SessionApi;

/// Upper bound for any async test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with a 5 ms reconnect delay.
pub fn fast_config(max_attempts: u32) -> ClientConfig {
    let mut config = ClientConfig::new("http://push.test", "ws://push.test");
    config.reconnect = ReconnectPolicy {
        delay: Duration::from_millis(5),
        max_attempts,
    };
    config
}

pub fn message(id: &str, sender: Sender) -> Message {
    Message {
        id: id.into(),
        session_id: "s-1".into(),
        sender,
        content: format!("content of {id}"),
        created_at: Utc::now(),
    }
}

pub fn session(id: &str, status: SessionStatus, step: &str) -> Session {
    Session {
        id: id.into(),
        status,
        current_step: step.into(),
        created_at: Utc::now(),
        data: None,
    }
}

pub fn reply(step: &str, status: SessionStatus) -> ChatResponse {
    ChatResponse {
        message: "noted".into(),
        current_step: step.into(),
        session_status: status,
    }
}

/// A push frame the way the service sends it (no `session_id`).
pub fn message_frame(id: &str, sender: Sender) -> String {
    serde_json::json!({
        "type": "message",
        "message": {
            "id": id,
            "sender": sender,
            "content": format!("content of {id}"),
            "created_at": "2024-05-01T12:00:00.000001"
        }
    })
    .to_string()
}

pub fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

// ── Push connector ──────────────────────────────────────────────────

/// What the next `open` call does.
pub enum Script {
    Refuse,
    /// Accept, deliver these frames, then the peer closes.
    Frames(Vec<String>),
    /// Accept and stay open until the sender is dropped.
    Hold(mpsc::UnboundedReceiver<String>),
}

/// Connector that follows a script; an exhausted script refuses.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Script>>,
    pub urls: Mutex<Vec<String>>,
    closed: Mutex<Vec<Arc<AtomicBool>>>,
    opens: AtomicUsize,
    /// Signalled whenever a held stream has drained its queued frames.
    pub idle: Arc<Notify>,
}

impl ScriptedConnector {
    pub fn with(script: Vec<Script>) -> Arc<Self> {
        let connector = Self::default();
        *connector.script.lock().unwrap() = script.into();
        Arc::new(connector)
    }

    /// Connector holding one connection open, fed through the returned sender.
    pub fn held() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with(vec![Script::Hold(rx)]), tx)
    }

    pub fn push(&self, step: Script) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn stream_closed(&self, index: usize) -> bool {
        self.closed.lock().unwrap()[index].load(Ordering::SeqCst)
    }
}

struct ScriptedStream {
    frames: VecDeque<String>,
    live: Option<mpsc::UnboundedReceiver<String>>,
    closed: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn open(&self, url: &str) -> Result<Box<dyn PushStream>, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Refuse);
        let (frames, live) = match step {
            Script::Refuse => {
                return Err(ChannelError::ConnectFailed {
                    url: url.to_string(),
                    reason: "refused".into(),
                });
            }
            Script::Frames(frames) => (frames.into(), None),
            Script::Hold(rx) => (VecDeque::new(), Some(rx)),
        };
        let closed = Arc::new(AtomicBool::new(false));
        self.closed.lock().unwrap().push(Arc::clone(&closed));
        Ok(Box::new(ScriptedStream {
            frames,
            live,
            closed,
            idle: Arc::clone(&self.idle),
        }))
    }
}

#[async_trait]
impl PushStream for ScriptedStream {
    async fn next_frame(&mut self) -> Option<Result<String, ChannelError>> {
        if let Some(frame) = self.frames.pop_front() {
            return Some(Ok(frame));
        }
        let rx = self.live.as_mut()?;
        if let Ok(frame) = rx.try_recv() {
            return Some(Ok(frame));
        }
        self.idle.notify_one();
        rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Session API ─────────────────────────────────────────────────────

/// Scripted `SessionApi`. Unscripted calls fail with a request error,
/// except history, which defaults to empty.
#[derive(Default)]
pub struct MockApi {
    created: Mutex<VecDeque<Result<Session, TransportError>>>,
    sessions: Mutex<VecDeque<Result<Session, TransportError>>>,
    history: Mutex<VecDeque<Result<Vec<Message>, TransportError>>>,
    replies: Mutex<VecDeque<Result<ChatResponse, TransportError>>>,
    create_gate: Mutex<Option<oneshot::Receiver<()>>>,
    history_gate: Mutex<Option<oneshot::Receiver<()>>>,
    reply_gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub creates: AtomicUsize,
}

fn unscripted(endpoint: &str) -> TransportError {
    TransportError::Request {
        endpoint: endpoint.into(),
        reason: "unscripted".into(),
    }
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(self, session: Session) -> Self {
        self.created.lock().unwrap().push_back(Ok(session));
        self
    }

    pub fn with_create_error(self) -> Self {
        self.created.lock().unwrap().push_back(Err(TransportError::Status {
            endpoint: "POST /api/sessions".into(),
            status: 500,
            body: "boom".into(),
        }));
        self
    }

    pub fn with_history(self, history: Vec<Message>) -> Self {
        self.history.lock().unwrap().push_back(Ok(history));
        self
    }

    pub fn with_history_error(self) -> Self {
        self.history.lock().unwrap().push_back(Err(TransportError::Status {
            endpoint: "GET /api/messages/{id}".into(),
            status: 500,
            body: "boom".into(),
        }));
        self
    }

    pub fn with_reply(self, reply: ChatResponse) -> Self {
        self.replies.lock().unwrap().push_back(Ok(reply));
        self
    }

    pub fn with_reply_error(self) -> Self {
        self.replies.lock().unwrap().push_back(Err(TransportError::Status {
            endpoint: "POST /api/messages".into(),
            status: 503,
            body: "unavailable".into(),
        }));
        self
    }

    pub fn with_fetched_session(self, session: Session) -> Self {
        self.sessions.lock().unwrap().push_back(Ok(session));
        self
    }

    /// Hold the next session creation until the returned sender fires.
    pub fn gate_create(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.create_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Hold the next history fetch until the returned sender fires.
    pub fn gate_history(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.history_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Hold the next send until the returned sender fires.
    pub fn gate_reply(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.reply_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionApi for MockApi {
    async fn create_session(&self) -> Result<Session, TransportError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let gate = self.create_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.created
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("POST /api/sessions")))
    }

    async fn get_session(&self, _session_id: &str) -> Result<Session, TransportError> {
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("GET /api/sessions/{id}")))
    }

    async fn fetch_messages(&self, _session_id: &str) -> Result<Vec<Message>, TransportError> {
        let gate = self.history_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.history
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<ChatResponse, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        let gate = self.reply_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted("POST /api/messages")))
    }
}
