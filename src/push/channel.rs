//! Push channel manager — one live connection per session, reconnecting on
//! unintentional drops.
//!
//! ```text
//! Idle → Connecting → Open → Closed ─┐
//!            ▲                        │ (unintentional, attempts left)
//!            └────── delay ◄──────────┘
//! ```
//!
//! `disconnect` (or dropping the channel) stops the connection task and
//! suppresses further reconnects. Exhausting the attempt cap leaves the
//! channel closed until the next `connect`.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connector::{PushConnector, PushStream, WsConnector};
use super::listeners::{ListenerHandle, ListenerRegistry};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::model::PushEvent;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never connected.
    Idle,
    /// Opening a connection. `attempt` is 0 for the first try after
    /// `connect`, then counts reconnect attempts.
    Connecting { attempt: u32 },
    /// Connection is live.
    Open,
    /// No live connection. `reconnecting` is true while a retry is pending.
    Closed { reconnecting: bool },
}

/// Owns the push connection for the current session and fans decoded
/// events out to registered listeners.
pub struct PushChannel {
    shared: Arc<Shared>,
    task: Mutex<Option<ConnectionTask>>,
}

struct Shared {
    connector: Arc<dyn PushConnector>,
    config: ClientConfig,
    listeners: ListenerRegistry,
    state: watch::Sender<ChannelState>,
}

struct ConnectionTask {
    session_id: String,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ConnectionTask {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            warn!(session_id = %self.session_id, error = %e, "Push connection task ended abnormally");
        }
    }
}

enum PumpOutcome {
    Shutdown,
    Dropped,
}

impl PushChannel {
    pub fn new(config: ClientConfig, connector: Arc<dyn PushConnector>) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                listeners: ListenerRegistry::new(),
                state,
            }),
            task: Mutex::new(None),
        }
    }

    /// Channel backed by a real WebSocket connection.
    pub fn websocket(config: ClientConfig) -> Self {
        Self::new(config, Arc::new(WsConnector::new()))
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.config.reconnect
    }

    /// Open (or reopen) the channel for a session.
    ///
    /// Any running connection is closed first, whatever session it served.
    /// The reconnect attempt counter starts from zero.
    pub async fn connect(&self, session_id: &str) {
        if let Some(previous) = self.take_task() {
            debug!(
                old_session = %previous.session_id,
                new_session = %session_id,
                "Replacing push connection"
            );
            previous.stop().await;
        }

        let url = self.shared.config.push_url(session_id);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            url,
            session_id.to_string(),
            shutdown_rx,
        ));

        let replaced = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ConnectionTask {
                session_id: session_id.to_string(),
                shutdown,
                handle,
            });
        // A concurrent connect lost the race; dropping its sender stops it.
        drop(replaced);
    }

    /// Close deliberately, drop all listeners, and stop reconnecting.
    pub async fn disconnect(&self) {
        if let Some(task) = self.take_task() {
            info!(session_id = %task.session_id, "Disconnecting push channel");
            task.stop().await;
        }
        self.shared.listeners.clear();
        self.shared
            .state
            .send_replace(ChannelState::Closed { reconnecting: false });
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.shared.listeners.remove(handle)
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Session the channel is currently serving, if any.
    pub fn session_id(&self) -> Option<String> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| t.session_id.clone())
    }

    fn take_task(&self) -> Option<ConnectionTask> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    /// Read frames until the peer goes away or shutdown is requested.
    async fn pump(
        &self,
        stream: &mut dyn PushStream,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> PumpOutcome {
        loop {
            tokio::select! {
                _ = &mut *shutdown => return PumpOutcome::Shutdown,
                frame = stream.next_frame() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => {
                        warn!(error = %e, "Push channel receive error");
                        return PumpOutcome::Dropped;
                    }
                    None => return PumpOutcome::Dropped,
                },
            }
        }
    }

    fn dispatch(&self, frame: &str) {
        match PushEvent::decode(frame) {
            Ok(Some(event)) => {
                let delivered = self.listeners.notify(&event);
                debug!(kind = event.kind(), listeners = delivered, "Push event delivered");
            }
            Ok(None) => debug!(frame, "Ignoring push frame of unknown type"),
            Err(e) => warn!(error = %e, "Dropping malformed push frame"),
        }
    }
}

/// Connection task: open, pump, and reconnect until told to stop or out of
/// attempts. A dropped shutdown sender counts as a stop request.
async fn run_connection(
    shared: Arc<Shared>,
    url: String,
    session_id: String,
    mut shutdown: oneshot::Receiver<()>,
) {
    let policy = shared.config.reconnect;
    let mut attempts: u32 = 0;

    loop {
        shared.set_state(ChannelState::Connecting { attempt: attempts });

        let opened = tokio::select! {
            result = shared.connector.open(&url) => result,
            _ = &mut shutdown => {
                shared.set_state(ChannelState::Closed { reconnecting: false });
                return;
            }
        };

        match opened {
            Ok(mut stream) => {
                attempts = 0;
                shared.set_state(ChannelState::Open);
                info!(session_id = %session_id, "Push channel connected");

                match shared.pump(&mut *stream, &mut shutdown).await {
                    PumpOutcome::Shutdown => {
                        stream.close().await;
                        shared.set_state(ChannelState::Closed { reconnecting: false });
                        info!(session_id = %session_id, "Push channel closed");
                        return;
                    }
                    PumpOutcome::Dropped => {
                        info!(session_id = %session_id, "Push channel disconnected");
                    }
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Push channel connection failed");
            }
        }

        if attempts >= policy.max_attempts {
            warn!(
                session_id = %session_id,
                attempts,
                "Push channel giving up; call connect to resume"
            );
            shared.set_state(ChannelState::Closed { reconnecting: false });
            return;
        }

        attempts += 1;
        shared.set_state(ChannelState::Closed { reconnecting: true });
        info!(
            session_id = %session_id,
            attempt = attempts,
            max = policy.max_attempts,
            "Attempting to reconnect push channel"
        );

        tokio::select! {
            _ = tokio::time::sleep(policy.delay) => {}
            _ = &mut shutdown => {
                shared.set_state(ChannelState::Closed { reconnecting: false });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::model::Sender;
    use crate::testing::{Script, ScriptedConnector, TEST_TIMEOUT, fast_config, message_frame};

    /// Listener that forwards received message ids into a channel.
    fn collect_ids(channel: &PushChannel) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        channel.add_listener(move |event| {
            let PushEvent::Message { message } = event;
            let _ = tx.send(message.id.clone());
        });
        rx
    }

    async fn wait_for_state(channel: &PushChannel, expected: ChannelState) {
        let mut rx = channel.subscribe_state();
        rx.wait_for(|s| *s == expected).await.unwrap();
    }

    #[tokio::test]
    async fn bad_frames_are_dropped_without_closing() {
        timeout(TEST_TIMEOUT, async {
            let (connector, tx) = ScriptedConnector::held();
            let channel = PushChannel::new(fast_config(5), connector.clone());
            let mut ids = collect_ids(&channel);

            channel.connect("s-1").await;
            tx.send("Echo: not json".into()).unwrap();
            tx.send(r#"{"type":"typing"}"#.into()).unwrap();
            tx.send(r#"{"type":"message","message":{"id":"broken"}}"#.into())
                .unwrap();
            tx.send(message_frame("m1", Sender::Bot)).unwrap();

            assert_eq!(ids.recv().await.unwrap(), "m1");
            assert_eq!(channel.state(), ChannelState::Open);
            assert_eq!(connector.opens(), 1);
            assert!(ids.try_recv().is_err());
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn every_listener_receives_events() {
        timeout(TEST_TIMEOUT, async {
            let connector = ScriptedConnector::with(vec![Script::Frames(vec![message_frame(
                "m1",
                Sender::Bot,
            )])]);
            let channel = PushChannel::new(fast_config(0), connector);
            let mut first = collect_ids(&channel);
            let mut second = collect_ids(&channel);

            channel.connect("s-1").await;

            assert_eq!(first.recv().await.unwrap(), "m1");
            assert_eq!(second.recv().await.unwrap(), "m1");
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn removed_listener_stops_receiving() {
        timeout(TEST_TIMEOUT, async {
            let (connector, tx) = ScriptedConnector::held();
            let channel = PushChannel::new(fast_config(5), connector);
            let (removed_tx, mut removed_rx) = mpsc::unbounded_channel::<()>();
            let handle = channel.add_listener(move |_| {
                let _ = removed_tx.send(());
            });
            let mut kept = collect_ids(&channel);

            assert!(channel.remove_listener(handle));
            channel.connect("s-1").await;
            tx.send(message_frame("m1", Sender::User)).unwrap();

            assert_eq!(kept.recv().await.unwrap(), "m1");
            assert!(removed_rx.try_recv().is_err());
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        timeout(TEST_TIMEOUT, async {
            let connector = ScriptedConnector::with(vec![]);
            let channel = PushChannel::new(fast_config(5), connector.clone());

            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Closed { reconnecting: false }).await;

            // Initial attempt plus five reconnects.
            assert_eq!(connector.opens(), 6);
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(connector.opens(), 6);
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn successful_open_resets_attempts() {
        timeout(TEST_TIMEOUT, async {
            let connector = ScriptedConnector::with(vec![
                Script::Frames(vec![]),
                Script::Refuse,
                Script::Refuse,
                // Third reconnect attempt succeeds, then drops again.
                Script::Frames(vec![]),
            ]);
            let channel = PushChannel::new(fast_config(5), connector.clone());

            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Closed { reconnecting: false }).await;

            // 1 initial + 3 until the open at attempt 3 + 5 fresh attempts.
            assert_eq!(connector.opens(), 9);
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn connect_resumes_after_giving_up() {
        timeout(TEST_TIMEOUT, async {
            let connector = ScriptedConnector::with(vec![]);
            let channel = PushChannel::new(fast_config(1), connector.clone());

            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Closed { reconnecting: false }).await;
            assert_eq!(connector.opens(), 2);

            let (_tx, rx) = mpsc::unbounded_channel();
            connector.push(Script::Hold(rx));
            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Open).await;
            assert_eq!(connector.opens(), 3);
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn disconnect_stops_reconnecting_and_clears_listeners() {
        timeout(TEST_TIMEOUT, async {
            let (connector, _tx) = ScriptedConnector::held();
            let channel = PushChannel::new(fast_config(5), connector.clone());
            let _ids = collect_ids(&channel);

            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Open).await;

            channel.disconnect().await;

            assert_eq!(channel.state(), ChannelState::Closed { reconnecting: false });
            assert_eq!(channel.listener_count(), 0);
            assert!(connector.stream_closed(0));
            assert!(channel.session_id().is_none());

            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(connector.opens(), 1);
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn disconnect_during_backoff_cancels_retry() {
        timeout(TEST_TIMEOUT, async {
            let connector = ScriptedConnector::with(vec![]);
            let mut config = fast_config(5);
            config.reconnect.delay = Duration::from_secs(60);
            let channel = PushChannel::new(config, connector.clone());

            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Closed { reconnecting: true }).await;

            channel.disconnect().await;
            assert_eq!(channel.state(), ChannelState::Closed { reconnecting: false });
            assert_eq!(connector.opens(), 1);
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn connect_replaces_previous_session() {
        timeout(TEST_TIMEOUT, async {
            let (_tx_a, rx_a) = mpsc::unbounded_channel();
            let (_tx_b, rx_b) = mpsc::unbounded_channel();
            let connector =
                ScriptedConnector::with(vec![Script::Hold(rx_a), Script::Hold(rx_b)]);
            let channel = PushChannel::new(fast_config(5), connector.clone());

            channel.connect("a").await;
            wait_for_state(&channel, ChannelState::Open).await;
            channel.connect("b").await;
            wait_for_state(&channel, ChannelState::Open).await;

            assert_eq!(
                *connector.urls.lock().unwrap(),
                ["ws://push.test/ws/a", "ws://push.test/ws/b"]
            );
            assert!(connector.stream_closed(0));
            assert_eq!(channel.session_id().as_deref(), Some("b"));
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn dropping_the_channel_stops_the_connection() {
        timeout(TEST_TIMEOUT, async {
            let (connector, _tx) = ScriptedConnector::held();
            let channel = PushChannel::new(fast_config(5), connector.clone());

            channel.connect("s-1").await;
            wait_for_state(&channel, ChannelState::Open).await;
            drop(channel);

            while !connector.stream_closed(0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(connector.opens(), 1);
        })
        .await
        .expect("test timed out");
    }
}
