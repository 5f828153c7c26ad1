//! One user's live connection: state machine, outbound queue and the two
//! workers that move frames between the transport and the hub.
//!
//! The session lifecycle is `Connecting -> Registered -> Draining -> Closed`.
//! Only the hub moves a session into `Registered`. Whoever first notices the
//! connection is unusable (reader, writer, or the hub on backpressure) moves
//! it to `Draining`; the writer then flushes what is queued, closes the
//! transport once and marks the session `Closed`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use courier_shared::constants::OUTBOUND_QUEUE_CAPACITY;
use courier_shared::{InboundMessage, Message, SendFailure, UserId};

use crate::error::{HubError, TransportError};
use crate::hub::HubHandle;
use crate::liveness::{probe_frame, write_with_deadline, Liveness, ProbeTimer, ReadDeadline};
use crate::transport::{Frame, FrameSink, FrameStream};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Draining,
    Closed,
}

/// An item waiting in a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Outbound {
    Deliver(Message),
    SendFailed(SendFailure),
}

impl Outbound {
    fn into_frame(self) -> Result<Frame, TransportError> {
        let text = match self {
            Outbound::Deliver(message) => message.to_json()?,
            Outbound::SendFailed(notice) => notice.to_json()?,
        };
        Ok(Frame::Text(text))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub liveness: Liveness,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            liveness: Liveness::default(),
        }
    }
}

struct Shared {
    id: u64,
    user_id: UserId,
    state: watch::Sender<SessionState>,
    teardown_claimed: AtomicBool,
}

/// Cheap, cloneable reference to a session. The hub keeps one in its
/// registry; the session's own workers hold the others.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("user_id", &self.shared.user_id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    /// Create a session in `Connecting` together with the receiving end of
    /// its outbound queue.
    pub fn new(user_id: UserId, queue_capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Connecting);
        let handle = Self {
            shared: Arc::new(Shared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                user_id,
                state,
                teardown_claimed: AtomicBool::new(false),
            }),
            outbound,
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn user_id(&self) -> UserId {
        self.shared.user_id
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// `Connecting -> Registered`. Fails if the session already started
    /// tearing down.
    pub fn mark_registered(&self) -> bool {
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Registered;
                true
            } else {
                false
            }
        })
    }

    /// Move to `Draining`. Returns `false` if already draining or closed.
    pub fn begin_drain(&self) -> bool {
        self.shared.state.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Registered => {
                *state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Closed => false,
        })
    }

    pub fn mark_closed(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
    }

    /// Non-blocking enqueue used by the hub.
    pub fn try_enqueue(&self, item: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.outbound.try_send(item)
    }

    /// Enqueue, waiting at most `timeout` for room.
    pub async fn enqueue_timeout(
        &self,
        item: Outbound,
        timeout: Duration,
    ) -> Result<(), SendTimeoutError<Outbound>> {
        self.outbound.send_timeout(item, timeout).await
    }

    /// Error-triggered teardown. Only the first caller acts: a registered
    /// session asks the hub to deregister it, one that never made it into
    /// the registry starts draining directly. Later calls are no-ops.
    pub async fn teardown(&self, hub: &HubHandle) {
        if self.shared.teardown_claimed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut registered = false;
        self.shared.state.send_if_modified(|state| match state {
            SessionState::Connecting => {
                *state = SessionState::Draining;
                true
            }
            SessionState::Registered => {
                registered = true;
                false
            }
            SessionState::Draining | SessionState::Closed => false,
        });

        if registered && hub.deregister(self.clone()).await.is_err() {
            // Hub is gone; nothing else will drain us.
            self.begin_drain();
        }
    }
}

async fn wait_for_state(
    state: &mut watch::Receiver<SessionState>,
    pred: impl FnMut(&SessionState) -> bool,
) {
    let _ = state.wait_for(pred).await;
}

/// Drive one connection until it is closed.
///
/// The writer is spawned first so it can serve backlog as soon as the hub
/// registers the session; the reader then runs on the current task. Returns
/// once both workers have stopped.
pub async fn run<W, R>(user_id: UserId, sink: W, stream: R, hub: HubHandle, config: SessionConfig)
where
    W: FrameSink,
    R: FrameStream,
{
    let (handle, rx) = SessionHandle::new(user_id, config.queue_capacity);
    let writer = tokio::spawn(write_loop(
        handle.clone(),
        sink,
        rx,
        hub.clone(),
        config.liveness,
    ));

    if hub.register(handle.clone()).await {
        read_loop(&handle, stream, &hub, config.liveness.read_deadline).await;
    } else {
        warn!(user_id = %user_id, "Session was not registered");
        handle.teardown(&hub).await;
    }

    if let Err(e) = writer.await {
        error!(user_id = %user_id, error = %e, "Session writer panicked");
    }
    debug!(user_id = %user_id, session = handle.id(), "Session finished");
}

async fn read_loop<R: FrameStream>(
    handle: &SessionHandle,
    mut stream: R,
    hub: &HubHandle,
    read_deadline: Duration,
) {
    let user_id = handle.user_id();
    let mut state = handle.subscribe_state();
    let mut deadline = ReadDeadline::new(read_deadline);

    loop {
        let frame = tokio::select! {
            frame = deadline.read(&mut stream) => frame,
            _ = wait_for_state(&mut state, |s| *s != SessionState::Registered) => return,
        };

        match frame {
            Ok(Some(Frame::Text(text))) => {
                deadline.refresh();
                submit(handle, hub, &text).await;
            }
            Ok(Some(Frame::Ping(_) | Frame::Pong(_))) => deadline.refresh(),
            Ok(Some(Frame::Binary(_))) => {
                deadline.refresh();
                warn!(user_id = %user_id, "Ignoring binary frame");
            }
            Ok(Some(Frame::Close)) | Ok(None) => {
                debug!(user_id = %user_id, "Peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Inbound transport failed");
                break;
            }
        }
    }

    handle.teardown(hub).await;
}

/// Stamp one inbound frame and hand it to the hub.
async fn submit(handle: &SessionHandle, hub: &HubHandle, text: &str) {
    let user_id = handle.user_id();
    let message = match InboundMessage::from_json(text) {
        Ok(inbound) => inbound.stamp(user_id),
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Discarding malformed frame");
            return;
        }
    };

    match hub.route(&message).await {
        Ok(_) => {}
        Err(HubError::Store(e)) => {
            let notice = SendFailure::for_message(&message, "message was not stored");
            if handle.try_enqueue(Outbound::SendFailed(notice)).is_err() {
                warn!(user_id = %user_id, "Could not report failed send to sender");
            }
            error!(user_id = %user_id, error = %e, "Send failed");
        }
        Err(HubError::Unavailable) => {
            warn!(user_id = %user_id, "Hub unavailable, dropping inbound frame");
        }
    }
}

async fn write_loop<W: FrameSink>(
    handle: SessionHandle,
    mut sink: W,
    mut rx: mpsc::Receiver<Outbound>,
    hub: HubHandle,
    liveness: Liveness,
) {
    let user_id = handle.user_id();
    let limit = liveness.write_deadline;
    let mut state = handle.subscribe_state();
    let mut probe = ProbeTimer::new(liveness.ping_interval);

    let result = loop {
        tokio::select! {
            biased;

            _ = wait_for_state(&mut state, |s| {
                matches!(s, SessionState::Draining | SessionState::Closed)
            }) => break drain(&mut sink, &mut rx, limit).await,

            item = rx.recv() => match item {
                Some(item) => {
                    if let Err(e) = send_outbound(&mut sink, item, limit).await {
                        break Err(e);
                    }
                }
                None => break Err(TransportError::Closed),
            },

            _ = probe.tick() => {
                if let Err(e) = write_with_deadline(&mut sink, probe_frame(), limit).await {
                    break Err(e);
                }
            }
        }
    };

    rx.close();
    match result {
        Ok(()) => {
            let _ = write_with_deadline(&mut sink, Frame::Close, limit).await;
        }
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "Outbound transport failed");
            handle.teardown(&hub).await;
        }
    }
    let _ = tokio::time::timeout(limit, sink.close()).await;

    // Closed must never be visible while the hub still routes to us.
    wait_for_state(&mut state, |s| *s != SessionState::Registered).await;
    handle.mark_closed();
    info!(user_id = %user_id, session = handle.id(), "Session closed");
}

async fn send_outbound<W: FrameSink>(
    sink: &mut W,
    item: Outbound,
    limit: Duration,
) -> Result<(), TransportError> {
    write_with_deadline(sink, item.into_frame()?, limit).await
}

/// Flush everything already queued, refusing new items.
async fn drain<W: FrameSink>(
    sink: &mut W,
    rx: &mut mpsc::Receiver<Outbound>,
    limit: Duration,
) -> Result<(), TransportError> {
    rx.close();
    while let Some(item) = rx.recv().await {
        send_outbound(sink, item, limit).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use tokio::time::Instant;

    use courier_store::{MemoryStore, MessageStore, StoreOp};

    use super::*;
    use crate::hub::{spawn_hub, HubConfig};
    use crate::transport::testing::{duplex, Peer};

    fn hub_with(store: &MemoryStore) -> HubHandle {
        let (hub, _task) = spawn_hub(Arc::new(store.clone()), HubConfig::default());
        hub
    }

    fn connect(
        user: u64,
        hub: &HubHandle,
        config: SessionConfig,
    ) -> (tokio::task::JoinHandle<()>, Peer) {
        let (sink, stream, peer) = duplex();
        let task = tokio::spawn(run(UserId(user), sink, stream, hub.clone(), config));
        (task, peer)
    }

    async fn wait_online(hub: &HubHandle, user: u64, online: bool) {
        while hub.is_online(UserId(user)).await.unwrap() != online {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_state_transitions() {
        let (session, _rx) = SessionHandle::new(UserId(1), 4);
        assert_eq!(session.state(), SessionState::Connecting);

        assert!(session.mark_registered());
        assert!(!session.mark_registered());
        assert!(session.begin_drain());
        assert!(!session.begin_drain());
        assert!(!session.mark_registered());

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.begin_drain());
    }

    #[tokio::test]
    async fn test_backlog_delivered_oldest_first() {
        let store = MemoryStore::new();
        for (content, ts) in [("t3", 300), ("t1", 100), ("t2", 200)] {
            store
                .save(&Message::stamped_at(UserId(7), UserId(9), content, ts))
                .await
                .unwrap();
        }
        let hub = hub_with(&store);

        let (_task, mut peer) = connect(9, &hub, SessionConfig::default());

        let mut contents = Vec::new();
        for _ in 0..3 {
            let msg = peer.next_message().await;
            assert!(msg.read);
            contents.push(msg.content);
        }
        assert_eq!(contents, vec!["t1", "t2", "t3"]);

        while !store.fetch_unread(UserId(9)).await.unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.read_marks().len(), 3);
    }

    #[tokio::test]
    async fn test_live_message_reaches_receiver_and_echoes_to_sender() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (_t7, mut seven) = connect(7, &hub, SessionConfig::default());
        let (_t9, mut nine) = connect(9, &hub, SessionConfig::default());
        wait_online(&hub, 7, true).await;
        wait_online(&hub, 9, true).await;

        seven.send_text(r#"{"receiver_id":9,"content":"hi","sender_id":1,"read":true}"#);

        let received = nine.next_message().await;
        assert_eq!(received.sender_id, UserId(7));
        assert_eq!(received.receiver_id, UserId(9));
        assert_eq!(received.content, "hi");
        assert!(!received.read);

        let echo = seven.next_message().await;
        assert_eq!(echo.id, received.id);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (_t7, seven) = connect(7, &hub, SessionConfig::default());
        let (_t9, mut nine) = connect(9, &hub, SessionConfig::default());
        wait_online(&hub, 7, true).await;
        wait_online(&hub, 9, true).await;

        seven.send_text("{not json");
        seven.send_text(r#"{"receiver_id":9,"content":"after garbage"}"#);

        assert_eq!(nine.next_message().await.content, "after garbage");
        assert!(hub.is_online(UserId(7)).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_to_sender() {
        let store = MemoryStore::new();
        store.set_failing(StoreOp::Save, true);
        let hub = hub_with(&store);
        let (_t7, mut seven) = connect(7, &hub, SessionConfig::default());
        wait_online(&hub, 7, true).await;

        seven.send_text(r#"{"receiver_id":9,"content":"lost"}"#);

        let Some(Frame::Text(text)) = seven.next_data().await else {
            panic!("expected a failure notice");
        };
        let notice: SendFailure = serde_json::from_str(&text).unwrap();
        assert_eq!(notice.receiver_id, UserId(9));
        assert_eq!(notice.content, "lost");
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_reaped_after_read_deadline() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let started = Instant::now();
        let (task, mut peer) = connect(9, &hub, SessionConfig::default());

        task.await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(!hub.is_online(UserId(9)).await.unwrap());

        let mut frames = Vec::new();
        while let Some(frame) = peer.outbound.next().await {
            frames.push(frame);
        }
        assert!(frames.contains(&probe_frame()));
        assert_eq!(frames.last(), Some(&Frame::Close));

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.deregistrations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_only_peer_answering_pings_stays_online() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (_task, peer) = connect(9, &hub, SessionConfig::default());
        wait_online(&hub, 9, true).await;

        // The client never sends data of its own; it only answers pings.
        let Peer { inbound, mut outbound } = peer;
        let client = tokio::spawn(async move {
            let mut delivered = 0;
            while let Some(frame) = outbound.next().await {
                match frame {
                    Frame::Ping(payload) => {
                        let _ = inbound.unbounded_send(Ok(Frame::Pong(payload)));
                    }
                    Frame::Text(_) => delivered += 1,
                    _ => {}
                }
            }
            delivered
        });

        for _ in 0..7 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            let delivery = hub
                .route(&Message::new(UserId(7), UserId(9), "still there?"))
                .await
                .unwrap();
            assert!(delivery.to_receiver);
            assert!(hub.is_online(UserId(9)).await.unwrap());
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.deregistrations, 0);
        assert_eq!(stats.evictions, 0);

        hub.shutdown().await.unwrap();
        assert_eq!(client.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_write_failure_tears_session_down() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (task, peer) = connect(9, &hub, SessionConfig::default());
        wait_online(&hub, 9, true).await;

        let Peer { inbound, outbound } = peer;
        drop(outbound);

        hub.route(&Message::new(UserId(7), UserId(9), "into the void"))
            .await
            .unwrap();
        task.await.unwrap();

        assert!(!hub.is_online(UserId(9)).await.unwrap());
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.deregister_requests, 1);
        assert_eq!(stats.deregistrations, 1);
        drop(inbound);
    }

    #[tokio::test]
    async fn test_peer_close_deregisters() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (task, peer) = connect(9, &hub, SessionConfig::default());
        wait_online(&hub, 9, true).await;

        peer.inbound.unbounded_send(Ok(Frame::Close)).unwrap();
        task.await.unwrap();

        assert!(!hub.is_online(UserId(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_new_connection_replaces_old_one() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (first_task, mut first) = connect(9, &hub, SessionConfig::default());
        wait_online(&hub, 9, true).await;

        let (_second_task, mut second) = connect(9, &hub, SessionConfig::default());
        first_task.await.unwrap();
        assert_eq!(first.next_data().await, Some(Frame::Close));

        hub.route(&Message::new(UserId(7), UserId(9), "to the new one"))
            .await
            .unwrap();
        assert_eq!(second.next_message().await.content, "to the new one");
        assert_eq!(first.next_data().await, None);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (session, _rx) = SessionHandle::new(UserId(4), 8);
        assert!(hub.register(session.clone()).await);

        tokio::join!(session.teardown(&hub), session.teardown(&hub));
        session.teardown(&hub).await;

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.deregister_requests, 1);
        assert_eq!(stats.deregistrations, 1);
        assert_eq!(stats.online, 0);
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn test_teardown_before_registration_drains_locally() {
        let store = MemoryStore::new();
        let hub = hub_with(&store);
        let (session, _rx) = SessionHandle::new(UserId(4), 8);

        session.teardown(&hub).await;

        assert_eq!(session.state(), SessionState::Draining);
        assert!(!hub.register(session).await);
        assert_eq!(hub.stats().await.unwrap().deregister_requests, 0);
    }
}
