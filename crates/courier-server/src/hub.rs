//! The connection registry.
//!
//! A single task owns the `UserId -> SessionHandle` map. Every other task
//! talks to it through [`HubHandle`], which turns each call into a
//! [`HubCommand`] on a bounded channel. The hub task never awaits I/O, so
//! registry mutations are applied in one strict order and each one is cheap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_shared::constants::{BACKLOG_ENQUEUE_TIMEOUT_MS, HUB_COMMAND_CAPACITY};
use courier_shared::{Message, UserId};
use courier_store::MessageStore;

use crate::error::HubError;
use crate::reconcile::{self, BacklogOutcome, BacklogReport};
use crate::session::{Outbound, SessionHandle};

/// Requests handled by the hub task.
pub enum HubCommand {
    Register {
        session: SessionHandle,
        ack: oneshot::Sender<bool>,
    },
    Deregister {
        session: SessionHandle,
    },
    Deliver {
        message: Message,
        ack: oneshot::Sender<Delivery>,
    },
    IsOnline {
        user_id: UserId,
        reply: oneshot::Sender<bool>,
    },
    Stats(oneshot::Sender<HubStats>),
    /// Sent by a backlog pass when it ends.
    BacklogFinished(BacklogReport),
    Shutdown(oneshot::Sender<()>),
}

/// Which live sessions a message was handed to.
///
/// A note-to-self is enqueued once and only reported as `to_receiver`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub to_receiver: bool,
    pub to_sender: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Sessions currently registered.
    pub online: usize,
    pub registrations: u64,
    /// Registrations that displaced an older session for the same user.
    pub replacements: u64,
    pub deregister_requests: u64,
    /// Deregistrations that actually removed a registry entry.
    pub deregistrations: u64,
    /// Sessions dropped because their outbound queue was full or closed.
    pub evictions: u64,
    pub backlog_passes: u64,
    /// Backlog messages handed to sessions and marked read.
    pub backlog_delivered: u64,
    /// Passes that stopped before the whole backlog was handed over.
    pub backlog_incomplete: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub command_capacity: usize,
    /// How long the reconciler waits for room in an outbound queue.
    pub backlog_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: HUB_COMMAND_CAPACITY,
            backlog_timeout: Duration::from_millis(BACKLOG_ENQUEUE_TIMEOUT_MS),
        }
    }
}

/// Start the hub task.
pub fn spawn_hub(store: Arc<dyn MessageStore>, config: HubConfig) -> (HubHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(config.command_capacity.max(1));
    let hub = Hub {
        sessions: HashMap::new(),
        commands: commands.downgrade(),
        store: store.clone(),
        backlog_timeout: config.backlog_timeout,
        stats: HubStats::default(),
    };
    let task = tokio::spawn(hub.run(rx));
    (HubHandle { commands, store }, task)
}

/// Cloneable client of the hub task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    store: Arc<dyn MessageStore>,
}

impl HubHandle {
    /// Put `session` into the registry, replacing any previous session for
    /// the same user, and start backlog delivery. `false` if the session was
    /// already tearing down or the hub has stopped.
    pub async fn register(&self, session: SessionHandle) -> bool {
        self.request(|ack| HubCommand::Register { session, ack })
            .await
            .unwrap_or(false)
    }

    pub async fn deregister(&self, session: SessionHandle) -> Result<(), HubError> {
        self.commands
            .send(HubCommand::Deregister { session })
            .await
            .map_err(|_| HubError::Unavailable)
    }

    /// Persist `message`, then hand it to the live sessions of its receiver
    /// and sender.
    ///
    /// Only a store failure is an error. Once the message is saved the call
    /// succeeds whether or not anyone was online; an offline receiver gets it
    /// from the backlog on reconnect.
    pub async fn route(&self, message: &Message) -> Result<Delivery, HubError> {
        self.store.save(message).await?;

        let delivery = match self
            .request(|ack| HubCommand::Deliver {
                message: message.clone(),
                ack,
            })
            .await
        {
            Ok(delivery) => delivery,
            Err(_) => {
                warn!(message_id = %message.id, "Message stored but hub is not running");
                return Ok(Delivery::default());
            }
        };

        if delivery.to_receiver {
            if let Err(e) = self.store.mark_read(message.id).await {
                error!(message_id = %message.id, error = %e, "Failed to mark live delivery read");
            }
        }

        debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            to_receiver = delivery.to_receiver,
            to_sender = delivery.to_sender,
            "Routed message"
        );
        Ok(delivery)
    }

    pub async fn is_online(&self, user_id: UserId) -> Result<bool, HubError> {
        self.request(|reply| HubCommand::IsOnline { user_id, reply })
            .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(HubCommand::Stats).await
    }

    /// Drain every registered session and stop the hub task.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.request(HubCommand::Shutdown).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| HubError::Unavailable)?;
        rx.await.map_err(|_| HubError::Unavailable)
    }
}

struct Hub {
    sessions: HashMap<UserId, SessionHandle>,
    /// Weak so that the hub does not keep its own command channel open.
    commands: mpsc::WeakSender<HubCommand>,
    store: Arc<dyn MessageStore>,
    backlog_timeout: Duration,
    stats: HubStats,
}

impl Hub {
    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        info!("Hub started");

        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register { session, ack } => {
                    let registered = self.register(session);
                    let _ = ack.send(registered);
                }
                HubCommand::Deregister { session } => self.deregister(session),
                HubCommand::Deliver { message, ack } => {
                    let delivery = self.deliver(message);
                    let _ = ack.send(delivery);
                }
                HubCommand::IsOnline { user_id, reply } => {
                    let _ = reply.send(self.sessions.contains_key(&user_id));
                }
                HubCommand::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                HubCommand::BacklogFinished(report) => self.record_backlog(report),
                HubCommand::Shutdown(done) => {
                    self.drain_all();
                    let _ = done.send(());
                    break;
                }
            }
        }

        self.drain_all();
        info!(stats = ?self.snapshot(), "Hub stopped");
    }

    fn register(&mut self, session: SessionHandle) -> bool {
        let user_id = session.user_id();
        if !session.mark_registered() {
            debug!(user_id = %user_id, session = session.id(), "Refusing to register a closing session");
            return false;
        }

        if let Some(previous) = self.sessions.insert(user_id, session.clone()) {
            previous.begin_drain();
            self.stats.replacements += 1;
            info!(user_id = %user_id, session = previous.id(), "Replaced previous session");
        }
        self.stats.registrations += 1;
        info!(user_id = %user_id, session = session.id(), "Session registered");

        // The entry is visible before the backlog is read, so nothing sent
        // from here on can fall between the two paths.
        let store = self.store.clone();
        let timeout = self.backlog_timeout;
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let report = reconcile::deliver_backlog(store, session, timeout).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(HubCommand::BacklogFinished(report)).await;
            }
        });
        true
    }

    fn deregister(&mut self, session: SessionHandle) {
        self.stats.deregister_requests += 1;
        let user_id = session.user_id();

        let current = self
            .sessions
            .get(&user_id)
            .is_some_and(|s| s.id() == session.id());
        if current {
            self.sessions.remove(&user_id);
            self.stats.deregistrations += 1;
            info!(user_id = %user_id, session = session.id(), "Session deregistered");
        } else {
            debug!(user_id = %user_id, session = session.id(), "Ignoring stale deregistration");
        }
        session.begin_drain();
    }

    fn deliver(&mut self, message: Message) -> Delivery {
        let mut delivery = Delivery::default();
        for user_id in message.audience() {
            let handed_off = self.enqueue(user_id, Outbound::Deliver(message.clone()));
            if user_id == message.receiver_id {
                delivery.to_receiver = handed_off;
            } else {
                delivery.to_sender = handed_off;
            }
        }
        delivery
    }

    fn enqueue(&mut self, user_id: UserId, item: Outbound) -> bool {
        let Some(session) = self.sessions.get(&user_id) else {
            return false;
        };

        match session.try_enqueue(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %user_id, session = session.id(), "Outbound queue full, evicting slow session");
                self.evict(user_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(user_id = %user_id, session = session.id(), "Outbound queue closed, evicting session");
                self.evict(user_id);
                false
            }
        }
    }

    fn record_backlog(&mut self, report: BacklogReport) {
        self.stats.backlog_passes += 1;
        self.stats.backlog_delivered += report.delivered as u64;
        if report.outcome != BacklogOutcome::Complete {
            self.stats.backlog_incomplete += 1;
        }
    }

    fn evict(&mut self, user_id: UserId) {
        if let Some(session) = self.sessions.remove(&user_id) {
            session.begin_drain();
            self.stats.evictions += 1;
        }
    }

    fn drain_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.begin_drain();
        }
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            online: self.sessions.len(),
            ..self.stats
        }
    }
}
