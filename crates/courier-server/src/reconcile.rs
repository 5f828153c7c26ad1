//! Backlog delivery for a freshly registered session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error, info, warn};

use courier_store::MessageStore;

use crate::session::{Outbound, SessionHandle, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogOutcome {
    Complete,
    /// The outbound queue stayed full past the enqueue timeout.
    TimedOut,
    /// The session stopped accepting items or was replaced mid-pass.
    SessionClosed,
    StoreFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogReport {
    /// Unread messages found when the pass started.
    pub pending: usize,
    /// Messages handed to the session and marked read.
    pub delivered: usize,
    pub outcome: BacklogOutcome,
}

/// Replay every unread message for the session's user, oldest first.
///
/// Each message is marked read as soon as it sits in the outbound queue,
/// whether or not the writer has flushed it yet. The pass stops at the first
/// enqueue timeout or store error, or as soon as the session leaves
/// `Registered`; whatever is left stays unread for the next connection.
pub async fn deliver_backlog(
    store: Arc<dyn MessageStore>,
    session: SessionHandle,
    enqueue_timeout: Duration,
) -> BacklogReport {
    let user_id = session.user_id();

    let backlog = match store.fetch_unread(user_id).await {
        Ok(backlog) => backlog,
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to load backlog");
            return BacklogReport {
                pending: 0,
                delivered: 0,
                outcome: BacklogOutcome::StoreFailed,
            };
        }
    };

    let mut report = BacklogReport {
        pending: backlog.len(),
        delivered: 0,
        outcome: BacklogOutcome::Complete,
    };

    for mut message in backlog {
        if session.state() != SessionState::Registered {
            debug!(user_id = %user_id, session = session.id(), "Session no longer registered, stopping backlog delivery");
            report.outcome = BacklogOutcome::SessionClosed;
            break;
        }

        let id = message.id;
        message.read = true;

        match session
            .enqueue_timeout(Outbound::Deliver(message), enqueue_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    user_id = %user_id,
                    remaining = report.pending - report.delivered,
                    "Outbound queue stayed full, stopping backlog delivery"
                );
                report.outcome = BacklogOutcome::TimedOut;
                break;
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(user_id = %user_id, "Session closed during backlog delivery");
                report.outcome = BacklogOutcome::SessionClosed;
                break;
            }
        }

        if let Err(e) = store.mark_read(id).await {
            error!(user_id = %user_id, message_id = %id, error = %e, "Failed to mark backlog message read");
            report.outcome = BacklogOutcome::StoreFailed;
            break;
        }
        report.delivered += 1;
    }

    if report.pending > 0 {
        info!(
            user_id = %user_id,
            pending = report.pending,
            delivered = report.delivered,
            outcome = ?report.outcome,
            "Backlog delivery finished"
        );
    }
    report
}
