//! Session status and event types
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Replicating
//!              ^                               |
//!              +-------- Disconnected <--------+   (fixed reconnect delay)
//!
//! Authenticating -> Failed   (proof mismatch, no retry)
//! any            -> Closed   (explicit close)
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::MqError;
use crate::types::Message;

/// State of one outbound replication session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// Created, not started
    #[default]
    Idle,
    /// Opening a transport connection
    Connecting,
    /// Exchanging identity proofs
    Authenticating,
    /// Replicating the send-log
    Replicating,
    /// Connection lost; a reconnect is scheduled
    Disconnected,
    /// Remote identity did not verify; the session gave up
    Failed(String),
    /// Closed by the caller
    Closed,
}

impl SessionStatus {
    /// True once the session will never reconnect
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Failed(_) | SessionStatus::Closed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Authenticating => write!(f, "authenticating"),
            SessionStatus::Replicating => write!(f, "replicating"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Failed(reason) => write!(f, "failed: {}", reason),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Notifications from an outbound [`super::Connection`]
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    /// The remote mirror stored this slot
    Ack { seq: u64 },
    /// Session error; `Failed` status follows when it is not retried
    Error(Arc<MqError>),
    /// The session ended and will not reconnect
    Closed,
}

/// Process-wide mailbox notifications
#[derive(Debug, Clone)]
pub enum MailboxEvent {
    /// Failure with no caller to report to (identity or directory load)
    Error(Arc<MqError>),
    /// A new entry was replicated into a listen-log
    Message(Message),
}
