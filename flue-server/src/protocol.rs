//! Outbound session messages and how session failures end a connection.

use axum::extract::ws::close_code;
use flue_core::{ScheduleError, ValidationError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Every message the server sends on a streaming endpoint.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ServerMessage {
    Progress { progress: f64 },
    Finished { result: Value },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Server received message that is not in json format")]
    NotJson,

    #[error("Authorization error")]
    Unauthorized,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("client disconnected")]
    Disconnected,

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// How a failed session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The client is gone; nothing more is sent.
    Silent,
    /// Close with a policy-violation frame carrying the reason.
    Policy(String),
    /// Unclassified failure; close with an internal error frame.
    Internal,
}

impl Termination {
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Silent => None,
            Self::Policy(_) => Some(close_code::POLICY),
            Self::Internal => Some(close_code::ERROR),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Silent => "",
            Self::Policy(reason) => reason,
            Self::Internal => "Internal server error",
        }
    }
}

impl SessionError {
    pub fn termination(&self) -> Termination {
        match self {
            Self::NotJson | Self::Unauthorized | Self::Validation(_) => {
                Termination::Policy(self.to_string())
            }
            Self::Schedule(err) if err.is_domain() => Termination::Policy(err.to_string()),
            Self::Schedule(ScheduleError::Cancelled) | Self::Disconnected => Termination::Silent,
            Self::Schedule(_) | Self::Unexpected(_) => Termination::Internal,
        }
    }
}
