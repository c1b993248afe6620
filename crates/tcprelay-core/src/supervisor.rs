//! Session supervisor
//!
//! The only recovery point for per-session failures. An escalated
//! [`RelayError`](crate::RelayError) or a panic inside the session engine is
//! logged against the session id and swallowed, so the acceptor loop and every
//! other session keep running.

use crate::error::RelayError;
use crate::session::{Session, SessionId, SessionSummary};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error};

/// How a supervised session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Completed(SessionSummary),
    /// The engine escalated an unexpected failure; the session was abandoned.
    Failed(String),
    /// The engine panicked; the session was abandoned.
    Panicked(String),
}

impl SessionStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionStatus::Completed(_))
    }
}

/// Run a session to completion, containing any failure it escalates.
pub async fn supervise(session: Session) -> SessionStatus {
    let id = session.id();
    supervise_engine(id, session.run()).await
}

/// Drive any session engine future under the supervisor's containment.
pub async fn supervise_engine<F>(id: SessionId, engine: F) -> SessionStatus
where
    F: Future<Output = Result<SessionSummary, RelayError>>,
{
    match AssertUnwindSafe(engine).catch_unwind().await {
        Ok(Ok(summary)) => {
            debug!(session = %id, "Session completed");
            SessionStatus::Completed(summary)
        }
        Ok(Err(e)) => {
            error!(session = %id, origin = %e.origin(), "[{}] RECOVER: {}", id, e);
            SessionStatus::Failed(e.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(session = %id, "[{}] RECOVER: panic: {}", id, message);
            SessionStatus::Panicked(message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
