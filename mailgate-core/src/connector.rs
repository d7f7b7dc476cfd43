//! Process-wide single-flight cache around [`AuthSession`].
//!
//! A [`ConnectorFactory`] is built once at a process's composition point and
//! shared (behind an `Arc`) with everything that needs a [`Session`]. However
//! many callers ask concurrently, at most one authentication attempt runs at
//! a time; callers that queued behind an attempt receive its outcome instead
//! of starting their own.
//!
//! Every attempt runs in its own task bounded by the configured timeout, so a
//! caller that gives up never leaves the gate held.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::session::{AuthError, AuthSession, AuthState, StateHandle};
use crate::token::Session;

#[derive(Default)]
struct Slot {
    current: Option<Session>,
    attempts: u64,
    last_outcome: Option<Result<Session, AuthError>>,
}

/// Hands out the process's shared [`Session`].
pub struct ConnectorFactory {
    session: Arc<AsyncMutex<AuthSession>>,
    state: StateHandle,
    slot: Arc<Mutex<Slot>>,
    timeout: Duration,
    expiry_buffer: chrono::Duration,
}

impl ConnectorFactory {
    pub fn new(session: AuthSession) -> Self {
        let state = session.state_handle();
        let timeout = session.config().auth_timeout();
        let expiry_buffer = session.config().expiry_buffer();
        Self {
            session: Arc::new(AsyncMutex::new(session)),
            state,
            slot: Arc::new(Mutex::new(Slot::default())),
            timeout,
            expiry_buffer,
        }
    }

    /// Return the cached session, authenticating first if there is none or
    /// it is about to expire.
    pub async fn get(&self) -> Result<Session, AuthError> {
        let seen = {
            let slot = self.slot.lock();
            if let Some(session) = &slot.current {
                if !session.expires_within(self.expiry_buffer) {
                    return Ok(session.clone());
                }
                tracing::debug!(generation = session.generation(), "Cached session is stale");
            }
            slot.attempts
        };
        self.single_flight(seen, false).await
    }

    /// Discard `stale` and authenticate again.
    ///
    /// If another caller already replaced `stale`, its replacement is returned
    /// without a second handshake.
    pub async fn invalidate_and_reauth(&self, stale: &Session) -> Result<Session, AuthError> {
        let seen = {
            let slot = self.slot.lock();
            if let Some(current) = &slot.current {
                if current.generation() > stale.generation() {
                    return Ok(current.clone());
                }
            }
            slot.attempts
        };
        tracing::info!(generation = stale.generation(), "Forcing re-authentication");
        self.single_flight(seen, true).await
    }

    /// The cached session, without authenticating.
    pub fn current(&self) -> Option<Session> {
        self.slot.lock().current.clone()
    }

    /// Current [`AuthSession`] state; never waits on an in-flight attempt.
    pub fn state(&self) -> AuthState {
        *self.state.read()
    }

    /// Clear a sticky failure and every cached value.
    pub async fn reset(&self) {
        let mut session = self.session.lock().await;
        session.reset();
        let mut slot = self.slot.lock();
        slot.current = None;
        slot.last_outcome = None;
    }

    async fn single_flight(&self, seen: u64, invalidate: bool) -> Result<Session, AuthError> {
        let mut gate = self.session.clone().lock_owned().await;

        {
            let slot = self.slot.lock();
            if slot.attempts != seen {
                if let Some(outcome) = &slot.last_outcome {
                    tracing::debug!("Reusing outcome of concurrent authentication attempt");
                    return outcome.clone();
                }
            }
        }

        let slot = self.slot.clone();
        let timeout = self.timeout;
        let attempt = tokio::spawn(async move {
            if invalidate {
                gate.invalidate();
            }

            let outcome = match tokio::time::timeout(timeout, gate.authenticate()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    gate.abandon();
                    tracing::error!("Authentication timed out after {:?}", timeout);
                    Err(AuthError::Timeout {
                        seconds: timeout.as_secs(),
                    })
                }
            };

            let mut slot = slot.lock();
            slot.attempts += 1;
            match &outcome {
                Ok(session) => slot.current = Some(session.clone()),
                Err(_) => slot.current = None,
            }
            slot.last_outcome = Some(outcome.clone());
            drop(slot);
            drop(gate);
            outcome
        });

        attempt.await.map_err(|e| AuthError::Internal {
            message: format!("authentication task failed: {}", e),
        })?
    }
}

impl std::fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorFactory")
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}
