//! [`SessionHandle`]: the short-lived, borrowed reference to a [`Session`]
//! that the Orchestrator and Bridge are permitted to hold (§3 ownership
//! note). Dropping a handle is exactly `release()` — RAII rather than a
//! separate call a caller could forget.

use std::sync::Arc;

use hubmcp_protocol::SessionKey;

use crate::session::Session;

pub struct SessionHandle {
    session: Arc<Session>,
    key: SessionKey,
    released: bool,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>, key: SessionKey) -> Self {
        session.touch_and_acquire();
        Self {
            session,
            key,
            released: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Explicit release, equivalent to dropping the handle. Provided so call
    /// sites can name the §4.5 operation directly.
    pub fn release(mut self) {
        self.released = true;
        self.session.release();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.released {
            self.session.release();
        }
    }
}
