//! Connection authorization gate
//!
//! The dispatcher evaluates the gate before admitting any start/stop/list
//! request; the tail core itself performs no credential checks. Credential
//! policy (OAuth, sessions, ...) lives outside this daemon; this seam only
//! answers "is this connection authorized".

/// Predicate deciding whether a connection may issue requests.
pub trait AuthGate: Send + Sync {
    /// `token` is whatever the client presented in its `hello` request;
    /// `None` means no handshake has happened yet.
    fn authorize(&self, token: Option<&str>) -> bool;
}

/// Shared-token gate. With no token configured every connection is
/// authorized immediately; with one, a matching `hello` is required first.
pub struct TokenGate {
    token: Option<String>,
}

impl TokenGate {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl AuthGate for TokenGate {
    fn authorize(&self, token: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => token == Some(expected.as_str()),
        }
    }
}
