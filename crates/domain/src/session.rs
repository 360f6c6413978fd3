//! Cloud session state machine.
//!
//! ```text
//! Disconnected → Authenticating → Connected → Degraded → Disconnected → …
//! ```
//!
//! Any state may move to [`SessionState::Closed`] on explicit shutdown, and
//! nothing leaves `Closed`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Authenticating,
    Connected,
    /// Heartbeat deadline missed; a reconnect is scheduled.
    Degraded,
    /// Explicit shutdown. Terminal.
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Authenticating, Closed, Connected, Degraded, Disconnected};
        if self == Closed {
            return false;
        }
        matches!(
            (self, next),
            (_, Closed)
                | (Disconnected, Authenticating)
                | (Authenticating, Connected | Disconnected)
                | (Connected, Degraded | Disconnected)
                | (Degraded, Disconnected)
        )
    }

    /// Whether commands may be sent.
    #[must_use]
    pub fn is_live(self) -> bool {
        self == Self::Connected
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor API key obtained from the login endpoint.
///
/// Kept only in memory for the lifetime of the process.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    api_key: String,
    pub obtained_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl AuthToken {
    #[must_use]
    pub fn new(api_key: impl Into<String>, obtained_at: Timestamp) -> Self {
        Self {
            api_key: api_key.into(),
            obtained_at,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// A token without an expiry stays valid until the cloud rejects it.
    #[must_use]
    pub fn is_valid_at(&self, at: Timestamp) -> bool {
        self.expires_at.is_none_or(|expiry| at < expiry)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("api_key", &"[REDACTED]")
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now;

    #[test]
    fn should_follow_reconnect_cycle() {
        use SessionState::{Authenticating, Connected, Degraded, Disconnected};
        let cycle = [Disconnected, Authenticating, Connected, Degraded, Disconnected];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn should_reject_skipping_authentication() {
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Connected));
        assert!(!SessionState::Degraded.can_transition_to(SessionState::Connected));
    }

    #[test]
    fn should_treat_closed_as_terminal() {
        assert!(SessionState::Connected.can_transition_to(SessionState::Closed));
        for next in [
            SessionState::Disconnected,
            SessionState::Authenticating,
            SessionState::Connected,
        ] {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn should_only_send_while_connected() {
        assert!(SessionState::Connected.is_live());
        assert!(!SessionState::Degraded.is_live());
    }

    #[test]
    fn should_expire_token() {
        let obtained = now();
        let token = AuthToken::new("key", obtained)
            .with_expiry(obtained + chrono::Duration::minutes(5));
        assert!(token.is_valid_at(obtained));
        assert!(!token.is_valid_at(obtained + chrono::Duration::minutes(6)));
        assert!(AuthToken::new("key", obtained).is_valid_at(obtained));
    }

    #[test]
    fn should_redact_api_key_in_debug() {
        let token = AuthToken::new("super-secret", now());
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
