//! Tracks whether the response side of an exchange may still switch protocols.

use crate::{Result, WebSocketError};

/// Progress of the response side of an [`HttpExchange`](crate::HttpExchange).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseState {
    /// Nothing was written yet; the exchange may still be upgraded.
    Pending,
    /// The status line and headers were written as an ordinary HTTP response.
    Committed,
    /// A 101 response was produced and the transport now belongs to a WebSocket.
    Upgraded,
}

/// What the caller is about to write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Commit {
    /// The head of an ordinary response (first body write or finish).
    Headers,
    /// The 101 Switching Protocols response.
    Upgrade,
}

/// Single transition point for [`ResponseState`].
///
/// Every write on an exchange goes through [`ResponseGuard::commit`] first, so the state can never move
/// backwards and an upgrade can never follow committed bytes.
#[derive(Debug)]
pub(crate) struct ResponseGuard {
    state: ResponseState,
}

impl ResponseGuard {
    pub(crate) fn new() -> Self {
        Self {
            state: ResponseState::Pending,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> ResponseState {
        self.state
    }

    /// Records the intent to write.
    ///
    /// Returns `Ok(true)` when this call performed the transition and the caller must write the head,
    /// `Ok(false)` when the head was already written by an earlier call.
    pub(crate) fn commit(&mut self, commit: Commit) -> Result<bool> {
        match (self.state, commit) {
            (ResponseState::Upgraded, _) => Err(WebSocketError::AlreadyUpgraded),
            (ResponseState::Committed, Commit::Upgrade) => Err(WebSocketError::AlreadyCommitted),
            (ResponseState::Committed, Commit::Headers) => Ok(false),
            (ResponseState::Pending, Commit::Headers) => {
                self.state = ResponseState::Committed;
                Ok(true)
            }
            (ResponseState::Pending, Commit::Upgrade) => {
                self.state = ResponseState::Upgraded;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_commit_once() {
        let mut guard = ResponseGuard::new();
        assert_eq!(guard.state(), ResponseState::Pending);

        assert!(guard.commit(Commit::Headers).unwrap());
        assert_eq!(guard.state(), ResponseState::Committed);

        assert!(!guard.commit(Commit::Headers).unwrap());
        assert_eq!(guard.state(), ResponseState::Committed);
    }

    #[test]
    fn test_upgrade_after_commit() {
        let mut guard = ResponseGuard::new();
        guard.commit(Commit::Headers).unwrap();

        assert!(matches!(
            guard.commit(Commit::Upgrade),
            Err(WebSocketError::AlreadyCommitted)
        ));
        assert_eq!(guard.state(), ResponseState::Committed);
    }

    #[test]
    fn test_upgrade_is_terminal() {
        let mut guard = ResponseGuard::new();
        assert!(guard.commit(Commit::Upgrade).unwrap());
        assert_eq!(guard.state(), ResponseState::Upgraded);

        for commit in [Commit::Upgrade, Commit::Headers] {
            assert!(matches!(
                guard.commit(commit),
                Err(WebSocketError::AlreadyUpgraded)
            ));
        }
        assert_eq!(guard.state(), ResponseState::Upgraded);
    }
}
