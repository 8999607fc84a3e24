//! Cancellation token checked between stages.

use std::sync::OnceLock;

/// A write-once cancellation request.
///
/// The token is cancelled exactly when it holds a reason; later requests
/// neither replace the reason nor report success.
#[derive(Debug, Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    ///
    /// Returns true if this call cancelled the token.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.reason.set(reason.into()).is_ok()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The reason given by the first `cancel` call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);

        assert!(token.cancel("client request"));
        assert!(!token.cancel("shutdown"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("client request"));
    }

    #[tokio::test]
    async fn test_only_one_concurrent_cancel_succeeds() {
        let token = Arc::new(CancellationToken::new());
        let attempts = (0..8).map(|i| {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.cancel(format!("request {i}")) })
        });

        let wins = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(wins, 1);
    }
}
