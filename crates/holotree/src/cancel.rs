//! Cooperative cancellation for long-running operations.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// The operation was cancelled by the caller.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("the operation was cancelled")]
pub struct Cancelled;

/// A cloneable cancellation signal. Record, restore, export and import check
/// the token at their loop boundaries; on cancellation they release locks,
/// remove temporaries and surface [`Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; all clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True when cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Errors with [`Cancelled`] when cancellation was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CancelToken;

    #[test]
    fn clones_observe_cancellation() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.check().is_err());
    }
}
