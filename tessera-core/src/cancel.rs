//! Query cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tessera_error::{TesseraError, TesseraResult};

/// A shared cancellation token.
///
/// Every parallel worker of a read query holds a clone and checks it at
/// stage boundaries and inside its inner loop.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> TesseraResult<()> {
        if self.is_cancelled() {
            Err(TesseraError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_clones() {
        let token = Cancellation::new();
        let clone = token.clone();
        assert!(clone.check().is_ok());
        token.cancel();
        assert!(matches!(clone.check(), Err(TesseraError::Cancelled)));
    }
}
