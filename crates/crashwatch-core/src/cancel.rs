//! Cancellation for long external calls.
//!
//! A [`CancelToken`] is handed to each backend call made under
//! [`with_deadline`]. When the deadline passes the token is cancelled and the
//! caller gets [`CrashError::Deadline`] back. Implementations that never look
//! at the token keep running (and holding whatever they hold) after the caller
//! has moved on; that is accepted, not papered over.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::{CrashError, CrashResult};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn check(&self, operation: &str) -> CrashResult<()> {
        if self.is_cancelled() {
            Err(CrashError::Cancelled(operation.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Run `call` with a fresh token, cancelling it if `timeout` elapses first.
pub async fn with_deadline<T, F, Fut>(operation: &str, timeout: Duration, call: F) -> CrashResult<T>
where
    F: FnOnce(CancelToken) -> Fut,
    Fut: Future<Output = CrashResult<T>>,
{
    let token = CancelToken::new();
    match tokio::time::timeout(timeout, call(token.clone())).await {
        Ok(result) => result,
        Err(_) => {
            token.cancel();
            warn!("{} did not finish within {:?}, giving up", operation, timeout);
            Err(CrashError::Deadline {
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            })
        }
    }
}
