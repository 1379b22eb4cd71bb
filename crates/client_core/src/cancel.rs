use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use tokio::sync::Notify;
use tracing::debug;

use crate::events::{Addon, EventManager};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Handle that lets the issuer of a submission abort its network call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Keeps the cancel token of the submission currently in flight.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    current: Arc<Mutex<Option<CancelToken>>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previously captured token.
    pub fn capture(&self, token: &CancelToken) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
    }

    pub fn clear(&self) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn has_active(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Cancels the captured token; returns false when there was none.
    pub fn cancel(&self) -> bool {
        let token = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match token {
            Some(token) => {
                debug!("cancelling in-flight submission");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl<C: 'static> Addon<C> for CancellationController {
    fn register(&self, on: &EventManager<C>) {
        let controller = self.clone();
        on.on_cancel_token(move |token, _ctx: &C| controller.capture(token));

        let controller = self.clone();
        on.on_finish(move |_visit, _ctx: &C| controller.clear());
    }
}

#[cfg(test)]
#[path = "tests/cancel_tests.rs"]
mod tests;
