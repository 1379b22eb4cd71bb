use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::warn;

use crate::events::{Addon, EventManager};

/// Submission state mirrored to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormState {
    pub processing: bool,
    /// Percentage in `0..=100`.
    pub progress: u8,
    pub recently_successful: bool,
    pub was_successful: bool,
    pub dirty: Option<bool>,
    pub valid: Option<bool>,
    pub errors: Option<bool>,
}

/// Tracks processing, progress and success flags across submissions.
#[derive(Clone)]
pub struct StateAddon {
    state: Arc<watch::Sender<FormState>>,
    reset_timer: Arc<Mutex<Option<JoinHandle<()>>>>,
    recently_successful_for: Duration,
}

impl StateAddon {
    pub fn new(recently_successful_for: Duration) -> Self {
        let (state, _) = watch::channel(FormState::default());
        Self {
            state: Arc::new(state),
            reset_timer: Arc::new(Mutex::new(None)),
            recently_successful_for,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FormState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> FormState {
        *self.state.borrow()
    }

    /// Copies the node's aggregate flags into the published state.
    pub fn mirror(&self, dirty: Option<bool>, valid: Option<bool>, errors: Option<bool>) {
        self.state.send_modify(|state| {
            state.dirty = dirty;
            state.valid = valid;
            state.errors = errors;
        });
    }

    fn cancel_reset(&self) {
        if let Some(timer) = self
            .reset_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }

    fn schedule_reset(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available; recently_successful will not reset");
            return;
        };
        let state = Arc::clone(&self.state);
        let delay = self.recently_successful_for;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            state.send_modify(|state| state.recently_successful = false);
        });
        if let Some(previous) = self
            .reset_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer)
        {
            previous.abort();
        }
    }
}

impl<C: 'static> Addon<C> for StateAddon {
    fn register(&self, on: &EventManager<C>) {
        let addon = self.clone();
        on.on_before(move |_visit, _ctx: &C| {
            addon.state.send_modify(|state| {
                state.processing = false;
                state.progress = 0;
                state.recently_successful = false;
                state.was_successful = false;
            });
            addon.cancel_reset();
        });

        let addon = self.clone();
        on.on_start(move |_visit, _ctx: &C| {
            addon.state.send_modify(|state| state.processing = true);
        });

        let addon = self.clone();
        on.on_progress(move |progress, _ctx: &C| {
            let pct = progress.and_then(|p| p.percentage()).unwrap_or(0);
            addon.state.send_modify(|state| state.progress = pct);
        });

        let addon = self.clone();
        on.on_success(move |_page, _ctx: &C| {
            addon.state.send_modify(|state| {
                state.recently_successful = true;
                state.was_successful = true;
            });
            addon.schedule_reset();
        });

        let addon = self.clone();
        on.on_finish(move |_visit, _ctx: &C| {
            addon.state.send_modify(|state| {
                state.processing = false;
                state.progress = 0;
            });
        });
    }
}
