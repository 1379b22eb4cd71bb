use std::sync::Arc;

use async_trait::async_trait;
use shared::protocol::{Page, Progress, Visit, VisitFailure};
use tracing::{info, warn};

use crate::{
    cancel::CancelToken,
    events::{Event, EventError, EventManager},
};

/// Fixed callback table a dispatcher drives, one entry per lifecycle event.
#[async_trait]
pub trait VisitHooks: Send + Sync {
    /// Returns false when the attempt was vetoed.
    fn on_before(&self, visit: &Visit) -> Result<bool, EventError>;
    fn on_cancel_token(&self, token: &CancelToken) -> Result<(), EventError>;
    fn on_start(&self, visit: &Visit) -> Result<(), EventError>;
    fn on_progress(&self, progress: Option<&Progress>) -> Result<(), EventError>;
    async fn on_success(&self, page: &Page) -> Result<(), EventError>;
    fn on_error(&self, failure: &VisitFailure) -> Result<(), EventError>;
    async fn on_finish(&self, visit: &Visit) -> Result<(), EventError>;
}

/// Hooks backed by a shared [`EventManager`] and one submission context.
pub struct ManagedHooks<C> {
    events: Arc<EventManager<C>>,
    ctx: C,
}

impl<C> ManagedHooks<C> {
    pub fn new(events: Arc<EventManager<C>>, ctx: C) -> Self {
        Self { events, ctx }
    }
}

#[async_trait]
impl<C> VisitHooks for ManagedHooks<C>
where
    C: Send + Sync + 'static,
{
    fn on_before(&self, visit: &Visit) -> Result<bool, EventError> {
        let decision = self.events.execute(Event::Before(visit), &self.ctx)?.decision();
        Ok(decision.unwrap_or(true))
    }

    fn on_cancel_token(&self, token: &CancelToken) -> Result<(), EventError> {
        self.events.execute(Event::CancelToken(token), &self.ctx)?;
        Ok(())
    }

    fn on_start(&self, visit: &Visit) -> Result<(), EventError> {
        self.events.execute(Event::Start(visit), &self.ctx)?;
        Ok(())
    }

    fn on_progress(&self, progress: Option<&Progress>) -> Result<(), EventError> {
        self.events.execute(Event::Progress(progress), &self.ctx)?;
        Ok(())
    }

    async fn on_success(&self, page: &Page) -> Result<(), EventError> {
        let execution = self.events.execute(Event::Success(page), &self.ctx)?;
        match execution.into_settlement() {
            Some(settlement) => settlement.await,
            None => Ok(()),
        }
    }

    fn on_error(&self, failure: &VisitFailure) -> Result<(), EventError> {
        self.events.execute(Event::Error(failure), &self.ctx)?;
        Ok(())
    }

    async fn on_finish(&self, visit: &Visit) -> Result<(), EventError> {
        let execution = self.events.execute(Event::Finish(visit), &self.ctx)?;
        match execution.into_settlement() {
            Some(settlement) => settlement.await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VisitOutcome {
    Vetoed,
    Succeeded(Page),
    Failed(VisitFailure),
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Performs the network call for `visit`, reporting progress through `hooks`.
    ///
    /// The outer error is a failing progress handler; the inner one the transport outcome.
    async fn perform(
        &self,
        visit: &Visit,
        token: &CancelToken,
        hooks: &dyn VisitHooks,
    ) -> Result<Result<Page, VisitFailure>, EventError>;

    /// Runs `before` → `cancelToken` → `start` → I/O → `success`|`error` → `finish`.
    ///
    /// Once the `before` gate passes, `finish` fires even when an earlier handler failed;
    /// the first handler error is returned afterwards.
    async fn dispatch(
        &self,
        visit: Visit,
        hooks: &dyn VisitHooks,
    ) -> Result<VisitOutcome, EventError> {
        if !hooks.on_before(&visit)? {
            info!(submission = %visit.id, url = %visit.url, "submission vetoed");
            return Ok(VisitOutcome::Vetoed);
        }

        let settled = attempt(self, &visit, hooks).await;

        let finished = hooks.on_finish(&visit).await;
        let outcome = settled?;
        finished?;
        Ok(outcome)
    }
}

async fn attempt<D>(
    dispatcher: &D,
    visit: &Visit,
    hooks: &dyn VisitHooks,
) -> Result<VisitOutcome, EventError>
where
    D: Dispatcher + ?Sized,
{
    let token = CancelToken::new();
    hooks.on_cancel_token(&token)?;
    hooks.on_start(visit)?;
    match dispatcher.perform(visit, &token, hooks).await? {
        Ok(page) => {
            hooks.on_success(&page).await?;
            Ok(VisitOutcome::Succeeded(page))
        }
        Err(failure) => {
            warn!(submission = %visit.id, %failure, "submission failed");
            hooks.on_error(&failure)?;
            Ok(VisitOutcome::Failed(failure))
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
