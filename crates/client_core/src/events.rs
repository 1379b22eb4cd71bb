//! Lifecycle event registry and executor.
//!
//! Handlers are appended per [`EventName`] and run in registration order. How a list runs
//! depends on the event class:
//!
//! - `before` stops at the first handler that returns a decision and yields it.
//! - `success` and `finish` handlers each produce an [`Effect`]; the returned [`Settlement`]
//!   drives them in order and resolves to the last one.
//! - every other event runs its handlers for their side effects only.
//!
//! A handler that fails synchronously stops the list and the error surfaces from
//! [`EventManager::execute`]. Once effects exist, the settlement drives all of them and only
//! the last one decides its result.

use std::{
    collections::HashMap,
    fmt,
    future::{Future, IntoFuture},
    sync::{Arc, PoisonError, RwLock},
};

use futures::future::BoxFuture;
use shared::protocol::{EventClass, EventName, Page, Progress, Visit, VisitFailure};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("{event} handler #{index} failed: {source}")]
    Handler {
        event: EventName,
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

impl EventError {
    pub fn event(&self) -> EventName {
        match self {
            EventError::Handler { event, .. } => *event,
        }
    }
}

/// Pending completion of a `success`/`finish` handler.
pub struct Effect(BoxFuture<'static, anyhow::Result<()>>);

impl Effect {
    pub fn ready() -> Self {
        Self(Box::pin(futures::future::ready(Ok(()))))
    }

    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Box::pin(future))
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Effect")
    }
}

/// Coerces a `success`/`finish` handler's return value into an [`Effect`].
///
/// An `Err` is a synchronous failure and stops the handler chain immediately.
pub trait IntoEffect {
    fn into_effect(self) -> anyhow::Result<Effect>;
}

impl IntoEffect for () {
    fn into_effect(self) -> anyhow::Result<Effect> {
        Ok(Effect::ready())
    }
}

impl IntoEffect for Effect {
    fn into_effect(self) -> anyhow::Result<Effect> {
        Ok(self)
    }
}

impl<T: IntoEffect> IntoEffect for anyhow::Result<T> {
    fn into_effect(self) -> anyhow::Result<Effect> {
        self.and_then(IntoEffect::into_effect)
    }
}

/// Coerces a `before` handler's return value into an optional decision.
pub trait IntoDecision {
    fn into_decision(self) -> anyhow::Result<Option<bool>>;
}

impl IntoDecision for () {
    fn into_decision(self) -> anyhow::Result<Option<bool>> {
        Ok(None)
    }
}

impl IntoDecision for bool {
    fn into_decision(self) -> anyhow::Result<Option<bool>> {
        Ok(Some(self))
    }
}

impl IntoDecision for Option<bool> {
    fn into_decision(self) -> anyhow::Result<Option<bool>> {
        Ok(self)
    }
}

impl<T: IntoDecision> IntoDecision for anyhow::Result<T> {
    fn into_decision(self) -> anyhow::Result<Option<bool>> {
        self.and_then(IntoDecision::into_decision)
    }
}

pub trait IntoCompletion {
    fn into_completion(self) -> anyhow::Result<()>;
}

impl IntoCompletion for () {
    fn into_completion(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl IntoCompletion for anyhow::Result<()> {
    fn into_completion(self) -> anyhow::Result<()> {
        self
    }
}

type BeforeFn<C> = Arc<dyn Fn(&Visit, &C) -> anyhow::Result<Option<bool>> + Send + Sync>;
type VisitFn<C> = Arc<dyn Fn(&Visit, &C) -> anyhow::Result<()> + Send + Sync>;
type ProgressFn<C> = Arc<dyn Fn(Option<&Progress>, &C) -> anyhow::Result<()> + Send + Sync>;
type SuccessFn<C> = Arc<dyn Fn(&Page, &C) -> anyhow::Result<Effect> + Send + Sync>;
type ErrorFn<C> = Arc<dyn Fn(&VisitFailure, &C) -> anyhow::Result<()> + Send + Sync>;
type CancelTokenFn<C> = Arc<dyn Fn(&CancelToken, &C) -> anyhow::Result<()> + Send + Sync>;
type FinishFn<C> = Arc<dyn Fn(&Visit, &C) -> anyhow::Result<Effect> + Send + Sync>;

/// A handler bound to exactly one lifecycle event.
pub enum Handler<C> {
    Before(BeforeFn<C>),
    Start(VisitFn<C>),
    Progress(ProgressFn<C>),
    Success(SuccessFn<C>),
    Error(ErrorFn<C>),
    CancelToken(CancelTokenFn<C>),
    Finish(FinishFn<C>),
}

impl<C> Clone for Handler<C> {
    fn clone(&self) -> Self {
        match self {
            Handler::Before(f) => Handler::Before(Arc::clone(f)),
            Handler::Start(f) => Handler::Start(Arc::clone(f)),
            Handler::Progress(f) => Handler::Progress(Arc::clone(f)),
            Handler::Success(f) => Handler::Success(Arc::clone(f)),
            Handler::Error(f) => Handler::Error(Arc::clone(f)),
            Handler::CancelToken(f) => Handler::CancelToken(Arc::clone(f)),
            Handler::Finish(f) => Handler::Finish(Arc::clone(f)),
        }
    }
}

impl<C: 'static> Handler<C> {
    pub fn name(&self) -> EventName {
        match self {
            Handler::Before(_) => EventName::Before,
            Handler::Start(_) => EventName::Start,
            Handler::Progress(_) => EventName::Progress,
            Handler::Success(_) => EventName::Success,
            Handler::Error(_) => EventName::Error,
            Handler::CancelToken(_) => EventName::CancelToken,
            Handler::Finish(_) => EventName::Finish,
        }
    }

    pub fn before<F, R>(f: F) -> Self
    where
        F: Fn(&Visit, &C) -> R + Send + Sync + 'static,
        R: IntoDecision,
    {
        Handler::Before(Arc::new(move |visit: &Visit, ctx: &C| {
            f(visit, ctx).into_decision()
        }))
    }

    pub fn start<F, R>(f: F) -> Self
    where
        F: Fn(&Visit, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        Handler::Start(Arc::new(move |visit: &Visit, ctx: &C| {
            f(visit, ctx).into_completion()
        }))
    }

    pub fn progress<F, R>(f: F) -> Self
    where
        F: Fn(Option<&Progress>, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        Handler::Progress(Arc::new(move |progress: Option<&Progress>, ctx: &C| {
            f(progress, ctx).into_completion()
        }))
    }

    pub fn success<F, R>(f: F) -> Self
    where
        F: Fn(&Page, &C) -> R + Send + Sync + 'static,
        R: IntoEffect,
    {
        Handler::Success(Arc::new(move |page: &Page, ctx: &C| {
            f(page, ctx).into_effect()
        }))
    }

    pub fn error<F, R>(f: F) -> Self
    where
        F: Fn(&VisitFailure, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        Handler::Error(Arc::new(move |failure: &VisitFailure, ctx: &C| {
            f(failure, ctx).into_completion()
        }))
    }

    pub fn cancel_token<F, R>(f: F) -> Self
    where
        F: Fn(&CancelToken, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        Handler::CancelToken(Arc::new(move |token: &CancelToken, ctx: &C| {
            f(token, ctx).into_completion()
        }))
    }

    pub fn finish<F, R>(f: F) -> Self
    where
        F: Fn(&Visit, &C) -> R + Send + Sync + 'static,
        R: IntoEffect,
    {
        Handler::Finish(Arc::new(move |visit: &Visit, ctx: &C| {
            f(visit, ctx).into_effect()
        }))
    }
}

/// Arguments for one execution of an event's handler list.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Before(&'a Visit),
    Start(&'a Visit),
    Progress(Option<&'a Progress>),
    Success(&'a Page),
    Error(&'a VisitFailure),
    CancelToken(&'a CancelToken),
    Finish(&'a Visit),
}

impl Event<'_> {
    pub fn name(&self) -> EventName {
        match self {
            Event::Before(_) => EventName::Before,
            Event::Start(_) => EventName::Start,
            Event::Progress(_) => EventName::Progress,
            Event::Success(_) => EventName::Success,
            Event::Error(_) => EventName::Error,
            Event::CancelToken(_) => EventName::CancelToken,
            Event::Finish(_) => EventName::Finish,
        }
    }
}

/// Ordered completion of a `success`/`finish` handler list.
pub struct Settlement {
    event: EventName,
    effects: Vec<Effect>,
}

impl Settlement {
    fn empty(event: EventName) -> Self {
        Self {
            event,
            effects: Vec::new(),
        }
    }

    pub fn event(&self) -> EventName {
        self.event
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Drives every effect in registration order; the result is the last effect's.
    /// Earlier rejections are logged and do not change the outcome.
    pub async fn settle(self) -> Result<(), EventError> {
        let event = self.event;
        let last = self.effects.len().saturating_sub(1);
        let mut outcome = Ok(());
        for (index, Effect(effect)) in self.effects.into_iter().enumerate() {
            match effect.await {
                Ok(()) if index == last => outcome = Ok(()),
                Ok(()) => {}
                Err(source) if index == last => {
                    outcome = Err(EventError::Handler {
                        event,
                        index,
                        source,
                    })
                }
                Err(error) => warn!(%event, index, %error, "earlier handler effect rejected"),
            }
        }
        outcome
    }
}

impl IntoFuture for Settlement {
    type Output = Result<(), EventError>;
    type IntoFuture = BoxFuture<'static, Result<(), EventError>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.settle())
    }
}

impl fmt::Debug for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settlement")
            .field("event", &self.event)
            .field("effects", &self.effects.len())
            .finish()
    }
}

#[derive(Debug)]
pub enum Execution {
    /// Result of the `before` gate; `None` when no handler decided.
    Decision(Option<bool>),
    Settling(Settlement),
    Completed,
}

impl Execution {
    pub fn decision(&self) -> Option<bool> {
        match self {
            Execution::Decision(decision) => *decision,
            _ => None,
        }
    }

    pub fn into_settlement(self) -> Option<Settlement> {
        match self {
            Execution::Settling(settlement) => Some(settlement),
            _ => None,
        }
    }
}

/// A bundle of handler registrations applied to a shared [`EventManager`].
pub trait Addon<C>: Send + Sync {
    fn register(&self, on: &EventManager<C>);
}

impl<C, F> Addon<C> for F
where
    F: Fn(&EventManager<C>) + Send + Sync,
{
    fn register(&self, on: &EventManager<C>) {
        self(on)
    }
}

pub struct EventManager<C> {
    handlers: RwLock<HashMap<EventName, Vec<Handler<C>>>>,
}

impl<C> Default for EventManager<C> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<C: 'static> EventManager<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, handler: Handler<C>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.entry(handler.name()).or_default().push(handler);
    }

    pub fn on_before<F, R>(&self, f: F)
    where
        F: Fn(&Visit, &C) -> R + Send + Sync + 'static,
        R: IntoDecision,
    {
        self.on(Handler::before(f));
    }

    pub fn on_start<F, R>(&self, f: F)
    where
        F: Fn(&Visit, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        self.on(Handler::start(f));
    }

    pub fn on_progress<F, R>(&self, f: F)
    where
        F: Fn(Option<&Progress>, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        self.on(Handler::progress(f));
    }

    pub fn on_success<F, R>(&self, f: F)
    where
        F: Fn(&Page, &C) -> R + Send + Sync + 'static,
        R: IntoEffect,
    {
        self.on(Handler::success(f));
    }

    pub fn on_error<F, R>(&self, f: F)
    where
        F: Fn(&VisitFailure, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        self.on(Handler::error(f));
    }

    pub fn on_cancel_token<F, R>(&self, f: F)
    where
        F: Fn(&CancelToken, &C) -> R + Send + Sync + 'static,
        R: IntoCompletion,
    {
        self.on(Handler::cancel_token(f));
    }

    pub fn on_finish<F, R>(&self, f: F)
    where
        F: Fn(&Visit, &C) -> R + Send + Sync + 'static,
        R: IntoEffect,
    {
        self.on(Handler::finish(f));
    }

    /// Registers one addon; its handlers land after everything registered so far.
    pub fn combine<A>(&self, addon: A)
    where
        A: Addon<C>,
    {
        addon.register(self);
    }

    /// Registers addons in list order.
    pub fn combine_all(&self, addons: &[&dyn Addon<C>]) {
        for addon in addons {
            addon.register(self);
        }
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .map_or(0, Vec::len)
    }

    fn snapshot(&self, name: EventName) -> Vec<Handler<C>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs the handler list for `event` with the per-class semantics of the module docs.
    ///
    /// Handlers registered while the list is running only take part in later executions.
    pub fn execute(&self, event: Event<'_>, ctx: &C) -> Result<Execution, EventError> {
        let name = event.name();
        let handlers = self.snapshot(name);
        debug!(event = %name, handlers = handlers.len(), "executing lifecycle event");

        let fail = |index: usize, source: anyhow::Error| EventError::Handler {
            event: name,
            index,
            source,
        };

        match name.class() {
            EventClass::Veto => {
                for (index, handler) in handlers.iter().enumerate() {
                    if let (Handler::Before(f), Event::Before(visit)) = (handler, event) {
                        if let Some(decision) = f(visit, ctx).map_err(|e| fail(index, e))? {
                            debug!(event = %name, index, decision, "before gate decided");
                            return Ok(Execution::Decision(Some(decision)));
                        }
                    }
                }
                Ok(Execution::Decision(None))
            }
            EventClass::Settled => {
                let mut settlement = Settlement::empty(name);
                for (index, handler) in handlers.iter().enumerate() {
                    let effect = match (handler, event) {
                        (Handler::Success(f), Event::Success(page)) => f(page, ctx),
                        (Handler::Finish(f), Event::Finish(visit)) => f(visit, ctx),
                        _ => continue,
                    };
                    settlement.effects.push(effect.map_err(|e| fail(index, e))?);
                }
                Ok(Execution::Settling(settlement))
            }
            EventClass::SideEffect => {
                for (index, handler) in handlers.iter().enumerate() {
                    let result = match (handler, event) {
                        (Handler::Start(f), Event::Start(visit)) => f(visit, ctx),
                        (Handler::Progress(f), Event::Progress(progress)) => f(progress, ctx),
                        (Handler::Error(f), Event::Error(failure)) => f(failure, ctx),
                        (Handler::CancelToken(f), Event::CancelToken(token)) => f(token, ctx),
                        _ => continue,
                    };
                    result.map_err(|e| fail(index, e))?;
                }
                Ok(Execution::Completed)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/events_tests.rs"]
mod tests;
