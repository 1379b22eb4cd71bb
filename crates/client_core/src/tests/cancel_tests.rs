use super::*;
use std::time::Duration;

use shared::{
    domain::Method,
    protocol::{Payload, Visit},
};

use crate::events::Event;

fn sample_visit() -> Visit {
    Visit::new(
        Method::Post,
        "http://localhost/users".parse().expect("url"),
        Payload::new(),
    )
}

#[test]
fn cancel_without_a_captured_token_is_a_no_op() {
    let controller = CancellationController::new();
    assert!(!controller.has_active());
    assert!(!controller.cancel());
}

#[test]
fn cancel_fires_the_captured_token() {
    let controller = CancellationController::new();
    let token = CancelToken::new();
    controller.capture(&token);

    assert!(controller.cancel());
    assert!(token.is_cancelled());
}

#[test]
fn capture_replaces_the_previous_token() {
    let controller = CancellationController::new();
    let first = CancelToken::new();
    let second = CancelToken::new();
    controller.capture(&first);
    controller.capture(&second);

    controller.cancel();
    assert!(!first.is_cancelled());
    assert!(second.is_cancelled());
}

#[tokio::test]
async fn cancelled_resolves_for_waiters_and_late_callers() {
    let token = CancelToken::new();
    let waiter = {
        let token = token.clone();
        tokio::spawn(async move { token.cancelled().await })
    };
    tokio::task::yield_now().await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woke")
        .expect("join");

    // Already cancelled: resolves immediately.
    tokio::time::timeout(Duration::from_millis(10), token.cancelled())
        .await
        .expect("late caller resolves");
}

#[test]
fn clones_share_state() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(token.same_as(&clone));
    assert!(!token.same_as(&CancelToken::new()));

    clone.cancel();
    assert!(token.is_cancelled());
}

#[tokio::test]
async fn addon_clears_the_token_on_finish() {
    let events: EventManager<()> = EventManager::new();
    let controller = CancellationController::new();
    events.combine(controller.clone());

    let token = CancelToken::new();
    events
        .execute(Event::CancelToken(&token), &())
        .expect("cancel token");
    assert!(controller.has_active());

    events
        .execute(Event::Finish(&sample_visit()), &())
        .expect("finish")
        .into_settlement()
        .expect("settlement")
        .await
        .expect("settled");

    assert!(!controller.has_active());
    assert!(!controller.cancel());
    assert!(!token.is_cancelled());
}
