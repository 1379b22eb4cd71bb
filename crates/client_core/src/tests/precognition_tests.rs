use super::*;
use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::protocol::FieldValue;
use tokio::time::Instant;

use crate::{
    node::{FormNode, MemoryNode},
    transport::TransportError,
};

const DEBOUNCE: Duration = Duration::from_millis(1_500);

struct Scripted {
    delay: Duration,
    result: Result<PrecognitionResponse, TransportError>,
}

/// Replays queued responses; answers `204` with confirmation once the queue is empty.
#[derive(Default)]
struct ScriptedTransport {
    requests: Mutex<Vec<(Instant, PrecognitionRequest)>>,
    script: Mutex<VecDeque<Scripted>>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn respond(&self, delay: Duration, result: Result<PrecognitionResponse, TransportError>) {
        self.script
            .lock()
            .expect("script")
            .push_back(Scripted { delay, result });
    }

    fn requests(&self) -> Vec<(Instant, PrecognitionRequest)> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl PrecognitionTransport for ScriptedTransport {
    async fn send(
        &self,
        request: PrecognitionRequest,
    ) -> Result<PrecognitionResponse, TransportError> {
        self.requests
            .lock()
            .expect("requests")
            .push((Instant::now(), request));
        let next = self.script.lock().expect("script").pop_front();
        match next {
            Some(Scripted { delay, result }) => {
                tokio::time::sleep(delay).await;
                result
            }
            None => Ok(confirmed(204, Value::Null)),
        }
    }
}

fn confirmed(status: u16, body: Value) -> PrecognitionResponse {
    PrecognitionResponse {
        status,
        confirmed: true,
        body,
    }
}

fn config() -> ClientConfig {
    ClientConfig::default().with_debounce(DEBOUNCE)
}

fn debouncer_with(
    transport: &Arc<ScriptedTransport>,
    config: ClientConfig,
) -> Arc<ValidationDebouncer> {
    ValidationDebouncer::new(
        Method::Post,
        "http://localhost/users".parse().expect("url"),
        config,
        Arc::clone(transport) as Arc<dyn PrecognitionTransport>,
    )
}

fn register(debouncer: &ValidationDebouncer, field: &str) -> Arc<MemoryNode> {
    let node = MemoryNode::new(field);
    debouncer.register_input(field, InputKind::Text, node.clone());
    node
}

async fn next_event(rx: &mut broadcast::Receiver<ValidationEvent>) -> ValidationEvent {
    rx.recv().await.expect("validation event")
}

#[tokio::test(start_paused = true)]
async fn commits_within_the_window_collapse_into_one_request() {
    let transport = ScriptedTransport::new();
    let debouncer = debouncer_with(&transport, config());
    register(&debouncer, "name");
    let mut rx = debouncer.subscribe();
    let started = Instant::now();

    for value in ["A", "Ad", "Ada"] {
        debouncer
            .commit("name", Payload::single("name", json!(value)))
            .expect("commit");
        assert_eq!(debouncer.phase("name"), FieldPhase::Scheduled);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    // Last commit at 1000ms; nothing may fire before 2500ms.
    tokio::time::sleep_until(started + Duration::from_millis(2_499)).await;
    assert!(transport.requests().is_empty());

    let event = next_event(&mut rx).await;
    assert_eq!(event.field, "name");
    assert_eq!(event.request_id, RequestId(1));
    assert_eq!(event.result, Ok(ValidationOutcome::Passed { status: 204 }));

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let (sent_at, request) = &requests[0];
    assert_eq!(*sent_at - started, Duration::from_millis(2_500));
    assert_eq!(request.field, "name");
    assert_eq!(
        request.payload.get("name"),
        Some(&FieldValue::Json(json!("Ada")))
    );
    assert_eq!(debouncer.phase("name"), FieldPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn distinct_fields_debounce_independently() {
    let transport = ScriptedTransport::new();
    let debouncer = debouncer_with(&transport, config());
    register(&debouncer, "name");
    register(&debouncer, "email");
    let mut rx = debouncer.subscribe();
    let started = Instant::now();

    debouncer
        .commit("name", Payload::single("name", json!("Ada")))
        .expect("commit name");
    tokio::time::sleep(Duration::from_millis(700)).await;
    debouncer
        .commit("email", Payload::single("email", json!("ada@example.com")))
        .expect("commit email");

    let first = next_event(&mut rx).await;
    let second = next_event(&mut rx).await;
    assert_eq!(first.field, "name");
    assert_eq!(second.field, "email");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].0 - started, DEBOUNCE);
    assert_eq!(requests[1].0 - started, Duration::from_millis(700) + DEBOUNCE);
    assert_eq!(requests[0].1.headers()[1].1, "name");
    assert_eq!(requests[1].1.headers()[1].1, "email");
}

#[tokio::test(start_paused = true)]
async fn unprocessable_response_applies_first_messages() {
    let transport = ScriptedTransport::new();
    transport.respond(
        Duration::ZERO,
        Ok(confirmed(
            422,
            json!({ "name": ["Required"], "age": "Must be a number" }),
        )),
    );
    let debouncer = debouncer_with(&transport, config());
    let node = register(&debouncer, "name");

    let outcome = debouncer
        .validate_now("name", Payload::single("name", json!("")))
        .await
        .expect("validation");

    let ValidationOutcome::Failed(errors) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    let expected: BTreeMap<String, String> = [
        ("age".to_string(), "Must be a number".to_string()),
        ("name".to_string(), "Required".to_string()),
    ]
    .into();
    assert_eq!(errors.first_messages(), expected);

    // The field's own messages land on the node; the rest stay per field.
    let snapshot = node.snapshot();
    assert_eq!(snapshot.errors, vec!["Required"]);
    assert_eq!(
        snapshot.field_errors.get("age").map(String::as_str),
        Some("Must be a number")
    );
}

#[tokio::test(start_paused = true)]
async fn only_the_first_message_for_the_field_reaches_its_node() {
    let transport = ScriptedTransport::new();
    transport.respond(
        Duration::ZERO,
        Ok(confirmed(422, json!({ "name": ["Required", "Too short"] }))),
    );
    let debouncer = debouncer_with(&transport, config());
    let node = register(&debouncer, "name");

    let outcome = debouncer
        .validate_now("name", Payload::single("name", json!("")))
        .await
        .expect("validation");

    assert!(matches!(outcome, ValidationOutcome::Failed(_)));
    assert_eq!(node.snapshot().errors, vec!["Required"]);
}

#[tokio::test(start_paused = true)]
async fn configured_error_key_is_extracted_instead_of_the_field_name() {
    let transport = ScriptedTransport::new();
    transport.respond(
        Duration::ZERO,
        Ok(confirmed(
            422,
            json!({ "form": "Slow down", "name": ["Required", "Too short"] }),
        )),
    );
    let config = ClientConfig {
        form_error_key: Some("form".to_string()),
        ..config()
    };
    let debouncer = debouncer_with(&transport, config);
    let node = register(&debouncer, "name");

    debouncer
        .validate_now("name", Payload::new())
        .await
        .expect("validation");

    let snapshot = node.snapshot();
    assert_eq!(snapshot.errors, vec!["Slow down"]);
    assert_eq!(
        snapshot.field_errors.get("name").map(String::as_str),
        Some("Required")
    );
}

#[tokio::test(start_paused = true)]
async fn missing_confirmation_is_an_error_for_any_status() {
    for status in [200, 204, 422, 500] {
        let transport = ScriptedTransport::new();
        transport.respond(
            Duration::ZERO,
            Ok(PrecognitionResponse {
                status,
                confirmed: false,
                body: json!({ "name": ["Required"] }),
            }),
        );
        let debouncer = debouncer_with(&transport, config());
        let node = register(&debouncer, "name");

        let err = debouncer
            .validate_now("name", Payload::new())
            .await
            .expect_err("missing confirmation");

        assert_eq!(
            err,
            PrecognitionError::MissingConfirmation {
                field: "name".to_string(),
                status,
            }
        );
        assert!(node.snapshot().errors.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn non_unprocessable_failures_count_as_passing() {
    let transport = ScriptedTransport::new();
    transport.respond(
        Duration::ZERO,
        Ok(confirmed(500, json!({ "message": "Server Error" }))),
    );
    let debouncer = debouncer_with(&transport, config());
    let node = register(&debouncer, "name");
    node.set_errors(vec!["stale".to_string()], Default::default());

    let outcome = debouncer
        .validate_now("name", Payload::new())
        .await
        .expect("validation");

    assert_eq!(outcome, ValidationOutcome::Passed { status: 500 });
    assert!(node.snapshot().errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_error_body_is_rejected() {
    let transport = ScriptedTransport::new();
    transport.respond(Duration::ZERO, Ok(confirmed(422, json!({ "name": 5 }))));
    let debouncer = debouncer_with(&transport, config());
    register(&debouncer, "name");

    let err = debouncer
        .validate_now("name", Payload::new())
        .await
        .expect_err("invalid errors");
    assert!(matches!(err, PrecognitionError::InvalidErrors { .. }));
}

#[tokio::test(start_paused = true)]
async fn transport_failure_is_reported_and_flags_cleared() {
    let transport = ScriptedTransport::new();
    transport.respond(Duration::from_millis(100), Err(TransportError::Timeout));
    let debouncer = debouncer_with(&transport, config());
    let node = register(&debouncer, "name");

    let err = debouncer
        .validate_now("name", Payload::new())
        .await
        .expect_err("transport failure");

    assert_eq!(
        err,
        PrecognitionError::Transport {
            field: "name".to_string(),
            message: TransportError::Timeout.to_string(),
        }
    );
    assert!(node.snapshot().flags.is_empty());
}

#[tokio::test(start_paused = true)]
async fn flags_are_set_while_in_flight() {
    let transport = ScriptedTransport::new();
    transport.respond(Duration::from_secs(1), Ok(confirmed(204, Value::Null)));
    let debouncer = debouncer_with(&transport, config());
    let node = register(&debouncer, "name");
    let mut rx = debouncer.subscribe();

    debouncer.commit("name", Payload::new()).expect("commit");
    tokio::time::sleep(DEBOUNCE + Duration::from_millis(500)).await;

    assert_eq!(debouncer.phase("name"), FieldPhase::InFlight);
    let flags = node.snapshot().flags;
    assert!(flags.contains(&NodeFlag::Validating));
    assert!(flags.contains(&NodeFlag::Loading));

    next_event(&mut rx).await;
    assert!(node.snapshot().flags.is_empty());
    assert_eq!(debouncer.phase("name"), FieldPhase::Idle);
}

/// Request 1 is slow and fails; request 2 is fast and passes.
async fn overlapping_requests(config: ClientConfig) -> (Vec<ValidationEvent>, Arc<MemoryNode>) {
    let transport = ScriptedTransport::new();
    transport.respond(
        Duration::from_secs(5),
        Ok(confirmed(422, json!({ "name": "Required" }))),
    );
    transport.respond(Duration::from_millis(100), Ok(confirmed(204, Value::Null)));
    let debouncer = debouncer_with(&transport, config);
    let node = register(&debouncer, "name");
    let mut rx = debouncer.subscribe();

    debouncer
        .commit("name", Payload::single("name", json!("")))
        .expect("first commit");
    tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;
    debouncer
        .commit("name", Payload::single("name", json!("Ada")))
        .expect("second commit");

    let events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    (events, node)
}

#[tokio::test(start_paused = true)]
async fn stale_response_is_superseded_when_fenced() {
    let config = ClientConfig {
        fence_stale_responses: true,
        ..config()
    };
    let (events, node) = overlapping_requests(config).await;

    assert_eq!(events[0].request_id, RequestId(2));
    assert_eq!(events[0].result, Ok(ValidationOutcome::Passed { status: 204 }));
    assert_eq!(events[1].request_id, RequestId(1));
    assert_eq!(
        events[1].result,
        Ok(ValidationOutcome::Superseded {
            latest: RequestId(2)
        })
    );
    assert!(node.snapshot().errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_response_overwrites_by_default() {
    let (events, node) = overlapping_requests(config()).await;

    assert_eq!(events[1].request_id, RequestId(1));
    assert!(matches!(events[1].result, Ok(ValidationOutcome::Failed(_))));
    assert_eq!(node.snapshot().errors, vec!["Required"]);
}

#[tokio::test(start_paused = true)]
async fn file_inputs_switch_to_multipart() {
    let transport = ScriptedTransport::new();
    let debouncer = debouncer_with(&transport, config());
    register(&debouncer, "name");
    assert_eq!(debouncer.encoding(), PayloadEncoding::Json);

    debouncer.register_input("avatar", InputKind::File, MemoryNode::new("avatar"));
    assert_eq!(debouncer.encoding(), PayloadEncoding::Multipart);

    debouncer
        .validate_now("name", Payload::new())
        .await
        .expect("validation");
    assert_eq!(transport.requests()[0].1.encoding, PayloadEncoding::Multipart);
}

#[tokio::test(start_paused = true)]
async fn unknown_fields_are_rejected() {
    let transport = ScriptedTransport::new();
    let debouncer = debouncer_with(&transport, config());

    assert_eq!(
        debouncer.commit("ghost", Payload::new()),
        Err(PrecognitionError::UnknownField("ghost".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn unregistering_drops_the_pending_timer() {
    let transport = ScriptedTransport::new();
    let debouncer = debouncer_with(&transport, config());
    register(&debouncer, "name");

    debouncer.commit("name", Payload::new()).expect("commit");
    debouncer.unregister_input("name");
    tokio::time::sleep(DEBOUNCE * 2).await;

    assert!(transport.requests().is_empty());
    assert_eq!(debouncer.phase("name"), FieldPhase::Idle);
}

#[test]
fn commit_without_a_runtime_is_rejected() {
    let transport = ScriptedTransport::new();
    let debouncer = debouncer_with(&transport, config());
    register(&debouncer, "name");

    let result = debouncer.commit("name", Payload::single("name", json!("Ada")));
    assert_eq!(result, Err(PrecognitionError::NoRuntime("name".to_string())));
    assert_eq!(debouncer.phase("name"), FieldPhase::Idle);
    assert!(transport.requests().is_empty());
}

#[test]
fn commit_from_a_plain_thread_uses_the_construction_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_time()
        .build()
        .expect("runtime");
    let transport = ScriptedTransport::new();
    let debouncer = {
        let _guard = runtime.enter();
        debouncer_with(
            &transport,
            ClientConfig::default().with_debounce(Duration::from_millis(10)),
        )
    };
    register(&debouncer, "name");
    let mut rx = debouncer.subscribe();

    debouncer
        .commit("name", Payload::single("name", json!("Ada")))
        .expect("commit");

    let event = runtime.block_on(next_event(&mut rx));
    assert_eq!(event.field, "name");
    assert_eq!(event.result, Ok(ValidationOutcome::Passed { status: 204 }));
    assert_eq!(transport.requests().len(), 1);
}

#[test]
fn precognitive_attribute_parsing() {
    assert!(!parse_precognitive_flag(None));
    assert!(parse_precognitive_flag(Some("")));
    assert!(parse_precognitive_flag(Some("true")));
    assert!(parse_precognitive_flag(Some("precognitive")));
    assert!(!parse_precognitive_flag(Some("false")));
    assert!(!parse_precognitive_flag(Some(" FALSE ")));
}
