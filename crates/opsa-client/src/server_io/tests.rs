use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use opsa_core::{ClientError, CorrelationId, PeerSubscriptionId};
use opsa_logging::capture_logs;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::Level;

use super::ServerIo;
use crate::handler::{FnHandler, Handlers, NoopHandler, SubscriptionEvent};
use crate::requests::RequestState;
use crate::subscriptions::SubscriptionState;
use crate::testing::{RecordingSink, ack, remove, response, update};

fn attached() -> (ServerIo, Arc<RecordingSink>) {
    let io = ServerIo::new();
    let sink = RecordingSink::new();
    io.attach(sink.clone());
    (io, sink)
}

fn counting_handlers() -> (Handlers, Arc<Mutex<Vec<Value>>>, Arc<AtomicUsize>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let removes = Arc::new(AtomicUsize::new(0));
    let (u, r) = (Arc::clone(&updates), Arc::clone(&removes));
    let handlers = Handlers::new(
        move |v| u.lock().push(v.clone()),
        move || {
            let _ = r.fetch_add(1, Ordering::SeqCst);
        },
    );
    (handlers, updates, removes)
}

// ── requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn request_while_detached_is_sent_on_attach() {
    let io = ServerIo::new();
    let handle = io.request("echo", json!({"v": 1})).unwrap();
    assert!(handle.try_response().is_none());
    assert_eq!(io.pending_requests()[0].state, RequestState::WaitingForSocket);

    let sink = RecordingSink::new();
    io.attach(sink.clone());
    assert_eq!(
        sink.frames(),
        vec![json!({"kind": "request", "index": 0, "method": "echo", "data": {"v": 1}})]
    );

    io.handle_message(&response(0, json!({"v": 1})));
    assert_eq!(handle.response().await, Ok(json!({"v": 1})));
    assert!(io.pending_requests().is_empty());
}

#[tokio::test]
async fn sent_request_is_resent_once_per_reattach_with_same_frame() {
    let (io, first) = attached();
    let handle = io.request("playlocal", json!({"file_id": "f1"})).unwrap();
    let original = first.raw();
    assert_eq!(original.len(), 1);

    io.detach();
    assert_eq!(io.pending_requests()[0].state, RequestState::WaitingForSocket);

    let second = RecordingSink::new();
    io.attach(second.clone());
    assert_eq!(second.raw(), original);

    io.detach();
    let third = RecordingSink::new();
    io.attach(third.clone());
    assert_eq!(third.raw(), original);

    io.handle_message(&response(0, json!({"url": "/media/f1"})));
    assert_eq!(handle.response().await, Ok(json!({"url": "/media/f1"})));
}

#[tokio::test]
async fn replay_preserves_index_order() {
    let io = ServerIo::new();
    let _a = io.request("a", Value::Null).unwrap();
    let _b = io.request("b", Value::Null).unwrap();
    let _c = io.request("c", Value::Null).unwrap();

    let sink = RecordingSink::new();
    io.attach(sink.clone());
    let indices: Vec<_> = sink.frames().iter().map(|f| f["index"].clone()).collect();
    assert_eq!(indices, vec![json!(0), json!(1), json!(2)]);
}

#[tokio::test]
async fn responses_may_arrive_out_of_order() {
    let (io, _sink) = attached();
    let first = io.request("slow", Value::Null).unwrap();
    let second = io.request("fast", Value::Null).unwrap();

    io.handle_message(&response(1, json!("fast")));
    io.handle_message(&response(0, json!("slow")));

    assert_eq!(first.response().await, Ok(json!("slow")));
    assert_eq!(second.response().await, Ok(json!("fast")));
}

#[tokio::test]
async fn cancel_waiting_request_never_sends() {
    let io = ServerIo::new();
    let handle = io.request("echo", json!({})).unwrap();

    assert_eq!(handle.cancel().await, Ok(None));
    assert_eq!(handle.response().await, Err(ClientError::Canceled));

    let sink = RecordingSink::new();
    io.attach(sink.clone());
    assert!(sink.frames().is_empty());
    assert!(io.pending_requests().is_empty());
}

#[tokio::test]
async fn cancel_sent_then_detach_ends_canceled() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!({})).unwrap();

    let canceling = handle.cancel();
    assert_eq!(handle.try_response(), Some(Err(ClientError::Canceled)));
    assert_eq!(io.pending_requests()[0].state, RequestState::Canceling);

    io.detach();
    assert_eq!(canceling.await, Ok(None));
    assert!(io.pending_requests().is_empty());

    let next = RecordingSink::new();
    io.attach(next.clone());
    assert!(next.frames().is_empty());
}

#[tokio::test]
async fn cancel_sent_then_late_response_goes_to_canceler() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!({"v": 2})).unwrap();

    let canceling = handle.cancel();
    io.handle_message(&response(0, json!({"v": 2})));

    assert_eq!(canceling.await, Ok(Some(json!({"v": 2}))));
    assert_eq!(handle.response().await, Err(ClientError::Canceled));
    assert!(io.pending_requests().is_empty());
}

#[tokio::test]
async fn second_cancel_is_refused() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!({})).unwrap();
    let _first = handle.cancel();
    assert_eq!(handle.cancel().await, Err(ClientError::AlreadyCanceled));

    io.detach();
    assert_eq!(handle.cancel().await, Err(ClientError::AlreadyCompleted));
}

#[tokio::test]
async fn cancel_after_return_is_already_completed() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!(1)).unwrap();
    io.handle_message(&response(0, json!(1)));
    assert_eq!(handle.cancel().await, Err(ClientError::AlreadyCompleted));
    assert_eq!(handle.response().await, Ok(json!(1)));
}

#[tokio::test]
async fn response_for_unknown_index_is_logged_and_dropped() {
    let (logs, _guard) = capture_logs();
    let (io, _sink) = attached();
    let handle = io.request("echo", json!(1)).unwrap();

    io.handle_message(&response(42, json!("stray")));
    assert!(logs.has_event(Level::WARN, "response for unknown index"));
    assert!(handle.try_response().is_none());

    io.handle_message(&response(0, json!(1)));
    assert_eq!(handle.response().await, Ok(json!(1)));
}

#[tokio::test]
async fn failed_send_leaves_request_waiting() {
    let (io, sink) = attached();
    sink.set_failing(true);
    let handle = io.request("echo", json!(1)).unwrap();
    assert_eq!(io.pending_requests()[0].state, RequestState::WaitingForSocket);

    io.detach();
    let next = RecordingSink::new();
    io.attach(next.clone());
    assert_eq!(next.frames().len(), 1);

    io.handle_message(&response(handle.index().get(), json!(1)));
    assert_eq!(handle.response().await, Ok(json!(1)));
}

#[tokio::test]
async fn attach_while_attached_replays_on_new_sink() {
    let (io, first) = attached();
    let _handle = io.request("echo", json!(1)).unwrap();
    assert_eq!(first.frames().len(), 1);

    let second = RecordingSink::new();
    io.attach(second.clone());
    assert_eq!(second.frames().len(), 1);
    assert_eq!(first.frames().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn response_timeout_cancels_request() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!(1)).unwrap();

    let outcome = handle.response_timeout(Duration::from_secs(1)).await;
    assert_eq!(outcome, Err(ClientError::Canceled));
    assert_eq!(io.pending_requests()[0].state, RequestState::Canceling);

    io.handle_message(&response(0, json!(1)));
    assert!(io.pending_requests().is_empty());
}

#[tokio::test]
async fn response_timeout_returns_prompt_response() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!(1)).unwrap();
    io.handle_message(&response(0, json!("ok")));
    assert_eq!(
        handle.response_timeout(Duration::from_secs(5)).await,
        Ok(json!("ok"))
    );
}

// ── subscriptions ───────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_ack_update_and_stray_notification() {
    let (logs, _guard) = capture_logs();
    let (io, sink) = attached();
    let (handlers, updates, removes) = counting_handlers();
    let sub = io.subscribe("topic", Value::Null, handlers).unwrap();

    assert_eq!(
        sink.take(),
        vec![json!({"kind": "request", "index": 0, "method": "subscribe", "data": {"name": "topic"}})]
    );
    assert_eq!(sub.state(), SubscriptionState::Subscribing);
    assert_eq!(sub.value(), Err(ClientError::NoValueYet));

    io.handle_message(&ack(0, 7));
    assert_eq!(sub.state(), SubscriptionState::Subscribed);

    io.handle_message(&update(7, json!(5)));
    assert_eq!(*updates.lock(), vec![json!(5)]);
    assert_eq!(sub.value(), Ok(json!(5)));
    assert_eq!(sub.wait().await, Ok(json!(5)));

    io.handle_message(&update(99, json!(6)));
    assert!(logs.has_event(Level::WARN, "notification for unknown subscription index"));
    assert_eq!(updates.lock().len(), 1);
    assert_eq!(removes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wait_resolves_with_first_update_only() {
    let (io, _sink) = attached();
    let sub = io.subscribe("listfiles", Value::Null, NoopHandler).unwrap();
    io.handle_message(&ack(0, 1));
    io.handle_message(&update(1, json!("first")));
    io.handle_message(&update(1, json!("second")));

    assert_eq!(sub.wait().await, Ok(json!("first")));
    assert_eq!(sub.value(), Ok(json!("second")));
}

#[tokio::test]
async fn filter_is_merged_into_subscribe_data() {
    let (io, sink) = attached();
    let _sub = io
        .subscribe("listfiles", json!({"dir": "movies"}), NoopHandler)
        .unwrap();
    assert_eq!(sink.frames()[0]["data"], json!({"name": "listfiles", "dir": "movies"}));
}

#[test]
fn non_object_filter_is_rejected() {
    let io = ServerIo::new();
    assert_matches!(
        io.subscribe("t", json!("nope"), NoopHandler),
        Err(ClientError::Encode(_))
    );
    assert!(io.active_subscriptions().is_empty());
}

#[tokio::test]
async fn reattach_resubscribes_once_and_ignores_stale_index() {
    let (io, first) = attached();
    let (handle_events, updates, _removes) = counting_handlers();
    let sub = io.subscribe("ccdiscovery", Value::Null, handle_events).unwrap();
    io.handle_message(&ack(0, 7));
    let _ = first.take();

    io.detach();
    assert_eq!(sub.state(), SubscriptionState::Subscribing);

    let second = RecordingSink::new();
    io.attach(second.clone());
    let frames = second.take();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["method"], "subscribe");
    assert_eq!(frames[0]["index"], 1);

    io.handle_message(&update(7, json!("stale")));
    assert!(updates.lock().is_empty());

    io.handle_message(&ack(1, 3));
    io.handle_message(&update(7, json!("stale")));
    io.handle_message(&update(3, json!("fresh")));
    assert_eq!(*updates.lock(), vec![json!("fresh")]);
    assert_eq!(
        io.active_subscriptions()[0].server_index,
        Some(PeerSubscriptionId::new(3))
    );
}

#[tokio::test]
async fn peer_reusing_index_after_reconnect_routes_to_new_binding() {
    let (io, _first) = attached();
    let (a_events, a_updates, _) = counting_handlers();
    let (b_events, b_updates, _) = counting_handlers();
    let _a = io.subscribe("a", Value::Null, a_events).unwrap();
    io.handle_message(&ack(0, 0));

    io.detach();
    let _b = io.subscribe("b", Value::Null, b_events).unwrap();
    let second = RecordingSink::new();
    io.attach(second.clone());

    // the peer hands b the index a held on the old transport
    let frames = second.take();
    let b_frame = frames.iter().find(|f| f["data"]["name"] == "b").unwrap();
    io.handle_message(&ack(b_frame["index"].as_u64().unwrap(), 0));
    io.handle_message(&update(0, json!("for b")));

    assert!(a_updates.lock().is_empty());
    assert_eq!(*b_updates.lock(), vec![json!("for b")]);
}

#[tokio::test]
async fn cancel_before_ack_unsubscribes_after_late_ack() {
    let (io, sink) = attached();
    let (handlers, updates, removes) = counting_handlers();
    let sub = io.subscribe("topic", Value::Null, handlers).unwrap();
    let _ = sink.take();

    let done = sub.cancel();
    assert_eq!(sub.state(), SubscriptionState::UnsubscribingWhileSubscribing);
    assert_eq!(sub.wait().await, Err(ClientError::Canceled));

    io.handle_message(&ack(0, 7));
    assert_eq!(
        sink.take(),
        vec![json!({"kind": "request", "index": 1, "method": "unsubscribe", "data": {"index": 7}})]
    );
    assert_eq!(sub.state(), SubscriptionState::Unsubscribing);

    io.handle_message(&update(7, json!("late")));
    io.handle_message(&response(1, json!({})));

    assert_eq!(done.await, Ok(()));
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    assert!(updates.lock().is_empty());
    assert_eq!(removes.load(Ordering::SeqCst), 0);
    assert!(io.active_subscriptions().is_empty());
}

#[tokio::test]
async fn cancel_subscribed_sends_unsubscribe_and_silences_handler() {
    let (io, sink) = attached();
    let (handlers, updates, removes) = counting_handlers();
    let sub = io.subscribe("topic", Value::Null, handlers).unwrap();
    io.handle_message(&ack(0, 4));
    io.handle_message(&update(4, json!(1)));
    let _ = sink.take();

    let done = sub.cancel();
    assert_eq!(sub.state(), SubscriptionState::Unsubscribing);
    assert_eq!(sink.take()[0]["data"], json!({"index": 4}));

    io.handle_message(&update(4, json!(2)));
    assert_eq!(*updates.lock(), vec![json!(1)]);

    io.handle_message(&response(1, json!({})));
    assert_eq!(done.await, Ok(()));
    assert_eq!(sub.value(), Ok(json!(1)));
    assert_eq!(removes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_subscription_cancel_is_refused() {
    let (io, _sink) = attached();
    let sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    let _first = sub.cancel();
    assert_eq!(sub.cancel().await, Err(ClientError::AlreadyCanceled));
}

#[tokio::test]
async fn cancel_waiting_subscription_is_immediate() {
    let io = ServerIo::new();
    let sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    assert_eq!(sub.state(), SubscriptionState::WaitingForSocket);

    assert_eq!(sub.cancel().await, Ok(()));
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    assert_eq!(sub.wait().await, Err(ClientError::Canceled));

    let sink = RecordingSink::new();
    io.attach(sink.clone());
    assert!(sink.frames().is_empty());
    assert_eq!(sub.cancel().await, Err(ClientError::AlreadyCanceled));
}

#[tokio::test]
async fn cancel_after_detach_while_subscribing_is_immediate() {
    let (io, _sink) = attached();
    let sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    io.detach();
    assert_eq!(sub.state(), SubscriptionState::Subscribing);

    assert_eq!(sub.cancel().await, Ok(()));
    let next = RecordingSink::new();
    io.attach(next.clone());
    assert!(next.frames().is_empty());
}

#[tokio::test]
async fn unsubscribing_finalizes_on_detach() {
    let (io, _sink) = attached();
    let sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    io.handle_message(&ack(0, 2));
    let done = sub.cancel();

    io.detach();
    assert_eq!(done.await, Ok(()));
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);

    let next = RecordingSink::new();
    io.attach(next.clone());
    assert!(next.frames().is_empty());
}

#[tokio::test]
async fn unsubscribing_while_subscribing_finalizes_on_detach() {
    let (io, _sink) = attached();
    let sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    let done = sub.cancel();
    io.detach();
    assert_eq!(done.await, Ok(()));

    let next = RecordingSink::new();
    io.attach(next.clone());
    assert!(next.frames().is_empty());
}

#[tokio::test]
async fn peer_removal_invokes_remove_handler() {
    let (io, _sink) = attached();
    let (handlers, _updates, removes) = counting_handlers();
    let sub = io.subscribe("ccdiscovery", Value::Null, handlers).unwrap();
    io.handle_message(&ack(0, 5));
    io.handle_message(&remove(5));

    assert_eq!(removes.load(Ordering::SeqCst), 1);
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    assert_eq!(sub.wait().await, Err(ClientError::Removed));
    assert_eq!(sub.cancel().await, Err(ClientError::AlreadyCanceled));

    io.handle_message(&update(5, json!(1)));
    assert!(io.active_subscriptions().is_empty());
}

#[tokio::test]
async fn removal_with_default_handler_warns() {
    let (logs, _guard) = capture_logs();
    let (io, _sink) = attached();
    let _sub = io
        .subscribe("topic", Value::Null, FnHandler(|_: &Value| {}))
        .unwrap();
    io.handle_message(&ack(0, 1));
    io.handle_message(&remove(1));
    assert!(logs.has_event(Level::WARN, "subscription removal was ignored"));
}

#[tokio::test]
async fn malformed_ack_ends_subscription() {
    let (io, _sink) = attached();
    let (handlers, _updates, removes) = counting_handlers();
    let sub = io.subscribe("topic", Value::Null, handlers).unwrap();
    io.handle_message(&response(0, json!({"error": "no such topic"})));

    assert_matches!(sub.wait().await, Err(ClientError::Protocol(_)));
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    assert_eq!(removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscribe_send_failure_retries_on_attach() {
    let (io, sink) = attached();
    sink.set_failing(true);
    let sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    assert_eq!(sub.state(), SubscriptionState::WaitingForSocket);

    let next = RecordingSink::new();
    io.attach(next.clone());
    assert_eq!(next.frames().len(), 1);
    assert_eq!(sub.state(), SubscriptionState::Subscribing);
}

#[tokio::test]
async fn channel_subscription_delivers_events() {
    let (io, _sink) = attached();
    let (_sub, mut rx) = io.subscribe_channel("topic", Value::Null).unwrap();
    io.handle_message(&ack(0, 0));
    io.handle_message(&update(0, json!([1, 2])));
    io.handle_message(&remove(0));

    assert_eq!(rx.recv().await, Some(SubscriptionEvent::Update(json!([1, 2]))));
    assert_eq!(rx.recv().await, Some(SubscriptionEvent::Removed));
}

#[tokio::test]
async fn next_value_follows_updates() {
    let (io, _sink) = attached();
    let mut sub = io.subscribe("topic", Value::Null, NoopHandler).unwrap();
    io.handle_message(&ack(0, 0));
    io.handle_message(&update(0, json!(1)));
    assert_eq!(sub.next_value().await, Some(json!(1)));

    io.handle_message(&remove(0));
    assert_eq!(sub.next_value().await, None);
}

#[tokio::test]
async fn handler_may_call_back_into_engine() {
    let (io, sink) = attached();
    let issued = Arc::new(Mutex::new(Vec::new()));
    let (engine, seen) = (io.clone(), Arc::clone(&issued));
    let _sub = io
        .subscribe(
            "ccdiscovery",
            Value::Null,
            FnHandler(move |value: &Value| {
                let handle = engine.request("playfile", value.clone()).unwrap();
                seen.lock().push(handle.index());
            }),
        )
        .unwrap();
    let _pending = io.request("echo", Value::Null).unwrap();

    io.handle_message(&ack(0, 0));
    io.handle_message(&update(0, json!({"uuid": "cc-1"})));

    assert_eq!(*issued.lock(), vec![CorrelationId::new(2)]);
    let last = sink.frames().pop().unwrap();
    assert_eq!(last["method"], "playfile");
}

// ── inbound frame hygiene ───────────────────────────────────────────

#[test]
fn unknown_frame_kind_is_logged() {
    let (logs, _guard) = capture_logs();
    let (io, _sink) = attached();
    assert!(logs.has_message("transport attached"));
    logs.clear();

    io.handle_message(r#"{"kind":"ping","index":0}"#);
    io.handle_message("garbage");

    assert_eq!(logs.count_at_level(Level::WARN), 2);
    assert!(logs.has_event(Level::WARN, "dropping inbound frame"));
    let warnings = logs.events_for_target("opsa_client::server_io");
    assert_eq!(warnings.len(), 2);
    assert_eq!(warnings[0].field("kind"), Some("unknown_frame_kind"));
    assert_eq!(warnings[1].field("kind"), Some("protocol"));
    assert!(io.is_attached());
}

#[tokio::test]
async fn frames_while_detached_are_dropped() {
    let (io, _sink) = attached();
    let handle = io.request("echo", json!(1)).unwrap();
    io.detach();
    io.handle_message(&response(0, json!(1)));
    assert!(handle.try_response().is_none());
    assert!(!io.is_attached());
}

#[test]
fn detach_when_detached_is_noop() {
    let io = ServerIo::new();
    io.detach();
    assert!(!io.is_attached());
}

// ── properties ──────────────────────────────────────────────────────

mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Step {
        Request,
        Attach,
        Detach,
        Respond(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Request),
            Just(Step::Attach),
            Just(Step::Detach),
            (0_usize..16).prop_map(Step::Respond),
        ]
    }

    proptest! {
        #[test]
        fn requests_survive_any_attach_detach_sequence(steps in proptest::collection::vec(step(), 1..40)) {
            let io = ServerIo::new();
            let mut handles = Vec::new();
            let mut sinks: Vec<Arc<RecordingSink>> = Vec::new();
            let mut current: Option<Arc<RecordingSink>> = None;

            for step in steps {
                match step {
                    Step::Request => handles.push(io.request("echo", json!(handles.len())).unwrap()),
                    Step::Attach => {
                        let sink = RecordingSink::new();
                        io.attach(sink.clone());
                        sinks.push(Arc::clone(&sink));
                        current = Some(sink);
                    }
                    Step::Detach => {
                        io.detach();
                        current = None;
                    }
                    Step::Respond(n) => {
                        if let Some(sink) = &current {
                            if let Some(frame) = sink.frames().get(n) {
                                let index = frame["index"].as_u64().unwrap();
                                io.handle_message(&response(index, frame["data"].clone()));
                            }
                        }
                    }
                }
            }

            // each transport carries each index at most once
            for sink in &sinks {
                let mut seen: Vec<u64> = sink.frames().iter().map(|f| f["index"].as_u64().unwrap()).collect();
                let total = seen.len();
                seen.sort_unstable();
                seen.dedup();
                prop_assert_eq!(seen.len(), total);
            }

            // a final attach answers everything still outstanding
            let last = RecordingSink::new();
            io.attach(last.clone());
            for frame in last.frames() {
                let index = frame["index"].as_u64().unwrap();
                io.handle_message(&response(index, frame["data"].clone()));
            }
            for (n, handle) in handles.iter().enumerate() {
                prop_assert_eq!(handle.try_response(), Some(Ok(json!(n))));
            }
            prop_assert!(io.pending_requests().is_empty());
        }
    }
}
