use super::harness::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn trigger(action_name: &str) -> Value {
    json!({
        "channel": "trigger:action",
        "payload": {"action_name": action_name, "process_id": 0}
    })
}

async fn connected_with(register: impl FnOnce(&Fixture)) -> (Fixture, CollectorSide) {
    let mut fixture = Fixture::new(Some(ENDPOINT_A));
    register(&fixture);
    let collector = fixture.connected().await;
    (fixture, collector)
}

#[tokio::test]
async fn test_trigger_replies_ack_then_result() {
    let (_fixture, mut collector) = connected_with(|fixture| {
        fixture
            .actions
            .register_fn("Test", || "I am the test answer".to_string())
    })
    .await;

    collector.push(trigger("Test"));

    let ack = collector.next_envelope().await;
    assert_eq!(ack["channel"], "trigger:action:success");
    assert_eq!(
        ack["payload"]["data"],
        json!({"success": true, "id": 0, "action_name": "Test"})
    );

    let reply = collector.next_envelope().await;
    assert_eq!(reply["channel"], "axm:reply");
    assert_eq!(
        reply["payload"]["data"],
        json!({"action_name": "Test", "return": "I am the test answer"})
    );
    assert_eq!(reply["payload"]["process"]["name"], "test-app");
    assert_eq!(reply["payload"]["server_name"], "web-01");
}

#[tokio::test]
async fn test_unregistered_action_replies_null() {
    let (_fixture, mut collector) = connected_with(|_| {}).await;

    collector.push(trigger("Nope"));

    let ack = collector.next_envelope().await;
    assert_eq!(ack["channel"], "trigger:action:success");
    assert_eq!(ack["payload"]["data"]["action_name"], "Nope");

    let reply = collector.next_envelope().await;
    assert_eq!(reply["channel"], "axm:reply");
    assert_eq!(
        reply["payload"]["data"],
        json!({"action_name": "Nope", "return": null})
    );
}

#[tokio::test]
async fn test_noop_action_replies_null() {
    let (_fixture, mut collector) =
        connected_with(|fixture| fixture.actions.register_noop("Tric")).await;

    collector.push(trigger("Tric"));

    collector.next_envelope().await;
    let reply = collector.next_envelope().await;
    assert_eq!(reply["payload"]["data"]["return"], Value::Null);
}

#[tokio::test]
async fn test_panicking_action_reports_failure() {
    let (fixture, mut collector) = connected_with(|fixture| {
        fixture.actions.register_fn("boom", || panic!("kaboom"));
        fixture.actions.register_fn("Test", || "still here".to_string());
    })
    .await;

    collector.push(trigger("boom"));

    let failure = collector.next_envelope().await;
    assert_eq!(failure["channel"], "trigger:action:failure");
    let data = &failure["payload"]["data"];
    assert_eq!(data["success"], false);
    assert_eq!(data["action_name"], "boom");
    assert!(data["err"].as_str().is_some_and(|err| err.contains("kaboom")));

    // The dispatcher keeps serving the same connection
    collector.push(trigger("Test"));
    assert_eq!(
        collector.next_envelope().await["channel"],
        "trigger:action:success"
    );
    assert_eq!(
        collector.next_envelope().await["payload"]["data"]["return"],
        "still here"
    );
    assert_eq!(fixture.transporter.stats().reconnects, 0);
}

#[tokio::test]
async fn test_start_logging_gets_raw_result() {
    let (_fixture, mut collector) = connected_with(|_| {}).await;

    collector.push(json!({
        "channel": "trigger:pm2:action",
        "payload": {"method_name": "startLogging"}
    }));

    let result: Value = serde_json::from_str(&collector.next_text().await).unwrap();
    assert_eq!(
        result,
        json!({"channel": "trigger:pm2:result", "payload": {"ret": {"err": null}}})
    );
}

#[tokio::test]
async fn test_ignored_frames_keep_dispatcher_running() {
    let (fixture, mut collector) =
        connected_with(|fixture| fixture.actions.register_fn("Test", || "ok".to_string())).await;

    collector.push_raw("not json at all");
    collector.push(json!({"channel": "trigger:action", "payload": {"process_id": 3}}));
    collector.push(json!({"channel": "some:future:channel", "payload": {}}));
    collector.push(json!({
        "channel": "trigger:pm2:action",
        "payload": {"method_name": "restart"}
    }));
    collector.push(trigger("Test"));

    // Nothing was answered before the valid trigger
    let ack = collector.next_envelope().await;
    assert_eq!(ack["channel"], "trigger:action:success");
    assert_eq!(ack["payload"]["data"]["action_name"], "Test");
    assert_eq!(collector.next_envelope().await["channel"], "axm:reply");

    assert!(fixture.transporter.is_connected());
    assert!(fixture.transporter.is_handling());
    assert_eq!(fixture.transporter.stats().reconnects, 0);
}

#[tokio::test]
async fn test_triggers_are_answered_in_order() {
    let (_fixture, mut collector) = connected_with(|fixture| {
        fixture.actions.register_fn("first", || "1".to_string());
        fixture.actions.register_fn("second", || "2".to_string());
    })
    .await;

    collector.push(trigger("first"));
    collector.push(trigger("second"));

    let channels_and_names: Vec<(Value, Value)> = {
        let mut seen = Vec::new();
        for _ in 0..4 {
            let envelope = collector.next_envelope().await;
            seen.push((
                envelope["channel"].clone(),
                envelope["payload"]["data"]["action_name"].clone(),
            ));
        }
        seen
    };

    assert_eq!(
        channels_and_names,
        vec![
            (json!("trigger:action:success"), json!("first")),
            (json!("axm:reply"), json!("first")),
            (json!("trigger:action:success"), json!("second")),
            (json!("axm:reply"), json!("second")),
        ]
    );
    assert!(collector.queued_texts().is_empty());
}

#[tokio::test]
async fn test_hung_action_does_not_outlive_reconnect() {
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();
    let blocked = gate.clone();

    let (mut fixture, collector) = connected_with(move |fixture| {
        fixture.actions.register_fn("hang", move || {
            let _open = blocked.lock();
            "released".to_string()
        })
    })
    .await;

    collector.push(trigger("hang"));
    // the dispatcher is now waiting on the action
    sleep(Duration::from_millis(100)).await;

    fixture.transporter.close_and_reconnect("test").await;
    let _second = fixture.accept().await;
    fixture.wait_connected().await;

    eventually(|| fixture.transporter.active_loops().dispatcher == 1).await;
    assert!(fixture.transporter.is_handling());

    drop(held);
}
