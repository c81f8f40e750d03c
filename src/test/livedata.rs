//! End-to-end protocol scenarios: a real server over the in-memory store
//! and transport, exercised through wire frames.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bson::{doc, Bson, Document};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    error::Error,
    live::LiveConnection,
    options::{CursorOptions, ServerOptions},
    protocol::{ClientMessage, ServerMessage},
    server::{PublicationStrategy, Server},
    session::PublishResult,
    test::{MemoryStore, TestConnection},
};

struct App {
    server: Server,
    live: LiveConnection,
    store: Arc<MemoryStore>,
}

fn app() -> App {
    let store = MemoryStore::new();
    let live = LiveConnection::new(store.clone());
    let server = Server::new(
        live.clone(),
        ServerOptions::builder().heartbeat_interval(None).build(),
    );
    App {
        server,
        live,
        store,
    }
}

fn fast() -> CursorOptions {
    CursorOptions::builder()
        .polling_throttle(Some(Duration::ZERO))
        .build()
}

/// Registers a publication returning one fixed-query cursor.
fn publish_query(app: &App, name: &str, collection: &'static str, selector: Document) {
    let live = app.live.clone();
    app.server
        .publish(Some(name), move |_sub| {
            let live = live.clone();
            let selector = selector.clone();
            Box::pin(async move {
                let cursor = live.find(collection, selector, fast())?;
                Ok(PublishResult::Cursor(Box::new(cursor)))
            })
        })
        .unwrap();
}

fn msg_json(message: &ServerMessage) -> serde_json::Value {
    serde_json::to_value(message).unwrap()
}

fn sub(id: &str, name: &str, params: Vec<Bson>) -> ClientMessage {
    ClientMessage::Sub {
        id: id.to_string(),
        name: name.to_string(),
        params: if params.is_empty() { None } else { Some(params) },
    }
}

fn method(id: &str, name: &str, params: Vec<Bson>) -> ClientMessage {
    ClientMessage::Method {
        id: id.to_string(),
        method: name.to_string(),
        params: Some(params),
        random_seed: None,
    }
}

// ---- connection & negotiation ------------------------------------------

#[tokio::test]
async fn negotiation_prefers_the_server_order() {
    let app = app();
    let mut client = TestConnection::connect_to(&app.server);
    client.send_raw(r#"{"msg":"connect","version":"1","support":["1","1a"]}"#);
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "failed", "version": "1a"})
    );
    assert!(client.server_closed());
}

#[tokio::test]
async fn matching_proposal_connects() {
    let app = app();
    let mut client = TestConnection::connect_to(&app.server);
    client.send_raw(r#"{"msg":"connect","version":"1a","support":["1a","1"]}"#);
    match client.recv().await.unwrap() {
        ServerMessage::Connected { session } => assert!(!session.is_empty()),
        other => panic!("expected connected, got {:?}", other),
    }
    assert_eq!(app.server.session_count(), 1);
}

#[tokio::test]
async fn frames_before_connect_are_rejected_without_disconnect() {
    let app = app();
    let mut client = TestConnection::connect_to(&app.server);
    client.send_raw(r#"{"msg":"ping"}"#);
    match client.recv().await.unwrap() {
        ServerMessage::Error { reason, .. } => assert_eq!(reason, "Must connect first"),
        other => panic!("expected error, got {:?}", other),
    }
    // The socket is still usable.
    client.send_raw(r#"{"msg":"connect","version":"1","support":["1"]}"#);
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Connected { .. }
    ));
}

#[tokio::test]
async fn malformed_frames_get_an_error_with_the_offender() {
    let app = app();
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send_raw("{{{");
    match client.recv().await.unwrap() {
        ServerMessage::Error {
            reason,
            offending_message,
        } => {
            assert_eq!(reason, "Malformed message");
            assert_eq!(offending_message.as_deref(), Some("{{{"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn ping_gets_pong_with_id() {
    let app = app();
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&ClientMessage::Ping {
        id: Some("p1".to_string()),
    });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "pong", "id": "p1"})
    );
}

// ---- subscriptions ------------------------------------------------------

#[tokio::test]
async fn basic_sub_delivers_snapshot_then_ready() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples", "qty": 3 });
    app.store
        .insert("fruit", doc! { "_id": "b", "category": "pears", "qty": 4 });
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));

    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({
            "msg": "added",
            "collection": "fruit",
            "id": "a",
            "fields": {"category": "apples", "qty": 3}
        })
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s1"]})
    );
}

#[tokio::test]
async fn unknown_publication_is_a_404_nosub() {
    let app = app();
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "nope", vec![]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({
            "msg": "nosub",
            "id": "s1",
            "error": {
                "error": 404,
                "reason": "Subscription 'nope' not found",
                "message": "Subscription 'nope' not found [404]",
                "errorType": "Meteor.Error"
            }
        })
    );
}

#[tokio::test]
async fn unsub_is_idempotent_and_tolerates_unknown_ids() {
    let app = app();
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&ClientMessage::Unsub {
        id: "ghost".to_string(),
    });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "ghost"})
    );
    client.send(&ClientMessage::Unsub {
        id: "ghost".to_string(),
    });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "ghost"})
    );
}

#[tokio::test]
async fn duplicate_sub_ids_are_silently_ignored() {
    let app = app();
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s1"]})
    );
    client.send(&sub("s1", "apples", vec![]));
    // No second ready; the next exchange proves the session is healthy.
    client.send(&ClientMessage::Ping { id: None });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "pong"})
    );
}

#[tokio::test]
async fn live_inserts_reach_subscribers() {
    let app = app();
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));

    app.live
        .insert("fruit", doc! { "_id": "n1", "category": "apples" })
        .await
        .unwrap();
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "added", "collection": "fruit", "id": "n1", "fields": {"category": "apples"}})
    );

    app.live
        .remove("fruit", doc! { "_id": "n1" })
        .await
        .unwrap();
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "removed", "collection": "fruit", "id": "n1"})
    );
}

#[tokio::test]
async fn equivalent_subscriptions_share_one_driver() {
    let app = app();
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });

    let mut one = TestConnection::handshake(&app.server, "1").await;
    let mut two = TestConnection::handshake(&app.server, "1").await;
    one.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        one.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));
    two.send(&sub("s2", "apples", vec![]));
    assert!(matches!(
        two.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));

    assert_eq!(app.live.multiplexer_count(), 1);
    assert_eq!(app.store.find_count(), 1);

    // Stopping one subscriber leaves the shared driver running.
    one.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    assert!(matches!(
        one.recv().await.unwrap(),
        ServerMessage::Nosub { .. }
    ));
    assert_eq!(app.live.multiplexer_count(), 1);

    two.send(&ClientMessage::Unsub {
        id: "s2".to_string(),
    });
    assert!(matches!(
        two.recv().await.unwrap(),
        ServerMessage::Nosub { .. }
    ));
    assert_eq!(app.live.multiplexer_count(), 0);
}

// ---- methods & the write fence -----------------------------------------

#[tokio::test]
async fn method_ack_waits_for_observer_flush() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples", "qty": 3 });
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });

    let live = app.live.clone();
    app.server
        .methods("test-add", move |_ctx, params| {
            let live = live.clone();
            Box::pin(async move {
                let category = params[0].as_str().unwrap_or_default().to_string();
                let value = params[1].clone();
                live.insert(
                    "fruit",
                    doc! { "_id": "c", "category": category, "value": value },
                )
                .await?;
                Ok(Bson::Null)
            })
        })
        .unwrap();

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Added { .. }
    ));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));

    client.send(&method("m1", "test-add", vec!["apples".into(), 7.into()]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "result", "id": "m1"})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({
            "msg": "added",
            "collection": "fruit",
            "id": "c",
            "fields": {"category": "apples", "value": 7}
        })
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "updated", "methods": ["m1"]})
    );
}

#[tokio::test]
async fn unknown_method_is_a_404_result_plus_updated() {
    let app = app();
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&method("m1", "nope", vec![]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({
            "msg": "result",
            "id": "m1",
            "error": {
                "error": 404,
                "reason": "Method 'nope' not found",
                "message": "Method 'nope' not found [404]",
                "errorType": "Meteor.Error"
            }
        })
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "updated", "methods": ["m1"]})
    );
}

#[tokio::test]
async fn method_errors_are_sanitized_unless_client_safe() {
    let app = app();
    app.server
        .methods("boom-internal", |_ctx, _params| {
            Box::pin(async { Err(Error::internal("connection string leaked")) })
        })
        .unwrap();
    app.server
        .methods("boom-client", |_ctx, _params| {
            Box::pin(async { Err(Error::client_with_reason(403, "Not allowed")) })
        })
        .unwrap();

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&method("m1", "boom-internal", vec![]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({
            "msg": "result",
            "id": "m1",
            "error": {
                "error": 500,
                "reason": "Internal server error",
                "message": "Internal server error [500]",
                "errorType": "Meteor.Error"
            }
        })
    );
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Updated { .. }
    ));

    client.send(&method("m2", "boom-client", vec![]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({
            "msg": "result",
            "id": "m2",
            "error": {
                "error": 403,
                "reason": "Not allowed",
                "message": "Not allowed [403]",
                "errorType": "Meteor.Error"
            }
        })
    );
}

#[tokio::test]
async fn method_results_pass_through() {
    let app = app();
    app.server
        .methods("sum", |_ctx, params| {
            Box::pin(async move {
                let total: i64 = params
                    .iter()
                    .filter_map(|p| p.as_i64().or_else(|| p.as_i32().map(i64::from)))
                    .sum();
                Ok(Bson::Int64(total))
            })
        })
        .unwrap();
    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&method("m1", "sum", vec![2.into(), 3.into()]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "result", "id": "m1", "result": 5})
    );
}

// ---- merge box ----------------------------------------------------------

#[tokio::test]
async fn overlapping_subs_merge_with_precedence() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "x", "q": 5, "r": 6 });

    // Same document through two publications; the second projects q away.
    let live = app.live.clone();
    app.server
        .publish(Some("doc"), move |sub| {
            let live = live.clone();
            Box::pin(async move {
                let id = sub.params()[0].as_str().unwrap_or_default().to_string();
                let cursor = live.find("fruit", doc! { "_id": id }, fast())?;
                Ok(PublishResult::Cursor(Box::new(cursor)))
            })
        })
        .unwrap();
    let live = app.live.clone();
    app.server
        .publish(Some("doc-no-q"), move |sub| {
            let live = live.clone();
            Box::pin(async move {
                let id = sub.params()[0].as_str().unwrap_or_default().to_string();
                let options = CursorOptions::builder()
                    .polling_throttle(Some(Duration::ZERO))
                    .projection(Some(doc! { "q": 0 }))
                    .build();
                let cursor = live.find("fruit", doc! { "_id": id }, options)?;
                Ok(PublishResult::Cursor(Box::new(cursor)))
            })
        })
        .unwrap();

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "doc", vec!["x".into()]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "added", "collection": "fruit", "id": "x", "fields": {"q": 5, "r": 6}})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s1"]})
    );

    // The overlapping sub adds nothing new for the client.
    client.send(&sub("s2", "doc-no-q", vec!["x".into()]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s2"]})
    );

    // Dropping the first sub withdraws only its exclusive field.
    client.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "changed", "collection": "fruit", "id": "x", "cleared": ["q"]})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "s1"})
    );

    // Dropping the second removes the document entirely.
    client.send(&ClientMessage::Unsub {
        id: "s2".to_string(),
    });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "removed", "collection": "fruit", "id": "x"})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "s2"})
    );
}

// ---- publication strategies --------------------------------------------

#[tokio::test]
async fn no_merge_no_history_skips_stop_removals() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples" });
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });
    app.server
        .set_publication_strategy("apples", PublicationStrategy::NoMergeNoHistory);

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Added { .. }
    ));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));

    client.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    // Straight to nosub: no removed for the documents it had sent.
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "s1"})
    );
}

#[tokio::test]
async fn no_merge_still_removes_on_stop() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples" });
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });
    app.server
        .set_publication_strategy("apples", PublicationStrategy::NoMerge);

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Added { .. }
    ));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));

    client.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "removed", "collection": "fruit", "id": "a"})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "s1"})
    );
}

// ---- universal subscriptions -------------------------------------------

#[tokio::test]
async fn universal_subscriptions_run_on_connect_and_retroactively() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples" });
    let live = app.live.clone();
    app.server
        .publish(None, move |_sub| {
            let live = live.clone();
            Box::pin(async move {
                let cursor = live.find("fruit", doc! { "category": "apples" }, fast())?;
                Ok(PublishResult::Cursor(Box::new(cursor)))
            })
        })
        .unwrap();

    // Runs on a fresh session without any sub message.
    let mut client = TestConnection::handshake(&app.server, "1").await;
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "added", "collection": "fruit", "id": "a", "fields": {"category": "apples"}})
    );

    // A universal publication registered later reaches open sessions.
    app.store
        .insert("veggies", doc! { "_id": "v", "kind": "root" });
    let live = app.live.clone();
    app.server
        .publish(None, move |_sub| {
            let live = live.clone();
            Box::pin(async move {
                let cursor = live.find("veggies", doc! { "kind": "root" }, fast())?;
                Ok(PublishResult::Cursor(Box::new(cursor)))
            })
        })
        .unwrap();
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "added", "collection": "veggies", "id": "v", "fields": {"kind": "root"}})
    );
}

// ---- setUserId ----------------------------------------------------------

#[tokio::test]
async fn set_user_id_reruns_subscriptions_and_sends_the_diff() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "d1", "ownerId": "u1", "secret": 1 });
    app.store
        .insert("fruit", doc! { "_id": "d2", "ownerId": "u2", "secret": 2 });

    let live = app.live.clone();
    app.server
        .publish(Some("mine"), move |sub| {
            let live = live.clone();
            Box::pin(async move {
                let selector = match sub.user_id() {
                    Some(user_id) => doc! { "ownerId": user_id },
                    None => Document::new(),
                };
                let cursor = live.find("fruit", selector, fast())?;
                Ok(PublishResult::Cursor(Box::new(cursor)))
            })
        })
        .unwrap();
    app.server
        .methods("login", |mut ctx, params| {
            Box::pin(async move {
                let user = params[0].as_str().unwrap_or_default().to_string();
                ctx.set_user_id(Some(user)).await?;
                Ok(Bson::Null)
            })
        })
        .unwrap();

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "mine", vec![]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s1"]})
    );

    client.send(&method("m1", "login", vec!["u1".into()]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "added", "collection": "fruit", "id": "d1", "fields": {"ownerId": "u1", "secret": 1}})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s1"]})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "result", "id": "m1"})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "updated", "methods": ["m1"]})
    );

    // Switching users swaps the visible documents.
    client.send(&method("m2", "login", vec!["u2".into()]));
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "removed", "collection": "fruit", "id": "d1"})
    );
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "added", "collection": "fruit", "id": "d2", "fields": {"ownerId": "u2", "secret": 2}})
    );
}

// ---- 1a extensions ------------------------------------------------------

#[tokio::test]
async fn protocol_1a_batches_initial_adds_into_init() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples", "qty": 3 });
    app.store
        .insert("fruit", doc! { "_id": "c", "category": "apples", "qty": 5 });
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });

    let mut client = TestConnection::handshake(&app.server, "1a").await;
    client.send(&sub("s1", "apples", vec![]));
    match client.recv().await.unwrap() {
        ServerMessage::Init { collection, items } => {
            assert_eq!(collection, "fruit");
            let ids: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get_str("_id").ok())
                .collect();
            assert_eq!(ids.len(), 2);
            assert!(ids.contains(&"a") && ids.contains(&"c"));
        }
        other => panic!("expected init, got {:?}", other),
    }
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ready", "subs": ["s1"]})
    );
}

#[tokio::test]
async fn protocol_1a_skips_removals_on_unsub() {
    let app = app();
    app.store
        .insert("fruit", doc! { "_id": "a", "category": "apples" });
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });

    let mut client = TestConnection::handshake(&app.server, "1a").await;
    client.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Init { .. }
    ));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));

    client.send(&ClientMessage::Unsub {
        id: "s1".to_string(),
    });
    // 1a clients clean up for themselves on nosub.
    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "nosub", "id": "s1"})
    );
}

// ---- heartbeat ----------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn silent_sessions_are_pinged_then_closed() {
    let store = MemoryStore::new();
    let live = LiveConnection::new(store);
    let server = Server::new(
        live,
        ServerOptions::builder()
            .heartbeat_interval(Some(Duration::from_secs(15)))
            .heartbeat_timeout(Duration::from_secs(15))
            .build(),
    );

    let mut client = TestConnection::handshake(&server, "1").await;
    assert_eq!(server.session_count(), 1);

    assert_eq!(
        msg_json(&client.recv().await.unwrap()),
        json!({"msg": "ping"})
    );
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert!(client.server_closed());
    assert_eq!(server.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn pre1_sessions_have_no_heartbeat() {
    let store = MemoryStore::new();
    let live = LiveConnection::new(store);
    let server = Server::new(
        live,
        ServerOptions::builder()
            .heartbeat_interval(Some(Duration::from_secs(15)))
            .build(),
    );

    let client = TestConnection::handshake(&server, "pre1").await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!client.server_closed());
    assert_eq!(server.session_count(), 1);
}

// ---- connection lifecycle ----------------------------------------------

#[tokio::test]
async fn connection_hooks_see_the_derived_client_address() {
    let store = MemoryStore::new();
    let live = LiveConnection::new(store);
    let server = Server::new(
        live,
        ServerOptions::builder()
            .heartbeat_interval(None)
            .http_forwarded_count(Some(1))
            .build(),
    );

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    server.on_connection(move |handle| {
        let _ = seen_tx.send((
            handle.id().to_string(),
            handle.client_address().map(str::to_string),
        ));
    });

    let mut headers = HashMap::new();
    headers.insert(
        "x-forwarded-for".to_string(),
        "1.2.3.4, 5.6.7.8".to_string(),
    );
    let mut client = TestConnection::connect_with(&server, Some("10.0.0.1".to_string()), headers);
    client.send(&ClientMessage::Connect {
        version: "1".to_string(),
        support: vec!["1".to_string()],
    });
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Connected { .. }
    ));

    let (id, address) = seen_rx.recv().await.unwrap();
    assert!(!id.is_empty());
    assert_eq!(address.as_deref(), Some("5.6.7.8"));
}

#[tokio::test]
async fn socket_close_tears_the_session_down() {
    let app = app();
    publish_query(&app, "apples", "fruit", doc! { "category": "apples" });

    let mut client = TestConnection::handshake(&app.server, "1").await;
    client.send(&sub("s1", "apples", vec![]));
    assert!(matches!(
        client.recv().await.unwrap(),
        ServerMessage::Ready { .. }
    ));
    assert_eq!(app.live.multiplexer_count(), 1);

    client.disconnect();
    // Closing the socket deactivates subscriptions, which releases the
    // shared driver.
    for _ in 0..50 {
        tokio::task::yield_now().await;
        if app.live.multiplexer_count() == 0 {
            break;
        }
    }
    assert_eq!(app.server.session_count(), 0);
    assert_eq!(app.live.multiplexer_count(), 0);
}

#[tokio::test]
async fn server_close_closes_every_session() {
    let app = app();
    let one = TestConnection::handshake(&app.server, "1").await;
    let two = TestConnection::handshake(&app.server, "1").await;
    assert_eq!(app.server.session_count(), 2);

    app.server.close();
    assert_eq!(app.server.session_count(), 0);
    assert!(one.server_closed());
    assert!(two.server_closed());
}
