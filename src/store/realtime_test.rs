use super::*;

const TOPIC: &str = "realtime:public:messages:recipient_id=eq.u1";

// =============================================================================
// URLs and topics
// =============================================================================

#[test]
fn websocket_url_upgrades_https_to_wss() {
    let url = websocket_url("https://clinic.supabase.co", "anon");
    assert_eq!(url, "wss://clinic.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0");
}

#[test]
fn websocket_url_upgrades_http_to_ws() {
    assert!(websocket_url("http://localhost:54321", "k").starts_with("ws://localhost:54321/realtime/v1/websocket"));
}

#[test]
fn topic_includes_filter() {
    assert_eq!(topic_for("messages", Some(&Filter::eq("recipient_id", "u1"))), TOPIC);
    assert_eq!(topic_for("messages", None), "realtime:public:messages");
}

#[test]
fn realtime_filter_formats() {
    assert_eq!(realtime_filter(&Filter::eq("recipient_id", "u1")).as_deref(), Some("recipient_id=eq.u1"));
    assert_eq!(realtime_filter(&Filter::one_of("baby_id", ["b1", "b2"])).as_deref(), Some("baby_id=in.(b1,b2)"));
    assert!(realtime_filter(&Filter::eq("deleted_at", Value::Null)).is_none());
}

// =============================================================================
// Outbound frames
// =============================================================================

#[test]
fn join_frame_carries_postgres_changes_config() {
    let frame = join_frame(TOPIC, "messages", Some(&Filter::eq("recipient_id", "u1")), "jwt", 1);
    assert_eq!(frame["event"], "phx_join");
    assert_eq!(frame["topic"], TOPIC);
    assert_eq!(frame["ref"], "1");
    assert_eq!(frame["payload"]["access_token"], "jwt");
    let change = &frame["payload"]["config"]["postgres_changes"][0];
    assert_eq!(change["event"], "*");
    assert_eq!(change["schema"], "public");
    assert_eq!(change["table"], "messages");
    assert_eq!(change["filter"], "recipient_id=eq.u1");
}

#[test]
fn join_frame_without_filter_omits_key() {
    let frame = join_frame("realtime:public:messages", "messages", None, "jwt", 1);
    assert!(frame["payload"]["config"]["postgres_changes"][0].get("filter").is_none());
}

#[test]
fn heartbeat_targets_phoenix_topic() {
    let frame = heartbeat_frame(7);
    assert_eq!(frame["topic"], "phoenix");
    assert_eq!(frame["event"], "heartbeat");
    assert_eq!(frame["ref"], "7");
}

#[test]
fn access_token_frame_shape() {
    let frame = access_token_frame(TOPIC, "new-jwt", 3);
    assert_eq!(frame["event"], "access_token");
    assert_eq!(frame["payload"]["access_token"], "new-jwt");
}

// =============================================================================
// parse_inbound
// =============================================================================

#[test]
fn parses_insert_change() {
    let text = json!({
        "topic": TOPIC,
        "event": "postgres_changes",
        "payload": {
            "ids": [1],
            "data": {
                "schema": "public",
                "table": "messages",
                "commit_timestamp": "2024-01-05T10:00:00Z",
                "type": "INSERT",
                "record": { "id": "m1", "recipient_id": "u1" },
                "old_record": {},
                "errors": null
            }
        },
        "ref": null
    })
    .to_string();

    let Inbound::Change(event) = parse_inbound(&text, TOPIC).unwrap() else {
        panic!("expected change");
    };
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.table, "messages");
    assert_eq!(event.record.unwrap()["id"], "m1");
    assert!(event.old_record.is_none());
}

#[test]
fn parses_delete_change_with_old_record() {
    let text = json!({
        "topic": TOPIC,
        "event": "postgres_changes",
        "payload": { "data": { "table": "messages", "type": "DELETE", "old_record": { "id": "m1" } } }
    })
    .to_string();
    let Inbound::Change(event) = parse_inbound(&text, TOPIC).unwrap() else {
        panic!("expected change");
    };
    assert_eq!(event.kind, ChangeKind::Delete);
    assert_eq!(event.row().unwrap()["id"], "m1");
}

#[test]
fn unknown_change_type_is_decode_error() {
    let text = json!({
        "topic": TOPIC,
        "event": "postgres_changes",
        "payload": { "data": { "table": "messages", "type": "TRUNCATE" } }
    })
    .to_string();
    assert!(matches!(parse_inbound(&text, TOPIC), Err(StoreError::Decode(_))));
}

#[test]
fn ok_reply_means_joined() {
    let text = json!({ "topic": TOPIC, "event": "phx_reply", "payload": { "status": "ok", "response": {} }, "ref": "1" })
        .to_string();
    assert_eq!(parse_inbound(&text, TOPIC).unwrap(), Inbound::Joined);
}

#[test]
fn error_reply_carries_reason() {
    let text = json!({
        "topic": TOPIC,
        "event": "phx_reply",
        "payload": { "status": "error", "response": { "reason": "Invalid JWT" } },
        "ref": "1"
    })
    .to_string();
    assert_eq!(parse_inbound(&text, TOPIC).unwrap(), Inbound::Rejected("Invalid JWT".into()));
}

#[test]
fn system_error_is_rejection() {
    let text = json!({
        "topic": TOPIC,
        "event": "system",
        "payload": { "status": "error", "message": "filter invalid" }
    })
    .to_string();
    assert_eq!(parse_inbound(&text, TOPIC).unwrap(), Inbound::Rejected("filter invalid".into()));
}

#[test]
fn system_ok_is_ignored() {
    let text = json!({
        "topic": TOPIC,
        "event": "system",
        "payload": { "status": "ok", "message": "Subscribed to PostgreSQL" }
    })
    .to_string();
    assert_eq!(parse_inbound(&text, TOPIC).unwrap(), Inbound::Ignored);
}

#[test]
fn close_events_end_connection() {
    let text = json!({ "topic": TOPIC, "event": "phx_close", "payload": {} }).to_string();
    assert_eq!(parse_inbound(&text, TOPIC).unwrap(), Inbound::Closed("phx_close".into()));
}

#[test]
fn heartbeat_replies_for_other_topics_are_ignored() {
    let text = json!({ "topic": "phoenix", "event": "phx_reply", "payload": { "status": "ok" }, "ref": "2" })
        .to_string();
    assert_eq!(parse_inbound(&text, TOPIC).unwrap(), Inbound::Ignored);
}

#[test]
fn garbage_is_decode_error() {
    assert!(matches!(parse_inbound("not json", TOPIC), Err(StoreError::Decode(_))));
}
