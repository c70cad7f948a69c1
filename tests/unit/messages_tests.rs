//! Unit tests for wire types and outbound payload builders.

use serde_json::json;

use agent_tether::protocol::messages::{control_request, user_turn, ContentBlock, Event};

#[test]
fn init_event_carries_session_metadata() {
    let event = Event::from_value(json!({
        "type": "system",
        "subtype": "init",
        "session_id": "abc",
        "model": "sonnet",
        "tools": ["Read", "Bash"],
        "cwd": "/work",
        "permissionMode": "default",
    }));

    let Event::Init(init) = event else {
        panic!("expected Init");
    };
    assert_eq!(init.session_id, "abc");
    assert_eq!(init.tools, vec!["Read", "Bash"]);
    assert_eq!(init.cwd.as_deref(), Some("/work"));
    assert_eq!(init.permission_mode.as_deref(), Some("default"));
}

#[test]
fn other_system_subtypes_keep_their_fields() {
    let event = Event::from_value(json!({
        "type": "system",
        "subtype": "compact_boundary",
        "trigger": "auto",
    }));

    let Event::System(system) = event else {
        panic!("expected System");
    };
    assert_eq!(system.subtype, "compact_boundary");
    assert_eq!(system.fields.get("trigger"), Some(&json!("auto")));
}

#[test]
fn assistant_content_blocks_are_typed() {
    let event = Event::from_value(json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Hello, "},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"path": "a"}},
                {"type": "text", "text": "world"},
                {"type": "server_tool_use", "id": "s1"},
            ],
        },
    }));

    let Event::Assistant(msg) = event else {
        panic!("expected Assistant");
    };
    assert_eq!(msg.message.text(), "Hello, world");
    assert!(matches!(msg.message.content[2], ContentBlock::ToolUse { ref name, .. } if name == "Read"));
    assert_eq!(msg.message.content[4], ContentBlock::Unknown);
}

#[test]
fn string_content_becomes_one_text_block() {
    let event = Event::from_value(json!({
        "type": "user",
        "message": {"role": "user", "content": "plain"},
    }));

    let Event::User(msg) = event else {
        panic!("expected User");
    };
    assert_eq!(
        msg.message.content,
        vec![ContentBlock::Text { text: "plain".into() }]
    );
}

#[test]
fn result_is_terminal_and_reports_success() {
    let event = Event::from_value(json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "result": "ok",
        "usage": {"input_tokens": 10, "output_tokens": 2},
        "total_cost_usd": 0.01,
    }));

    assert!(event.is_terminal());
    let Event::Result(result) = event else {
        panic!("expected Result");
    };
    assert!(result.is_success());
    assert_eq!(result.usage.input_tokens, 10);
}

#[test]
fn error_result_is_not_success() {
    let event = Event::from_value(json!({
        "type": "result",
        "subtype": "error_max_turns",
        "is_error": true,
    }));

    let Event::Result(result) = event else {
        panic!("expected Result");
    };
    assert!(!result.is_success());
}

#[test]
fn result_tolerates_null_usage_and_missing_subtype() {
    let null_usage = Event::from_value(json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "usage": null,
    }));
    let Event::Result(result) = null_usage else {
        panic!("expected Result");
    };
    assert!(result.is_success());
    assert_eq!(result.usage.input_tokens, 0);

    let bare = Event::from_value(json!({"type": "result", "is_error": false}));
    assert!(bare.is_terminal());
    let Event::Result(result) = bare else {
        panic!("expected Result");
    };
    assert_eq!(result.subtype, "");
    assert!(!result.is_success());
}

#[test]
fn result_with_mistyped_fields_is_still_terminal() {
    let event = Event::from_value(json!({
        "type": "result",
        "subtype": "error_during_execution",
        "is_error": true,
        "result": "boom",
        "num_turns": "many",
    }));

    let Event::Result(result) = event else {
        panic!("expected Result");
    };
    assert_eq!(result.subtype, "error_during_execution");
    assert!(result.is_error);
    assert_eq!(result.result.as_deref(), Some("boom"));
    assert_eq!(result.num_turns, None);
}

#[test]
fn init_without_session_id_is_still_init() {
    let event = Event::from_value(json!({"type": "system", "subtype": "init", "model": "m"}));

    let Event::Init(init) = event else {
        panic!("expected Init");
    };
    assert_eq!(init.session_id, "");
    assert_eq!(init.model, "m");
}

#[test]
fn known_type_with_unexpected_body_is_forwarded_as_other() {
    let raw = json!({"type": "assistant", "message": "not an object"});

    let event = Event::from_value(raw.clone());

    assert_eq!(event, Event::Other(raw));
    assert!(!event.is_terminal());
}

#[test]
fn only_result_is_terminal() {
    let assistant = Event::from_value(json!({
        "type": "assistant",
        "message": {"role": "assistant", "content": []},
    }));
    let other = Event::from_value(json!({"type": "keep_alive"}));

    assert!(!assistant.is_terminal());
    assert!(!other.is_terminal());
    assert_eq!(other.kind(), "other");
}

#[test]
fn events_serialize_with_a_kind_tag() {
    let event = Event::from_value(json!({"type": "keep_alive"}));
    let value = serde_json::to_value(&event).expect("serializes");
    assert_eq!(value["event"], "other");
    assert_eq!(value["data"]["type"], "keep_alive");
}

// ── Outbound ─────────────────────────────────────────────────────────────────

#[test]
fn user_turn_shape() {
    let turn = user_turn("ping", "abc");

    assert_eq!(turn["type"], "user");
    assert_eq!(turn["message"]["role"], "user");
    assert_eq!(turn["message"]["content"][0], json!({"type": "text", "text": "ping"}));
    assert_eq!(turn["session_id"], "abc");
    assert!(turn["parent_tool_use_id"].is_null());
}

#[test]
fn control_request_shape() {
    let request = control_request("req_1_abcdef01", "interrupt");

    assert_eq!(
        request,
        json!({
            "type": "control_request",
            "request_id": "req_1_abcdef01",
            "request": {"subtype": "interrupt"},
        })
    );
}
