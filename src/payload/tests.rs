use super::*;
use serde_json::json;

fn data(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        _ => DataMap::new(),
    }
}

#[test]
fn test_missing_subject_type_fails() {
    let result = Payload::routed("", "update", DataMap::new());
    assert!(matches!(
        result,
        Err(PayloadError::MissingRoutingInfo {
            field: "subjectType"
        })
    ));
}

#[test]
fn test_missing_action_fails() {
    let result = Payload::routed("User", "  ", DataMap::new());
    assert!(matches!(
        result,
        Err(PayloadError::MissingRoutingInfo { field: "action" })
    ));
}

#[test]
fn test_default_headers() {
    let payload = Payload::routed("User", "update", data(json!({"id": 1}))).unwrap();

    assert_eq!(payload.idempotency_key(), "User/update");
    assert_eq!(payload.ordering_key(), "User");
    assert!(payload.uuid().is_some());
    assert!(payload.app_key().is_none());
    assert!(payload.topic_names().is_empty());
    assert!(payload.cache_enabled());
}

#[test]
fn test_caller_headers_are_not_overwritten() {
    let headers = Headers::default()
        .with_idempotency_key("user-1")
        .with_ordering_key("accounts");
    let payload = Payload::new(DataMap::new(), Routing::new("User", "update"), headers).unwrap();

    assert_eq!(payload.idempotency_key(), "user-1");
    assert_eq!(payload.ordering_key(), "accounts");
}

#[test]
fn test_defaults_are_idempotent() {
    let routing = Routing::new("User", "create");
    let mut headers = Headers::default();
    headers.apply_defaults(&routing);
    let first = headers.clone();
    headers.apply_defaults(&routing);

    assert_eq!(first, headers);
}

#[test]
fn test_destinations_fall_back_to_default_topic() {
    let single = Payload::routed("User", "update", DataMap::new()).unwrap();
    assert_eq!(single.destinations("sync"), vec!["sync"]);

    let fanned = Payload::new(
        DataMap::new(),
        Routing::new("User", "update"),
        Headers::default().with_topics(["a", "b"]),
    )
    .unwrap();
    assert_eq!(fanned.destinations("sync"), vec!["a", "b"]);
}

#[test]
fn test_wire_round_trip_preserves_envelope() {
    let headers = Headers::default()
        .with_app_key("billing")
        .with_topic("users")
        .with_required_fields(["id"]);
    let payload = Payload::new(
        data(json!({"id": 7, "title": "x"})),
        Routing::new("User", "update"),
        headers,
    )
    .unwrap();

    let decoded = Payload::from_json(&payload.to_json().unwrap()).unwrap();
    assert_eq!(decoded, payload);
}

#[test]
fn test_wire_shape_uses_camel_case() {
    let payload = Payload::routed("User", "update", DataMap::new()).unwrap();
    let value: Value = serde_json::from_slice(&payload.to_json().unwrap()).unwrap();

    assert_eq!(value["routing"]["subjectType"], "User");
    assert_eq!(value["headers"]["idempotencyKey"], "User/update");
    assert_eq!(value["headers"]["orderingKey"], "User");
}

#[test]
fn test_decode_revalidates_routing() {
    let bytes = br#"{"data": {"id": 1}, "routing": {"subjectType": "User"}, "headers": {}}"#;
    let result = Payload::from_json(bytes);
    assert!(matches!(
        result,
        Err(PayloadError::MissingRoutingInfo { field: "action" })
    ));
}

#[test]
fn test_decode_keeps_unknown_headers() {
    let bytes = br#"{"data": {}, "routing": {"subjectType": "User", "action": "create"},
        "headers": {"tenant": "acme"}}"#;
    let payload = Payload::from_json(bytes).unwrap();
    assert_eq!(payload.headers().extra.get("tenant"), Some(&json!("acme")));
}

#[test]
fn test_decode_rejects_garbage() {
    assert!(matches!(
        Payload::from_json(b"not json"),
        Err(PayloadError::Decode(_))
    ));
}

#[test]
fn test_stamp_keeps_existing_app_key() {
    let payload = Payload::new(
        DataMap::new(),
        Routing::new("User", "update"),
        Headers::default().with_app_key("origin"),
    )
    .unwrap();

    assert_eq!(payload.stamped_with("other").app_key(), Some("origin"));
}
