// Verifies the wire shape a client actually reads off the stream: one
// canonical event object per line, snake_case tagged, no pretty-printing.

use notes_core::RunId;
use notes_protocol::CanonicalEvent;

#[test]
fn a_run_serializes_as_one_json_object_per_line() {
    let run_id = RunId::new();
    let events = vec![
        CanonicalEvent::Start { session_id: "sess-1".into(), run_id: run_id.clone(), seq: 1, ts: 0 },
        CanonicalEvent::Text { delta: "hi".into(), run_id: run_id.clone(), seq: 2, ts: 0 },
        CanonicalEvent::Done { session_id: "sess-1".into(), run_id, seq: 3, ts: 0 },
    ];

    let ndjson: String = events
        .iter()
        .map(|e| serde_json::to_string(e).unwrap())
        .collect::<Vec<_>>()
        .join("\n");

    let lines: Vec<&str> = ndjson.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in &lines {
        assert!(!line.contains('\n'));
        let parsed: CanonicalEvent = serde_json::from_str(line).unwrap();
        assert!(parsed.seq() > 0);
    }
    assert!(lines[0].starts_with(r#"{"type":"start""#));
    assert!(lines[2].starts_with(r#"{"type":"done""#));
}

#[test]
fn unknown_fields_in_an_incoming_line_are_ignored() {
    let json = r#"{"type":"text","delta":"hi","run_id":"r1","seq":1,"ts":0,"extra":"ignored"}"#;
    let event: CanonicalEvent = serde_json::from_str(json).unwrap();
    match event {
        CanonicalEvent::Text { delta, .. } => assert_eq!(delta, "hi"),
        _ => panic!("expected a text event"),
    }
}
