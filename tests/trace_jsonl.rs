use qualcode_harness::codebook::Category;
use qualcode_harness::extract::ExtractionOutcome;
use qualcode_harness::trace::CodingTrace;
use qualcode_harness::{JsonlTraceSink, TraceSink};
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    item_index: usize,
    run_kind: String,
    category: String,
    outcome: Option<String>,
    cached: bool,
}

fn make_trace(item_index: usize) -> CodingTrace {
    CodingTrace {
        timestamp_ms: 0,
        run_id: Uuid::nil(),
        run_kind: "reliability",
        item_index,
        item_hash: "item_hash".to_string(),
        protocol_version: 1,
        protocol_hash: "protocol_hash".to_string(),
        template_slug: "coding_v1".to_string(),
        model: "google/gemini-2.0-flash-001".to_string(),
        cache_key_hash: Some("key_hash".to_string()),
        raw_response: Some("1.4".to_string()),
        category: "1.4".parse::<Category>().unwrap(),
        found: Some("1.4".parse::<Category>().unwrap()),
        outcome: Some(ExtractionOutcome::Matched),
        cached: true,
        input_tokens: 0,
        output_tokens: 0,
        cost_nanodollars: 0,
        error: None,
    }
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(1)).unwrap();
    sink.record(make_trace(2)).unwrap();

    drop(sink);
    assert_eq!(worker.join().unwrap(), 2);

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: TraceRow = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.item_index, 1);
    assert_eq!(first.run_kind, "reliability");
    assert_eq!(first.category, "1.4");
    assert_eq!(first.outcome.as_deref(), Some("matched"));
    assert!(first.cached);
}
