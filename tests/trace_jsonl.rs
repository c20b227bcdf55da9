use deckprio::{BatchTrace, JsonlTraceSink, TraceSink};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct TraceRow {
    batch_index: usize,
    item_ids: Vec<i64>,
    returned: Option<usize>,
    applied: usize,
    error: Option<String>,
}

fn make_trace(batch_index: usize, failed: bool) -> BatchTrace {
    BatchTrace {
        timestamp_ms: 0,
        run_id: "run-1".to_string(),
        group: "Bio::Cells".to_string(),
        batch_index,
        item_ids: vec![10 * batch_index as i64, 10 * batch_index as i64 + 1],
        prompt_template_slug: "prio_rubric_v1".to_string(),
        system_prompt_hash: "hash".to_string(),
        provider: "openai".to_string(),
        model: "gpt-4o-mini".to_string(),
        returned: (!failed).then_some(2),
        applied: if failed { 0 } else { 2 },
        error: failed.then(|| "openai error: HTTP 500".to_string()),
    }
}

#[test]
fn jsonl_trace_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    sink.record(make_trace(0, false)).unwrap();
    sink.record(make_trace(1, true)).unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<TraceRow> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].batch_index, 0);
    assert_eq!(rows[0].returned, Some(2));
    assert_eq!(rows[0].applied, 2);
    assert!(rows[0].error.is_none());
    assert_eq!(rows[1].item_ids, vec![10, 11]);
    assert_eq!(rows[1].returned, None);
    assert_eq!(rows[1].error.as_deref(), Some("openai error: HTTP 500"));
}

#[test]
fn cloned_sinks_share_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let (sink, worker) = JsonlTraceSink::new(&path).unwrap();
    let other = sink.clone();
    let handle = std::thread::spawn(move || {
        other.record(make_trace(5, false)).unwrap();
    });
    sink.record(make_trace(6, false)).unwrap();
    handle.join().unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let mut indices: Vec<usize> = raw
        .lines()
        .map(|l| serde_json::from_str::<TraceRow>(l).unwrap().batch_index)
        .collect();
    indices.sort();
    assert_eq!(indices, vec![5, 6]);
}
