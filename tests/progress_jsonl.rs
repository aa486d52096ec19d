use std::sync::Arc;

use feature_bank::progress::{
    FanoutProgress, ItemOutcome, ItemProgressEvent, JsonlProgressSink, OutcomeTally,
    ProgressObserver,
};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressRow {
    feature_id: String,
    index: usize,
    done: usize,
    outcome: String,
}

fn make_event(index: usize, done: usize, outcome: ItemOutcome) -> ItemProgressEvent {
    ItemProgressEvent {
        feature_id: "translategemma-1".to_string(),
        plugin_name: "translategemma".to_string(),
        total: 3,
        index,
        done,
        outcome,
    }
}

#[test]
fn jsonl_progress_sink_writes_events_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("progress.jsonl");

    let (sink, worker) = JsonlProgressSink::new(&path).unwrap();
    sink.on_item(&make_event(2, 1, ItemOutcome::Replayed));
    sink.on_item(&make_event(0, 2, ItemOutcome::Error));

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<ProgressRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].feature_id, "translategemma-1");
    assert_eq!((rows[0].index, rows[0].done), (2, 1));
    assert_eq!(rows[0].outcome, "REPLAYED");
    assert_eq!(rows[1].outcome, "ERROR");
}

#[test]
fn fanout_feeds_tally_and_sink_alike() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("progress.jsonl");
    let (sink, worker) = JsonlProgressSink::new(&path).unwrap();
    let tally = Arc::new(OutcomeTally::new());

    let fanout = FanoutProgress::new()
        .with(tally.clone())
        .with(Arc::new(sink));
    fanout.on_item(&make_event(0, 1, ItemOutcome::Passed));
    fanout.on_item(&make_event(1, 2, ItemOutcome::Skipped));
    fanout.on_item(&make_event(2, 3, ItemOutcome::Passed));
    drop(fanout);
    worker.join().unwrap();

    let snapshot = tally.snapshot();
    let feature = &snapshot["translategemma-1"];
    assert_eq!(feature.plugin_name, "translategemma");
    assert_eq!(feature.total, 3);
    assert_eq!(feature.counts["PASSED"], 2);
    assert_eq!(feature.counts["SKIPPED"], 1);
    assert_eq!(feature.worst, Some(ItemOutcome::Skipped));

    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 3);
}
