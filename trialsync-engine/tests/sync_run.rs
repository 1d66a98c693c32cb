mod common;

use serde_json::json;

use common::{date, FakeRegistry, Workspace};
use trialsync_engine::allocator;
use trialsync_engine::pipeline::{run, RunOptions};
use trialsync_engine::watermark;
use trialsync_engine::{Action, RecomputeStatus, SyncError};

fn options(y: i32, m: u32, d: u32) -> RunOptions {
    RunOptions {
        today: date(y, m, d),
        dry_run: false,
    }
}

#[test]
fn new_trial_is_inserted_numbered_archived_and_watermarked() {
    let ws = Workspace::new();
    ws.feed(&[("NCT001", "", "active", "2024-03-01")]);
    let doc = ws.trial("NCT001", json!({"nct_id": "NCT001", "title": "Alpha"}));
    ws.seed_allocator(41, None);
    let registry = FakeRegistry::new();

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    let creates = registry.creates();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0]["protocol_id"], 42);
    assert_eq!(creates[0]["protocol_no"], "2024060100");
    assert_eq!(creates[0]["title"], "Alpha");

    assert!(!doc.exists());
    assert!(ws.archived("NCT001").exists());

    let store = watermark::load_at(&ws.state_dir()).unwrap();
    assert_eq!(store.trials.get("NCT001"), Some(&date(2024, 3, 1)));

    assert_eq!(registry.recompute_count(), 1);
    assert_eq!(summary.recompute, RecomputeStatus::Triggered);

    let state = allocator::load_at(&ws.state_dir()).unwrap();
    assert_eq!(state.protocol_id_counter, 42);
    assert_eq!(state.protocol_no.as_deref(), Some("2024060100"));
}

#[test]
fn same_day_inserts_get_consecutive_numbers() {
    let ws = Workspace::new();
    ws.feed(&[
        ("NCT001", "", "active", "2024-03-01"),
        ("NCT002", "", "active", "2024-03-01"),
    ]);
    ws.trial("NCT001", json!({"nct_id": "NCT001"}));
    ws.trial("NCT002", json!({"nct_id": "NCT002"}));
    ws.seed_allocator(10, None);
    let registry = FakeRegistry::new();

    run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    let numbers: Vec<_> = registry
        .creates()
        .iter()
        .map(|d| d["protocol_no"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(numbers, ["2024060100", "2024060101"]);
    assert_eq!(registry.recompute_count(), 1, "one trigger per run");
}

#[test]
fn sequence_restarts_on_a_new_day() {
    let ws = Workspace::new();
    ws.feed(&[("NCT003", "", "active", "2024-03-01")]);
    ws.trial("NCT003", json!({"nct_id": "NCT003"}));
    ws.seed_allocator(50, Some("2024053107"));
    let registry = FakeRegistry::new();

    run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    assert_eq!(registry.creates()[0]["protocol_no"], "2024060100");
    assert_eq!(registry.creates()[0]["protocol_id"], 51);
}

#[test]
fn update_keeps_remote_identifiers_and_strips_server_fields() {
    let ws = Workspace::new();
    ws.feed(&[("NCT004", "", "active", "2024-03-05")]);
    ws.trial(
        "NCT004",
        json!({"nct_id": "NCT004", "title": "revised", "_etag": "local-copy", "_links": {}}),
    );
    let registry = FakeRegistry::new();
    let id = registry.seed(json!({
        "nct_id": "NCT004", "status": "open", "protocol_id": 9, "protocol_no": "2023010100"
    }));

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    let replaces = registry.replaces();
    assert_eq!(replaces.len(), 1);
    let (target, body) = &replaces[0];
    assert_eq!(target, &id);
    assert_eq!(body["title"], "revised");
    assert_eq!(body["protocol_id"], 9);
    assert_eq!(body["protocol_no"], "2023010100");
    assert!(!body.contains_key("_etag"));
    assert!(!body.contains_key("_links"));
    assert!(ws.archived("NCT004").exists());

    let report = summary.report.unwrap();
    assert_eq!(report.outcomes[0].action, Action::Update);
    assert!(report.outcomes[0].succeeded());
}

#[test]
fn close_sends_snapshot_with_closed_status() {
    let ws = Workspace::new();
    ws.feed(&[("NCT005", "", "closed", "2024-03-05")]);
    let registry = FakeRegistry::new();
    let id = registry.seed(json!({"nct_id": "NCT005", "status": "open", "title": "T"}));

    run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    let stored = registry.doc(&id).unwrap();
    assert_eq!(stored["status"], "closed");
    assert_eq!(stored["title"], "T");
    let store = watermark::load_at(&ws.state_dir()).unwrap();
    assert_eq!(store.trials.get("NCT005"), Some(&date(2024, 3, 5)));
}

#[test]
fn second_run_with_same_feed_does_nothing() {
    let ws = Workspace::new();
    ws.feed(&[("NCT006", "", "closed", "2024-03-05")]);
    let registry = FakeRegistry::new();
    registry.seed(json!({"nct_id": "NCT006", "status": "open"}));

    run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();
    let lookups = registry.find_count();
    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 2)).unwrap();

    assert_eq!(registry.find_count(), lookups);
    assert_eq!(summary.plan.unchanged, 1);
    assert_eq!(summary.recompute, RecomputeStatus::NotNeeded);
    assert_eq!(registry.recompute_count(), 1);
}

#[test]
fn all_failures_skip_recompute_but_persist_watermark() {
    let ws = Workspace::new();
    ws.feed(&[("NCT007", "", "active", "2024-03-01")]);
    let doc = ws.trial("NCT007", json!({"nct_id": "NCT007"}));
    ws.seed_allocator(1, None);
    let registry = FakeRegistry::new();
    registry.fail_writes.set(true);

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    assert_eq!(registry.recompute_count(), 0);
    assert_eq!(summary.recompute, RecomputeStatus::NotNeeded);
    assert_eq!(summary.report.unwrap().failed(), 1);
    assert!(doc.exists(), "failed trials stay in place");

    let store = watermark::load_at(&ws.state_dir()).unwrap();
    assert!(watermark::store_path_at(&ws.state_dir()).exists());
    assert!(!store.trials.contains_key("NCT007"));

    let state = allocator::load_at(&ws.state_dir()).unwrap();
    assert_eq!(state.protocol_id_counter, 1, "failed insert is not persisted");
}

#[test]
fn conflict_fails_only_that_trial() {
    let ws = Workspace::new();
    ws.feed(&[
        ("NCT008", "", "active", "2024-03-01"),
        ("NCT009", "", "active", "2024-03-01"),
    ]);
    ws.trial("NCT008", json!({"nct_id": "NCT008"}));
    ws.trial("NCT009", json!({"nct_id": "NCT009"}));
    ws.seed_allocator(0, None);
    let registry = FakeRegistry::new();
    registry.seed(json!({"nct_id": "NCT008", "status": "open"}));
    registry.stale_tokens.set(true);

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();
    let report = summary.report.unwrap();

    let update = report.outcomes.iter().find(|o| o.action == Action::Update).unwrap();
    assert!(update.result.as_ref().unwrap_err().contains("concurrency token rejected"), "got: {:?}", update.result);
    let insert = report.outcomes.iter().find(|o| o.action == Action::Insert).unwrap();
    assert!(insert.succeeded());

    let store = watermark::load_at(&ws.state_dir()).unwrap();
    assert!(!store.trials.contains_key("NCT008"));
    assert!(store.trials.contains_key("NCT009"));
    assert_eq!(summary.recompute, RecomputeStatus::Triggered);
}

#[test]
fn recompute_failure_does_not_fail_the_run() {
    let ws = Workspace::new();
    ws.feed(&[("NCT010", "", "closed", "2024-03-01")]);
    let registry = FakeRegistry::new();
    registry.seed(json!({"nct_id": "NCT010", "status": "open"}));
    registry.fail_recompute.set(true);

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    assert!(matches!(summary.recompute, RecomputeStatus::Failed(_)));
    let store = watermark::load_at(&ws.state_dir()).unwrap();
    assert!(store.trials.contains_key("NCT010"));
}

#[test]
fn missing_allocator_state_fails_inserts_only() {
    let ws = Workspace::new();
    ws.feed(&[("NCT011", "", "active", "2024-03-01")]);
    ws.trial("NCT011", json!({"nct_id": "NCT011"}));
    let registry = FakeRegistry::new();

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    assert!(registry.creates().is_empty());
    let report = summary.report.unwrap();
    assert!(report.outcomes[0].result.as_ref().unwrap_err().contains("protocol environment"));
}

#[test]
fn dry_run_plans_without_side_effects() {
    let ws = Workspace::new();
    ws.feed(&[("NCT012", "", "active", "2024-03-01")]);
    let doc = ws.trial("NCT012", json!({"nct_id": "NCT012"}));
    let registry = FakeRegistry::new();

    let summary = run(
        &ws.config,
        ws.home(),
        &registry,
        RunOptions {
            today: date(2024, 6, 1),
            dry_run: true,
        },
    )
    .unwrap();

    assert_eq!(summary.plan.to_insert.len(), 1);
    assert!(summary.report.is_none());
    assert!(registry.creates().is_empty());
    assert_eq!(registry.recompute_count(), 0);
    assert!(doc.exists());
    assert!(!watermark::store_path_at(&ws.state_dir()).exists());
}

#[test]
fn missing_trial_dir_fails_before_any_remote_call() {
    let ws = Workspace::new();
    ws.feed(&[("NCT013", "", "active", "2024-03-01")]);
    std::fs::remove_dir_all(&ws.config.trial_dir).unwrap();
    let registry = FakeRegistry::new();

    let err = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap_err();

    assert!(matches!(err, SyncError::Missing { what: "trial directory", .. }), "got: {err}");
    assert!(registry.calls.borrow().is_empty());
}

#[test]
fn missing_feed_fails_before_any_remote_call() {
    let ws = Workspace::new();
    let registry = FakeRegistry::new();

    let err = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap_err();

    assert!(matches!(err, SyncError::Missing { what: "status feed", .. }), "got: {err}");
    assert!(registry.calls.borrow().is_empty());
}

#[test]
fn traversal_key_never_reads_outside_trial_dir() {
    let ws = Workspace::new();
    ws.feed(&[("not applicable", "../secret", "active", "2024-03-01")]);
    let outside = ws.home().join("secret.json");
    std::fs::write(&outside, r#"{"confidential": true}"#).unwrap();
    ws.seed_allocator(1, None);
    let registry = FakeRegistry::new();

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    assert!(summary.plan.to_insert.is_empty());
    assert!(registry.creates().is_empty());
    assert!(outside.exists());
    assert!(!ws.config.archive_dir.join("secret.json").exists());
}

#[test]
fn failed_insert_burns_its_number() {
    let ws = Workspace::new();
    ws.feed(&[
        ("NCT001", "", "active", "2024-03-01"),
        ("NCT002", "", "active", "2024-03-01"),
    ]);
    let first = ws.trial("NCT001", json!({"nct_id": "NCT001"}));
    ws.trial("NCT002", json!({"nct_id": "NCT002"}));
    ws.seed_allocator(10, None);
    let registry = FakeRegistry::new();
    registry.fail_next_creates.set(1);

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    let creates = registry.creates();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[1]["nct_id"], "NCT002");
    assert_eq!(creates[1]["protocol_id"], 12);
    assert_eq!(creates[1]["protocol_no"], "2024060101");

    let report = summary.report.unwrap();
    assert_eq!(report.outcomes[0].key.as_str(), "NCT001");
    assert!(!report.outcomes[0].succeeded());
    assert!(report.outcomes[1].succeeded());
    assert!(first.exists(), "failed trials stay in place");

    let state = allocator::load_at(&ws.state_dir()).unwrap();
    assert_eq!(state.protocol_id_counter, 12);
    assert_eq!(state.protocol_no.as_deref(), Some("2024060101"));
}

#[test]
fn every_write_failing_leaves_watermarks_untouched() {
    let ws = Workspace::new();
    ws.feed(&[
        ("NCT020", "", "active", "2024-03-01"),
        ("NCT021", "", "active", "2024-03-02"),
        ("NCT022", "", "closed", "2024-03-03"),
    ]);
    ws.trial("NCT020", json!({"nct_id": "NCT020"}));
    ws.trial("NCT021", json!({"nct_id": "NCT021", "title": "revised"}));
    ws.seed_allocator(5, None);
    let registry = FakeRegistry::new();
    registry.seed(json!({"nct_id": "NCT021", "status": "open"}));
    registry.seed(json!({"nct_id": "NCT022", "status": "open"}));
    registry.fail_writes.set(true);

    let summary = run(&ws.config, ws.home(), &registry, options(2024, 6, 1)).unwrap();

    let report = summary.report.unwrap();
    let mut actions: Vec<_> = report.outcomes.iter().map(|o| o.action).collect();
    actions.sort_by_key(|a| a.to_string());
    assert_eq!(actions, [Action::Close, Action::Insert, Action::Update]);
    assert_eq!(report.failed(), 3);

    assert_eq!(registry.recompute_count(), 0);
    assert_eq!(summary.recompute, RecomputeStatus::NotNeeded);

    assert!(watermark::store_path_at(&ws.state_dir()).exists());
    let store = watermark::load_at(&ws.state_dir()).unwrap();
    assert!(store.trials.is_empty(), "got: {:?}", store.trials);
}
