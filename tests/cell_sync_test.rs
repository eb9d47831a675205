//! JSONL export/import round trips and the dirty-cell drain.

mod helpers;

use hivemind::domain::models::cell::{CellType, DependencyKind, NewCell};
use hivemind::services::{CellService, EventService, SyncService};

fn services(events: &EventService) -> (CellService, SyncService) {
    let cells = CellService::new(events.clone());
    let sync = SyncService::new(events.clone(), cells.clone());
    (cells, sync)
}

/// Epic with two children, a label, and a comment; the scenario from the
/// sync round-trip contract.
async fn seed_epic(cells: &CellService) -> (String, String, String) {
    let epic = cells
        .create("/p", NewCell::task("Ship auth").with_type(CellType::Epic).with_id("cell-epic1"))
        .await
        .unwrap();
    let child_a = cells
        .create("/p", NewCell::task("Login form").with_parent(&epic.id).with_id("cell-childa"))
        .await
        .unwrap();
    let child_b = cells
        .create("/p", NewCell::task("Session store").with_parent(&epic.id).with_id("cell-childb"))
        .await
        .unwrap();

    cells.add_label("/p", &epic.id, "urgent").await.unwrap();
    cells.add_comment("/p", &epic.id, "A", "kickoff notes", None).await.unwrap();
    cells
        .add_dependency("/p", &child_b.id, &child_a.id, DependencyKind::Blocks)
        .await
        .unwrap();

    (epic.id, child_a.id, child_b.id)
}

#[tokio::test]
async fn export_import_into_fresh_store_then_reimport() {
    let source_events = helpers::setup_event_service().await;
    let (source_cells, source_sync) = services(&source_events);
    seed_epic(&source_cells).await;

    let jsonl = source_sync.export_all("/p").await.unwrap();
    assert_eq!(jsonl.lines().count(), 3);

    // First import into a fresh store creates everything.
    let target_events = helpers::setup_event_service().await;
    let (_, target_sync) = services(&target_events);
    let first = target_sync.import("/p", &jsonl, false).await.unwrap();
    assert_eq!((first.created, first.updated, first.skipped), (3, 0, 0));

    // A second import of the same JSONL is a no-op.
    let second = target_sync.import("/p", &jsonl, false).await.unwrap();
    assert_eq!((second.created, second.updated, second.skipped), (0, 0, 3));

    // Round trip: the re-export matches the original byte for byte.
    let reexport = target_sync.export_all("/p").await.unwrap();
    assert_eq!(reexport, jsonl);
}

#[tokio::test]
async fn import_back_into_source_is_an_empty_diff() {
    let events = helpers::setup_event_service().await;
    let (cells, sync) = services(&events);
    seed_epic(&cells).await;

    let jsonl = sync.export_all("/p").await.unwrap();
    let report = sync.import("/p", &jsonl, false).await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped, 3);
}

#[tokio::test]
async fn dry_run_reports_without_writing() {
    let source_events = helpers::setup_event_service().await;
    let (source_cells, source_sync) = services(&source_events);
    seed_epic(&source_cells).await;
    let jsonl = source_sync.export_all("/p").await.unwrap();

    let target_events = helpers::setup_event_service().await;
    let (target_cells, target_sync) = services(&target_events);

    let report = target_sync.import("/p", &jsonl, true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.created, 3);
    assert!(target_cells.get("/p", "cell-epic1").await.unwrap().is_none());
}

#[tokio::test]
async fn changed_cell_imports_as_update() {
    let events = helpers::setup_event_service().await;
    let (cells, sync) = services(&events);
    seed_epic(&cells).await;
    let jsonl = sync.export_all("/p").await.unwrap();

    // Mutate one exported line: bump the epic's priority.
    let modified: String = jsonl
        .lines()
        .map(|line| {
            if line.contains("cell-epic1") {
                line.replace("\"priority\":2", "\"priority\":0")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    assert_ne!(modified, jsonl);

    let report = sync.import("/p", &modified, false).await.unwrap();
    assert_eq!((report.created, report.updated, report.skipped), (0, 1, 2));
    assert_eq!(cells.require("/p", "cell-epic1").await.unwrap().priority, 0);
}

#[tokio::test]
async fn malformed_lines_are_invalid() {
    let events = helpers::setup_event_service().await;
    let (_, sync) = services(&events);

    assert!(sync.import("/p", "{not json}", false).await.is_err());

    let bad_status = r#"{"id":"x","title":"t","status":"resting","priority":1,"issue_type":"task","created_at":"2026-01-01T00:00:00Z","updated_at":"2026-01-01T00:00:00Z"}"#;
    assert!(sync.import("/p", bad_status, false).await.is_err());
}

#[tokio::test]
async fn export_dirty_drains_only_on_successful_write() {
    let events = helpers::setup_event_service().await;
    let (cells, sync) = services(&events);
    seed_epic(&cells).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dirty.jsonl");

    let drained = sync.export_dirty("/p", &path).await.unwrap();
    assert_eq!(drained, 3);
    assert!(path.exists());

    // The dirty set is empty until the next mutation.
    assert_eq!(sync.export_dirty("/p", &path).await.unwrap(), 0);

    cells.add_label("/p", "cell-childa", "backend").await.unwrap();
    assert_eq!(sync.export_dirty("/p", &path).await.unwrap(), 1);
}
