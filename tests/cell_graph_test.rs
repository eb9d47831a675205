//! Cell graph scenarios: hybrid ready ordering and blocked-cache
//! consistency across status and dependency changes.

mod helpers;

use chrono::{Duration, Utc};
use hivemind::domain::models::cell::{CellPatch, CellStatus, DependencyKind, NewCell, ReadyFilter, ReadyOrder};
use hivemind::domain::models::event::{self, types, NewEvent};
use hivemind::services::CellService;

/// Seed a cell whose created_at lies in the past by appending the creation
/// event directly, the way a JSONL import does.
async fn seed_aged_cell(
    events: &hivemind::services::EventService,
    id: &str,
    priority: i64,
    age: Duration,
) {
    let at = Utc::now() - age;
    let payload = event::CellCreated {
        id: id.to_string(),
        cell_type: "task".to_string(),
        status: "open".to_string(),
        title: id.to_string(),
        description: None,
        priority,
        parent_id: None,
        assignee: None,
        created_by: None,
        created_at: at,
        updated_at: at,
        closed_at: None,
        closed_reason: None,
    };
    events
        .append(NewEvent::new(types::CELL_CREATED, "/p", serde_json::to_value(&payload).unwrap()))
        .await
        .unwrap();
}

#[tokio::test]
async fn hybrid_order_puts_young_by_priority_then_old_by_age() {
    let events = helpers::setup_event_service().await;
    let cells = CellService::new(events.clone());

    // P0: priority 0, 10 minutes old. P3: priority 3, 60 minutes old.
    // OLD: priority 2, 72 hours old.
    seed_aged_cell(&events, "P0", 0, Duration::minutes(10)).await;
    seed_aged_cell(&events, "P3", 3, Duration::minutes(60)).await;
    seed_aged_cell(&events, "OLD", 2, Duration::hours(72)).await;

    let ready = cells
        .ready_work("/p", ReadyOrder::Hybrid, &ReadyFilter::default())
        .await
        .unwrap();
    let ids: Vec<&str> = ready.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["P0", "P3", "OLD"]);
}

#[tokio::test]
async fn priority_and_oldest_orderings() {
    let events = helpers::setup_event_service().await;
    let cells = CellService::new(events.clone());

    seed_aged_cell(&events, "low-old", 3, Duration::hours(5)).await;
    seed_aged_cell(&events, "high-new", 0, Duration::minutes(1)).await;

    let by_priority = cells
        .ready_work("/p", ReadyOrder::Priority, &ReadyFilter::default())
        .await
        .unwrap();
    assert_eq!(by_priority[0].id, "high-new");

    let by_age = cells
        .ready_work("/p", ReadyOrder::Oldest, &ReadyFilter::default())
        .await
        .unwrap();
    assert_eq!(by_age[0].id, "low-old");
}

#[tokio::test]
async fn blocked_cache_follows_status_transitions() {
    let events = helpers::setup_event_service().await;
    let cells = CellService::new(events);

    let blocker = cells.create("/p", NewCell::task("blocker")).await.unwrap();
    let middle = cells.create("/p", NewCell::task("middle")).await.unwrap();
    let leaf = cells.create("/p", NewCell::task("leaf")).await.unwrap();

    cells.add_dependency("/p", &middle.id, &blocker.id, DependencyKind::Blocks).await.unwrap();
    cells.add_dependency("/p", &leaf.id, &middle.id, DependencyKind::Blocks).await.unwrap();

    assert_eq!(cells.blocked_by(&middle.id).await.unwrap(), vec![blocker.id.clone()]);
    assert_eq!(cells.blocked_by(&leaf.id).await.unwrap(), vec![middle.id.clone()]);

    // Closing the root blocker unblocks the middle cell; the leaf is still
    // blocked because `middle` itself stays open.
    cells.close("/p", &blocker.id, None).await.unwrap();
    assert!(cells.blocked_by(&middle.id).await.unwrap().is_empty());
    assert_eq!(cells.blocked_by(&leaf.id).await.unwrap(), vec![middle.id.clone()]);

    // In-progress still blocks; only closing clears the leaf.
    cells
        .update("/p", &middle.id, CellPatch { status: Some(CellStatus::InProgress), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(cells.blocked_by(&leaf.id).await.unwrap(), vec![middle.id.clone()]);

    cells.close("/p", &middle.id, None).await.unwrap();
    assert!(cells.blocked_by(&leaf.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn blocked_cache_entries_reference_only_live_workable_blockers() {
    let events = helpers::setup_event_service().await;
    let cells = CellService::new(events.clone());

    let b1 = cells.create("/p", NewCell::task("b1")).await.unwrap();
    let b2 = cells.create("/p", NewCell::task("b2")).await.unwrap();
    let target = cells.create("/p", NewCell::task("target")).await.unwrap();
    cells.add_dependency("/p", &target.id, &b1.id, DependencyKind::Blocks).await.unwrap();
    cells.add_dependency("/p", &target.id, &b2.id, DependencyKind::Blocks).await.unwrap();

    cells.close("/p", &b1.id, None).await.unwrap();

    let blockers = cells.blocked_by(&target.id).await.unwrap();
    assert_eq!(blockers, vec![b2.id.clone()]);

    for blocker in blockers {
        let cell = cells.require("/p", &blocker).await.unwrap();
        assert!(cell.status.is_workable());
        assert!(!cell.is_deleted());
    }
}

#[tokio::test]
async fn removing_the_edge_unblocks() {
    let events = helpers::setup_event_service().await;
    let cells = CellService::new(events);

    let blocker = cells.create("/p", NewCell::task("blocker")).await.unwrap();
    let blocked = cells.create("/p", NewCell::task("blocked")).await.unwrap();
    cells.add_dependency("/p", &blocked.id, &blocker.id, DependencyKind::Blocks).await.unwrap();
    assert!(!cells.blocked_by(&blocked.id).await.unwrap().is_empty());

    cells
        .remove_dependency("/p", &blocked.id, &blocker.id, DependencyKind::Blocks)
        .await
        .unwrap();
    assert!(cells.blocked_by(&blocked.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn parent_child_cycle_is_rejected_like_blocks() {
    let events = helpers::setup_event_service().await;
    let cells = CellService::new(events);

    let epic = cells.create("/p", NewCell::task("epic")).await.unwrap();
    let child = cells.create("/p", NewCell::task("child")).await.unwrap();

    cells
        .add_dependency("/p", &child.id, &epic.id, DependencyKind::ParentChild)
        .await
        .unwrap();
    let cycle = cells
        .add_dependency("/p", &epic.id, &child.id, DependencyKind::ParentChild)
        .await;
    assert!(matches!(cycle, Err(hivemind::CoreError::CycleDetected(_))));
}
