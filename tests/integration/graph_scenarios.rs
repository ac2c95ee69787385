//! Readiness and failure propagation through the graph actor.
//!
//! These run the canonical scenarios against `GraphHandle`, the serialized
//! control surface every worker and the coordinator go through.

use std::time::Duration;

use cadre::core::dag::{EdgeKind, TaskFilter, TaskGraph, TaskUpdate};
use cadre::core::task::{FailureReason, TaskId, TaskOutput, TaskSpec, TaskStatus};
use cadre::orchestration::{GraphHandle, Readiness, WorkerId};
use cadre::Error;

async fn task(graph: &GraphHandle, key: &str) -> TaskId {
    graph.create_task(TaskSpec::new(key, key)).await.unwrap()
}

async fn block(graph: &GraphHandle, task: TaskId, blocker: TaskId, kind: EdgeKind) {
    graph
        .update_task(
            task,
            TaskUpdate {
                add_blocked_by: vec![(blocker, kind)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

async fn finish(graph: &GraphHandle, task: TaskId) -> Vec<TaskId> {
    graph.start(task, WorkerId::new()).await.unwrap();
    graph.complete(task, TaskOutput::default()).await.unwrap().unblocked
}

async fn fail(graph: &GraphHandle, task: TaskId, message: &str) -> Vec<TaskId> {
    graph.start(task, WorkerId::new()).await.unwrap();
    graph
        .fail(task, FailureReason::worker_error(message))
        .await
        .unwrap()
        .cascaded
}

async fn status(graph: &GraphHandle, task: TaskId) -> TaskStatus {
    graph.get_task(task).await.unwrap().unwrap().status
}

/// Test: Linear chain
/// Given A and B blocked-required-by A
/// When A then B complete
/// Then B becomes ready after A and the graph ends terminal
#[tokio::test]
async fn test_linear_chain_reaches_terminal() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;
    let b = task(&graph, "b").await;
    block(&graph, b, a, EdgeKind::Required).await;

    assert_eq!(graph.ready_tasks().await.unwrap(), vec![a]);
    assert_eq!(status(&graph, b).await, TaskStatus::Blocked);

    finish(&graph, a).await;
    assert!(graph.ready_tasks().await.unwrap().contains(&b));
    assert!(!graph.is_terminal().await.unwrap());

    finish(&graph, b).await;
    assert!(graph.is_terminal().await.unwrap());
}

/// Test: Required failure wins over optional state
/// Given C blocked by A (required) and B (optional)
/// When A fails while B is still pending
/// Then C cascades to Failed naming A
#[tokio::test]
async fn test_required_failure_cascades() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;
    let b = task(&graph, "b").await;
    let c = task(&graph, "c").await;
    block(&graph, c, a, EdgeKind::Required).await;
    block(&graph, c, b, EdgeKind::Optional).await;

    let cascaded = fail(&graph, a, "boom").await;
    assert_eq!(cascaded, vec![c]);
    match status(&graph, c).await {
        TaskStatus::Failed { reason } => assert_eq!(
            reason,
            FailureReason::UpstreamFailed {
                blocker: a,
                blocker_key: "a".to_string()
            }
        ),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(status(&graph, b).await, TaskStatus::Pending);
}

/// Test: Optional failure only annotates
/// Given C blocked by A (required) and B (optional)
/// When A succeeds and B fails
/// Then C is ready, carries the missing-source annotation and is not failed
#[tokio::test]
async fn test_optional_failure_annotates() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;
    let b = task(&graph, "b").await;
    let c = task(&graph, "c").await;
    block(&graph, c, a, EdgeKind::Required).await;
    block(&graph, c, b, EdgeKind::Optional).await;

    finish(&graph, a).await;
    let cascaded = fail(&graph, b, "rate limited").await;
    assert!(cascaded.is_empty());

    let c_task = graph.get_task(c).await.unwrap().unwrap();
    assert_eq!(c_task.status, TaskStatus::Pending);
    assert!(graph.ready_tasks().await.unwrap().contains(&c));
    let missing: Vec<_> = c_task.missing_sources().collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].blocker, b);
    assert!(missing[0].outcome.is_failed());
}

/// Test: Diamond fan-in
/// Given A -> {B, C} -> D
/// When A completes, then B and C in either order
/// Then B and C are ready together and D is unblocked exactly once
#[tokio::test]
async fn test_diamond_unblocks_once() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;
    let b = task(&graph, "b").await;
    let c = task(&graph, "c").await;
    let d = task(&graph, "d").await;
    block(&graph, b, a, EdgeKind::Required).await;
    block(&graph, c, a, EdgeKind::Required).await;
    block(&graph, d, b, EdgeKind::Required).await;
    block(&graph, d, c, EdgeKind::Required).await;

    let mut unblocked = finish(&graph, a).await;
    unblocked.sort();
    assert_eq!(unblocked, vec![b, c]);

    let first = finish(&graph, c).await;
    assert!(first.is_empty());
    let second = finish(&graph, b).await;
    assert_eq!(second, vec![d]);

    let ready = graph
        .list_tasks(TaskFilter {
            ready_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ready.iter().filter(|t| t.id == d).count(), 1);
}

/// Test: Cycle rejection through the control surface
#[tokio::test]
async fn test_cycle_rejected() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;
    let b = task(&graph, "b").await;
    block(&graph, b, a, EdgeKind::Required).await;

    let err = graph
        .update_task(
            a,
            TaskUpdate {
                add_blocked_by: vec![(b, EdgeKind::Optional)],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    assert_eq!(graph.get_task(a).await.unwrap().unwrap().blocked_by.len(), 0);
}

/// Test: A parked waiter wakes when its blocker completes
#[tokio::test]
async fn test_waiter_parks_until_ready() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;
    let b = task(&graph, "b").await;
    block(&graph, b, a, EdgeKind::Required).await;

    let waiter = {
        let graph = graph.clone();
        tokio::spawn(async move { graph.wait_until_ready_for(b, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    finish(&graph, a).await;
    assert_eq!(waiter.await.unwrap().unwrap(), Readiness::Ready);
}

/// Test: At most one owner
/// Given many workers racing to claim one ready task
/// Then exactly one claim succeeds
#[tokio::test]
async fn test_racing_claims_have_single_winner() {
    let (graph, _join) = GraphHandle::spawn(TaskGraph::new());
    let a = task(&graph, "a").await;

    let claims = (0..16).map(|_| {
        let graph = graph.clone();
        tokio::spawn(async move { graph.claim(a, WorkerId::new()).await.is_ok() })
    });
    let wins = futures::future::join_all(claims)
        .await
        .into_iter()
        .filter(|won| *won.as_ref().unwrap())
        .count();
    assert_eq!(wins, 1);
}
