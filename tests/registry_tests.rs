//! Registry tests: add/replace/delete semantics, event application,
//! cross-node event propagation.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use cronmesh::catalog::{LogAlarm, MemoryHistory};
use cronmesh::error::CronmeshError;
use cronmesh::schedule::events::TaskEvent;
use cronmesh::schedule::{Scheduler, Trigger};
use test_harness::{assert_eventually, host, shell_descriptor, spawn_worker, testbed};

#[tokio::test]
async fn test_boot_registers_catalog_tasks() {
    let bed = testbed();
    bed.catalog
        .insert_task(shell_descriptor("t1", "hg", "echo 1"))
        .await;
    bed.catalog
        .insert_task(shell_descriptor("t2", "hg", "echo 2"))
        .await;

    bed.scheduler.boot().await.unwrap();

    assert!(bed.scheduler.contains("t1").await);
    assert!(bed.scheduler.contains("t2").await);
    assert!(!bed.scheduler.contains("t3").await);
}

#[tokio::test]
async fn test_boot_skipped_until_installed() {
    let bed = testbed();
    bed.catalog.set_installed(false);
    bed.catalog
        .insert_task(shell_descriptor("t1", "hg", "echo 1"))
        .await;

    bed.scheduler.boot().await.unwrap();
    assert!(!bed.scheduler.contains("t1").await);
}

#[tokio::test]
async fn test_add_twice_is_idempotent() {
    let bed = testbed();
    let desc = shell_descriptor("t1", "hg", "echo 1");

    bed.scheduler.add_task(desc.clone()).await;
    bed.scheduler.add_task(desc).await;

    assert!(bed.scheduler.contains("t1").await);
    // the replaced entry released its lock state; a manual run still works
    assert!(!bed.scheduler.is_running("t1").await.unwrap());
}

#[tokio::test]
async fn test_delete_removes_task() {
    let bed = testbed();
    bed.scheduler
        .add_task(shell_descriptor("t1", "hg", "echo 1"))
        .await;
    assert!(bed.scheduler.contains("t1").await);

    bed.scheduler.delete_task("t1").await;
    assert!(!bed.scheduler.contains("t1").await);

    // deleting again is a no-op
    bed.scheduler.delete_task("t1").await;

    match bed.scheduler.is_running("t1").await {
        Err(CronmeshError::TaskNotFound(id)) => assert_eq!(id, "t1"),
        other => panic!("expected TaskNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_manual_run_of_unknown_task_fails() {
    let bed = testbed();
    let err = bed
        .scheduler
        .run_task("ghost", Trigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, CronmeshError::TaskNotFound(_)));
}

#[tokio::test]
async fn test_apply_event_is_idempotent() {
    let bed = testbed();
    let desc = shell_descriptor("t1", "hg", "echo 1");

    let add = TaskEvent::Add {
        task_id: "t1".to_string(),
        descriptor: Some(desc),
    };
    bed.scheduler.apply_event(add.clone()).await;
    bed.scheduler.apply_event(add).await;
    assert!(bed.scheduler.contains("t1").await);

    let delete = TaskEvent::Delete {
        task_id: "t1".to_string(),
    };
    bed.scheduler.apply_event(delete.clone()).await;
    bed.scheduler.apply_event(delete).await;
    assert!(!bed.scheduler.contains("t1").await);

    // kill of an idle or unknown task is harmless
    bed.scheduler
        .apply_event(TaskEvent::Kill {
            task_id: "t1".to_string(),
        })
        .await;
}

#[tokio::test]
async fn test_add_event_falls_back_to_catalog() {
    let bed = testbed();
    bed.catalog
        .insert_task(shell_descriptor("t1", "hg", "echo 1"))
        .await;

    bed.scheduler
        .apply_event(TaskEvent::Add {
            task_id: "t1".to_string(),
            descriptor: None,
        })
        .await;
    assert!(bed.scheduler.contains("t1").await);
}

/// An add published on one control-plane node reaches a peer subscribed
/// to the same store.
#[tokio::test]
async fn test_events_propagate_between_peers() {
    let bed = testbed();
    bed.scheduler.boot().await.unwrap();

    let peer = Scheduler::new(
        bed.store.clone(),
        bed.catalog.clone(),
        Arc::new(MemoryHistory::new()),
        Arc::new(LogAlarm),
    );
    peer.boot().await.unwrap();

    bed.scheduler
        .publish_event(&TaskEvent::Add {
            task_id: "t1".to_string(),
            descriptor: Some(shell_descriptor("t1", "hg", "echo 1")),
        })
        .await;

    let peer_probe = peer.clone();
    assert_eventually(
        || async { peer_probe.contains("t1").await },
        Duration::from_secs(3),
        "peer did not pick up the add event",
    )
    .await;

    bed.scheduler
        .publish_event(&TaskEvent::Delete {
            task_id: "t1".to_string(),
        })
        .await;
    let peer_probe = peer.clone();
    assert_eventually(
        || async { !peer_probe.contains("t1").await },
        Duration::from_secs(3),
        "peer did not pick up the delete event",
    )
    .await;
}

/// Replacing a task with an unchanged cron expression lets the in-flight
/// run finish; the run log still arrives.
#[tokio::test]
async fn test_replace_keeps_unchanged_run_alive() {
    let bed = testbed();
    let worker = spawn_worker(55151).await;
    bed.catalog
        .insert_host_group("hg", vec![host(&worker.addr)])
        .await;
    let desc = shell_descriptor("t1", "hg", "sleep 0.3; echo done");
    bed.catalog.insert_task(desc.clone()).await;
    bed.scheduler.boot().await.unwrap();

    bed.scheduler.run_task("t1", Trigger::Manual).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bed.scheduler.add_task(desc).await;

    let history = bed.history.clone();
    assert_eventually(
        || async {
            let logs = history.logs().await;
            logs.len() == 1 && logs[0].status == 1
        },
        Duration::from_secs(5),
        "in-flight run did not complete after replace",
    )
    .await;
}
