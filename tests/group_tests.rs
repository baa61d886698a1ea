//! Task-group tests: submission order, bounded parallelism, cancellation
//! on first error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use cronmesh::error::CronmeshError;
use cronmesh::schedule::group::TaskGroup;

#[tokio::test]
async fn test_serial_group_preserves_submission_order() {
    let root = CancellationToken::new();
    let mut group = TaskGroup::new(&root, 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b", "c"] {
        let order = order.clone();
        group
            .go(move |_| async move {
                order.lock().await.push(name);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
            .await;
    }
    group.wait().await.unwrap();

    assert_eq!(*order.lock().await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_parallelism_is_bounded() {
    let root = CancellationToken::new();
    let mut group = TaskGroup::new(&root, 2);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let active = active.clone();
        let peak = peak.clone();
        group
            .go(move |_| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
    }
    group.wait().await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_first_error_cancels_running_siblings() {
    let root = CancellationToken::new();
    let mut group = TaskGroup::new(&root, 2);
    let sibling_cancelled = Arc::new(AtomicUsize::new(0));

    {
        let seen = sibling_cancelled.clone();
        group
            .go(move |token| async move {
                tokio::select! {
                    _ = token.cancelled() => { seen.fetch_add(1, Ordering::SeqCst); }
                    _ = tokio::time::sleep(Duration::from_secs(10)) => {}
                }
                Ok(())
            })
            .await;
    }
    group
        .go(|_| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err(CronmeshError::TaskFailed("boom".to_string()))
        })
        .await;

    let err = group.wait().await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(sibling_cancelled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queued_tasks_skip_after_error() {
    let root = CancellationToken::new();
    let mut group = TaskGroup::new(&root, 1);
    let ran_after_error = Arc::new(AtomicUsize::new(0));

    group
        .go(|_| async { Err(CronmeshError::TaskFailed("first".to_string())) })
        .await;

    // the error above already fired; this submission must be dropped
    tokio::time::sleep(Duration::from_millis(30)).await;
    {
        let ran = ran_after_error.clone();
        group
            .go(move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
    }

    let err = group.wait().await.unwrap_err();
    assert!(err.to_string().contains("first"));
    assert_eq!(ran_after_error.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_parent_cancellation_stops_submissions() {
    let root = CancellationToken::new();
    let mut group = TaskGroup::new(&root, 1);
    let ran = Arc::new(AtomicUsize::new(0));

    root.cancel();
    {
        let ran = ran.clone();
        group
            .go(move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
    }

    group.wait().await.unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_keeps_first_error_only() {
    let root = CancellationToken::new();
    let mut group = TaskGroup::new(&root, 2);

    group
        .go(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(CronmeshError::TaskFailed("early".to_string()))
        })
        .await;
    group
        .go(|_| async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Err(CronmeshError::TaskFailed("late".to_string()))
        })
        .await;

    let err = group.wait().await.unwrap_err();
    assert!(err.to_string().contains("early"));
}
