use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};

use crate::fixtures::game_server;
use crate::workerqueue::WorkerQueue;

#[test]
fn key_for_derives_namespaced_keys() {
    let gs = game_server("test");
    assert_eq!(WorkerQueue::key_for(&gs).as_deref(), Some("default/test"));

    let mut nameless = game_server("test");
    nameless.metadata.name = None;
    assert_eq!(WorkerQueue::key_for(&nameless), None);
}

#[test]
fn split_key_rejects_malformed_keys() {
    assert_eq!(WorkerQueue::split_key("default/test"), Some(("default", "test")));
    assert_eq!(WorkerQueue::split_key("no-namespace"), None);
    assert_eq!(WorkerQueue::split_key("/test"), None);
    assert_eq!(WorkerQueue::split_key("default/"), None);
}

#[tokio::test]
async fn workers_process_enqueued_keys() -> Result<()> {
    let queue = WorkerQueue::new("test");
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = move |key: String| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(key);
            anyhow::Ok(())
        }
    };
    let run = {
        let queue = queue.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move { queue.run(2, handler, shutdown_tx).await })
    };

    queue.enqueue(&game_server("one"));
    queue.enqueue_key_immediately("default/two".to_string());

    let mut got = vec![
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.unwrap(),
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.unwrap(),
    ];
    got.sort();
    assert_eq!(got, vec!["default/one".to_string(), "default/two".to_string()]);

    let _ = shutdown_tx.send(());
    run.await??;
    Ok(())
}

#[tokio::test]
async fn repeated_enqueues_coalesce_into_one_pass() -> Result<()> {
    let queue = WorkerQueue::new("test");
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let processed = Arc::new(AtomicUsize::new(0));

    // Pile the same key up before any worker is running.
    for _ in 0..10 {
        queue.enqueue_key_immediately("default/test".to_string());
    }

    let handler = {
        let processed = processed.clone();
        move |_key: String| {
            let processed = processed.clone();
            async move {
                processed.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        }
    };
    let run = {
        let queue = queue.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move { queue.run(2, handler, shutdown_tx).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 1, "coalesced key should be processed exactly once");

    let _ = shutdown_tx.send(());
    run.await??;
    Ok(())
}

#[tokio::test]
async fn failed_keys_are_retried_with_backoff() -> Result<()> {
    let queue = WorkerQueue::new("test");
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = {
        let attempts = attempts.clone();
        move |key: String| {
            let attempts = attempts.clone();
            let tx = tx.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                let _ = tx.send(key);
                Ok(())
            }
        }
    };
    let run = {
        let queue = queue.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move { queue.run(1, handler, shutdown_tx).await })
    };

    queue.enqueue_key_immediately("default/test".to_string());
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.unwrap();
    assert_eq!(got, "default/test");
    assert_eq!(attempts.load(Ordering::SeqCst), 2, "expected one failure and one successful retry");

    let _ = shutdown_tx.send(());
    run.await??;
    Ok(())
}

#[tokio::test]
async fn healthy_reflects_worker_count() -> Result<()> {
    let queue = WorkerQueue::new("test");
    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    // Nothing requested, nothing running.
    assert!(queue.healthy().is_ok());

    let run = {
        let queue = queue.clone();
        let shutdown_tx = shutdown_tx.clone();
        let handler = |_key: String| async move { anyhow::Ok(()) };
        tokio::spawn(async move { queue.run(2, handler, shutdown_tx).await })
    };

    // Wait for both workers to come up.
    let mut healthy = false;
    for _ in 0..50 {
        if queue.healthy().is_ok() && queue.run_count() == 2 {
            healthy = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(healthy, "expected 2 workers to report running, got {}", queue.run_count());

    let _ = shutdown_tx.send(());
    run.await??;

    // Workers drained: want 2, got 0.
    assert!(queue.healthy().is_err());
    assert_eq!(queue.run_count(), 0);
    Ok(())
}
