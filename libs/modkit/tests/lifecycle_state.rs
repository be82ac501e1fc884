//! Status observed from outside a module's background worker.

use modkit::lifecycle::{Lifecycle, LifecycleError, Status, StopReason};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn until(lc: &Lifecycle, wanted: Status) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while lc.status() != wanted {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("status did not change in time");
}

fn idle_worker(lc: &Lifecycle) {
    lc.start(|cancel| async move {
        cancel.cancelled().await;
        Ok(())
    })
    .unwrap();
}

#[tokio::test]
async fn fresh_lifecycle_is_stopped() {
    let lc = Lifecycle::default();
    assert_eq!(lc.status(), Status::Stopped);
    assert!(!lc.is_running());
    assert_eq!(
        lc.stop(Duration::from_millis(50)).await.unwrap(),
        StopReason::Finished
    );
}

#[tokio::test]
async fn worker_is_starting_until_bound() {
    let lc = Lifecycle::new();
    let (bound_tx, bound_rx) = tokio::sync::oneshot::channel::<()>();
    lc.start_with_ready_and_token(CancellationToken::new(), |cancel, ready| async move {
        let _ = bound_rx.await;
        ready.notify();
        cancel.cancelled().await;
        Ok(())
    })
    .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(lc.status(), Status::Starting);

    bound_tx.send(()).unwrap();
    until(&lc, Status::Running).await;

    let reason = lc.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reason, StopReason::Cancelled);
    assert_eq!(lc.status(), Status::Stopped);
}

#[tokio::test]
async fn unready_worker_still_stops() {
    let lc = Lifecycle::new();
    lc.start_with_ready_and_token(CancellationToken::new(), |cancel, _ready| async move {
        cancel.cancelled().await;
        Ok(())
    })
    .unwrap();

    let reason = lc.stop(Duration::from_millis(200)).await.unwrap();
    assert_eq!(reason, StopReason::Cancelled);
    assert_eq!(lc.status(), Status::Stopped);
}

#[tokio::test]
async fn app_token_cancels_the_worker() {
    let app_token = CancellationToken::new();
    let lc = Lifecycle::new();
    lc.start_with_token(app_token.child_token(), |cancel| async move {
        cancel.cancelled().await;
        Ok(())
    })
    .unwrap();
    assert!(lc.is_running());

    app_token.cancel();
    tokio::time::timeout(Duration::from_secs(1), lc.wait_stopped())
        .await
        .unwrap();
    assert_eq!(
        lc.stop(Duration::from_millis(50)).await.unwrap(),
        StopReason::Finished
    );
}

#[tokio::test]
async fn failed_worker_reports_finished() {
    let lc = Lifecycle::new();
    lc.start(|_cancel| async move { anyhow::bail!("listener closed") })
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), lc.wait_stopped())
        .await
        .unwrap();
    assert_eq!(
        lc.stop(Duration::from_millis(50)).await.unwrap(),
        StopReason::Finished
    );
}

#[tokio::test]
async fn stubborn_worker_is_aborted() {
    let lc = Lifecycle::new();
    lc.start(|_cancel| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    })
    .unwrap();

    let reason = lc.stop(Duration::from_millis(20)).await.unwrap();
    assert_eq!(reason, StopReason::Timeout);
    assert_eq!(lc.status(), Status::Stopped);
}

#[tokio::test]
async fn running_worker_rejects_a_second_start() {
    let lc = Lifecycle::new();
    idle_worker(&lc);
    assert!(matches!(
        lc.start(|_c| async { Ok(()) }),
        Err(LifecycleError::AlreadyStarted)
    ));
    lc.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn worker_restarts_after_stop() {
    let lc = Lifecycle::new();
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let runs = runs.clone();
        lc.start(move |cancel| async move {
            runs.fetch_add(1, Ordering::SeqCst);
            cancel.cancelled().await;
            Ok(())
        })
        .unwrap();
        tokio::task::yield_now().await;
        lc.stop(Duration::from_secs(1)).await.unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
