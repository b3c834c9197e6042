//! Scheduling rules and background jobs under contention.
//!
//! # Sections
//!
//! - **Rules:** disjoint scopes run together, overlapping scopes queue
//! - **Timeouts and cancellation:** nothing is held after a failed wait
//! - **Jobs:** spawn, wait, cancel, join

use std::sync::Arc;
use std::time::Duration;

use canopy_kernel::{
    ResourceKind, ResourcePath, SchedulingRule, UpdateFlags, Workspace, WorkspaceConfig,
    WorkspaceError,
};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Shared test setup
// ============================================================================

fn p(s: &str) -> ResourcePath {
    ResourcePath::parse(s).unwrap()
}

const NONE: UpdateFlags = UpdateFlags::empty();

fn rule(s: &str) -> SchedulingRule {
    SchedulingRule::new(p(s))
}

/// Project `P` with empty folders `a` and `b`.
async fn workspace() -> Arc<Workspace> {
    let ws = Workspace::in_memory().unwrap();
    ws.create(&p("/P"), ResourceKind::Project, NONE).await.unwrap();
    ws.create(&p("/P/a"), ResourceKind::Folder, NONE).await.unwrap();
    ws.create(&p("/P/b"), ResourceKind::Folder, NONE).await.unwrap();
    ws
}

async fn until_waiting(ws: &Workspace, count: usize) {
    while ws.rules().waiting() < count {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Rules
// ============================================================================

#[tokio::test]
async fn test_sibling_rules_run_together_and_parent_waits() {
    let ws = workspace().await;
    let mut op_a = ws.begin(rule("/P/a")).await.unwrap();
    let mut op_b = ws.begin(rule("/P/b")).await.unwrap();
    assert_eq!(ws.rules().held().len(), 2);

    let whole = {
        let ws = ws.clone();
        tokio::spawn(async move {
            let mut op = ws.begin(rule("/P")).await?;
            // sees both siblings' work
            let seen = op.exists(&p("/P/a/x")) && op.exists(&p("/P/b/y"));
            op.create(&p("/P/c"), ResourceKind::Folder, NONE).await?;
            op.commit().await?;
            Ok::<_, WorkspaceError>(seen)
        })
    };
    until_waiting(&ws, 1).await;
    assert!(!whole.is_finished());

    op_a.create_file(&p("/P/a/x"), b"x", NONE).await.unwrap();
    op_b.create_file(&p("/P/b/y"), b"y", NONE).await.unwrap();
    op_a.commit().await.unwrap();
    assert_eq!(ws.rules().waiting(), 1);
    op_b.commit().await.unwrap();

    assert!(whole.await.unwrap().unwrap());
    assert!(ws.exists(&p("/P/c")));
    assert!(ws.rules().held().is_empty());
}

#[tokio::test]
async fn test_queued_parent_blocks_later_children() {
    let ws = workspace().await;
    let holder = ws.begin(rule("/P/a")).await.unwrap();

    let whole = {
        let ws = ws.clone();
        tokio::spawn(async move {
            let op = ws.begin(rule("/P")).await?;
            op.commit().await?;
            Ok::<_, WorkspaceError>(())
        })
    };
    until_waiting(&ws, 1).await;

    // /P/b is free, but /P asked first
    let err = ws
        .begin_with(rule("/P/b"), &CancellationToken::new(), Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::LockTimeout(_)));
    assert_eq!(ws.rules().waiting(), 1);

    // an unrelated project is not held back
    let other = ws.begin(rule("/Q")).await.unwrap();
    other.abort().await;

    holder.abort().await;
    whole.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jobs_fill_disjoint_folders_in_parallel() {
    let ws = workspace().await;

    let mut jobs = Vec::new();
    for folder in ["/P/a", "/P/b"] {
        let folder = p(folder);
        jobs.push(ws.spawn_job(format!("fill {folder}"), move |ctx| async move {
            let mut op = ctx.begin(SchedulingRule::new(folder.clone())).await?;
            for i in 0..20 {
                op.create_file(&folder.append(&format!("f{i:02}")), b"", NONE)
                    .await?;
            }
            op.commit().await?;
            Ok::<_, WorkspaceError>(20usize)
        }));
    }

    let never = CancellationToken::new();
    let mut total = 0;
    for job in &mut jobs {
        total += job.wait(Some(Duration::from_secs(10)), &never).await.unwrap();
        assert!(job.is_finished());
    }
    assert_eq!(total, 40);
    assert_eq!(ws.members(&p("/P/a")).len(), 20);
    assert_eq!(ws.members(&p("/P/b")).len(), 20);
}

#[tokio::test]
async fn test_one_call_operations_serialize() {
    let ws = workspace().await;
    let mut tasks = Vec::new();
    for i in 0..10 {
        let ws = ws.clone();
        tasks.push(tokio::spawn(async move {
            ws.create_file(&p(&format!("/P/a/f{i}")), b"", NONE).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(ws.members(&p("/P/a")).len(), 10);
}

// ============================================================================
// Timeouts and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_configured_lock_timeout() {
    let ws = Workspace::builder(WorkspaceConfig {
        lock_timeout_ms: Some(50),
        ..WorkspaceConfig::default()
    })
    .build()
    .unwrap();
    let holder = ws.begin(SchedulingRule::root()).await.unwrap();

    let err = ws
        .create(&p("/P"), ResourceKind::Project, NONE)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::LockTimeout(_)));
    assert_eq!(ws.rules().waiting(), 0);

    holder.abort().await;
    ws.create(&p("/P"), ResourceKind::Project, NONE).await.unwrap();
}

#[tokio::test]
async fn test_cancel_abandons_rule_wait() {
    let ws = workspace().await;
    let holder = ws.begin(rule("/P")).await.unwrap();
    let cancel = CancellationToken::new();

    let waiter = {
        let ws = ws.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match ws.begin_with(rule("/P/a"), &cancel, None).await {
                Ok(op) => {
                    op.abort().await;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        })
    };
    until_waiting(&ws, 1).await;
    cancel.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, WorkspaceError::OperationCanceled));
    assert_eq!(ws.rules().waiting(), 0);
    assert_eq!(ws.rules().held().len(), 1);
    holder.abort().await;
}

#[tokio::test]
async fn test_canceled_token_stops_batch_steps() {
    let ws = workspace().await;
    let cancel = CancellationToken::new();
    let mut op = ws.begin_with(rule("/P"), &cancel, None).await.unwrap();
    op.create(&p("/P/c"), ResourceKind::Folder, NONE).await.unwrap();

    cancel.cancel();
    let err = op.create(&p("/P/d"), ResourceKind::Folder, NONE).await.unwrap_err();
    assert!(matches!(err, WorkspaceError::OperationCanceled));
    let err = op.copy(&p("/P/a"), &p("/P/a2"), NONE).await.unwrap_err();
    assert!(matches!(err, WorkspaceError::OperationCanceled));
    op.abort().await;
    assert!(!ws.exists(&p("/P/c")));
}

// ============================================================================
// Jobs
// ============================================================================

#[tokio::test]
async fn test_job_cancel_reaches_rule_wait() {
    let ws = workspace().await;
    let holder = ws.begin(rule("/P")).await.unwrap();

    let mut job = ws.spawn_job("blocked", |ctx| async move {
        let op = ctx.begin(rule("/P/a")).await?;
        op.commit().await?;
        Ok::<_, WorkspaceError>(())
    });
    until_waiting(&ws, 1).await;
    job.cancel();

    let err = job.wait(None, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, WorkspaceError::OperationCanceled));
    holder.abort().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_leaves_job_running() {
    let ws = workspace().await;
    let holder = ws.begin(rule("/P")).await.unwrap();

    let mut job = ws.spawn_job("late", |ctx| async move {
        let mut op = ctx.begin(rule("/P/a")).await?;
        op.create(&p("/P/a/late"), ResourceKind::Folder, NONE).await?;
        op.commit().await?;
        Ok::<_, WorkspaceError>("done")
    });
    assert_eq!(job.name(), "late");
    until_waiting(&ws, 1).await;

    let never = CancellationToken::new();
    let err = job
        .wait(Some(Duration::from_millis(20)), &never)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::WaitTimeout(_)));
    assert!(!job.is_finished());

    // a canceled wait does not cancel the job either
    let impatient = CancellationToken::new();
    impatient.cancel();
    assert!(matches!(
        job.wait(None, &impatient).await,
        Err(WorkspaceError::OperationCanceled)
    ));

    holder.abort().await;
    assert_eq!(job.wait(None, &never).await.unwrap(), "done");
    assert!(ws.exists(&p("/P/a/late")));
    assert!(matches!(
        job.wait(None, &never).await,
        Err(WorkspaceError::JobFailed { .. })
    ));
}

#[tokio::test]
async fn test_panicking_job_reports_failure() {
    let ws = workspace().await;
    let mut job = ws.spawn_job("boom", |_ctx| async move {
        if true {
            panic!("boom");
        }
        Ok::<_, WorkspaceError>(())
    });
    let err = job.wait(None, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, WorkspaceError::JobFailed { job: id, .. } if id == job.id()));
}

#[tokio::test]
async fn test_job_batches_run_under_the_job_id() {
    let ws = workspace().await;
    let mut job = ws.spawn_job("nested", |ctx| async move {
        let mut op = ctx.begin(rule("/P")).await?;
        assert_eq!(op.job(), ctx.id);

        // a second batch while the first is open would wait on itself
        let err = ctx.begin(rule("/P/a")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::IllegalNesting { .. }));

        op.create(&p("/P/a/inner"), ResourceKind::Folder, NONE).await?;
        op.commit().await?;

        let op = ctx.begin(rule("/P/a")).await?;
        assert_eq!(op.job(), ctx.id);
        op.commit().await?;
        Ok::<_, WorkspaceError>(())
    });

    let never = CancellationToken::new();
    job.wait(Some(Duration::from_secs(5)), &never).await.unwrap();
    assert!(ws.exists(&p("/P/a/inner")));
    assert!(ws.rules().held().is_empty());
}

#[tokio::test]
async fn test_dropped_begin_does_not_block_later_rules() {
    let ws = workspace().await;
    let holder = ws.begin(rule("/P/a")).await.unwrap();

    let gave_up = tokio::time::timeout(Duration::from_millis(20), ws.begin(rule("/P"))).await;
    assert!(gave_up.is_err());
    assert_eq!(ws.rules().waiting(), 0);

    holder.abort().await;
    let op = ws
        .begin_with(rule("/P/b"), &CancellationToken::new(), Some(Duration::from_millis(200)))
        .await
        .unwrap();
    op.commit().await.unwrap();
}

#[tokio::test]
async fn test_join_waits_for_conflicting_jobs() {
    let ws = workspace().await;
    let holder = ws.begin(rule("/P/a")).await.unwrap();
    let never = CancellationToken::new();

    // unrelated scopes do not wait
    ws.join(&rule("/P/b"), &never, None).await.unwrap();
    let err = ws
        .join(&rule("/P"), &never, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkspaceError::WaitTimeout(_)));

    let joiner = {
        let ws = ws.clone();
        tokio::spawn(async move { ws.join(&rule("/P"), &CancellationToken::new(), None).await })
    };
    tokio::task::yield_now().await;
    assert!(!joiner.is_finished());

    holder.commit().await.unwrap();
    joiner.await.unwrap().unwrap();
}
