//! Postgres store behavior against a live database.
//!
//! These tests need a reachable server; they skip when `DATABASE_URL` is not
//! set so the default test run stays database-free.

#![cfg(feature = "postgres")]

use std::sync::Arc;
use std::time::Duration;

use docflow_core::models::{TaskParams, TaskType};
use docflow_core::state_machine::TaskStatus;
use docflow_core::store::{PgTaskStore, TaskStore};
use docflow_core::Task;

async fn store() -> Option<(sqlx::PgPool, Arc<PgTaskStore>)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .ok()?;
    let store = Arc::new(PgTaskStore::new(pool.clone()));
    store.migrate().await.ok()?;
    Some((pool, store))
}

#[tokio::test]
async fn concurrent_claims_never_exceed_the_ceiling() {
    let Some((pool, store)) = store().await else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };
    sqlx::query("DELETE FROM docflow_tasks")
        .execute(&pool)
        .await
        .unwrap();

    for i in 0..10 {
        store
            .insert_task(Task::new(
                TaskType::FullPipeline,
                format!("doc-{i}"),
                TaskParams::default(),
            ))
            .await
            .unwrap();
    }

    // Race eight claimers on separate connections against a ceiling of three
    let mut claimers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            store.claim_next(3, Duration::from_secs(30)).await
        }));
    }

    let mut claimed_ids = std::collections::HashSet::new();
    let mut granted = 0;
    for claimer in claimers {
        if let Some(task) = claimer.await.unwrap().unwrap() {
            granted += 1;
            assert!(
                claimed_ids.insert(task.task_id),
                "two claimers received the same task"
            );
            assert_eq!(task.status, TaskStatus::Running);
            assert!(task.lease.is_some());
        }
    }

    assert_eq!(granted, 3, "running tasks exceeded the ceiling");
    let counts = store.queue_counts().await.unwrap();
    assert_eq!(counts.running, 3);
    assert_eq!(counts.queued, 7);
    assert!(store
        .claim_next(3, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}
