//! Races against the manager: concurrent creates, renames and task
//! leases must keep the uniqueness and at-most-once guarantees.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{bootstrap, create_catalog, create_namespace, create_task, harnesses};
use strata_metastore::entity::{Entity, EntityCore, EntitySubType, EntityType};
use strata_metastore::manager::{MetastoreError, MetastoreManager};
use strata_metastore::task::parse_task_state;

/// Concurrent creators of the same active name: exactly one wins.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_creates_one_winner() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let successes = Arc::new(AtomicU32::new(0));
        let collisions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let id = h.manager.generate_new_entity_id(&h.ctx).await.unwrap();
            let namespace = Entity::new(
                created.catalog.id,
                id,
                EntityType::Namespace,
                EntitySubType::Null,
                created.catalog.id,
                "raw",
            );
            let manager = h.manager.clone();
            let ctx = h.ctx.clone();
            let path = catalog_path.clone();
            let successes = successes.clone();
            let collisions = collisions.clone();
            handles.push(tokio::spawn(async move {
                match manager.create_entity_if_not_exists(&ctx, &path, namespace).await {
                    Ok(_) => successes.fetch_add(1, Ordering::SeqCst),
                    Err(MetastoreError::EntityAlreadyExists { .. }) => {
                        collisions.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(successes.load(Ordering::SeqCst), 1, "{:?}", h.strategy);
        assert_eq!(collisions.load(Ordering::SeqCst), 3, "{:?}", h.strategy);
    }
}

/// Two clients rename the same entity from the same starting version:
/// exactly one succeeds, the other observes the concurrent modification.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_renames_one_winner() {
    for h in harnesses() {
        bootstrap(&h).await;
        let created = create_catalog(&h, "prod").await;
        let a = create_namespace(&h, &created.catalog, None, "a").await;
        let catalog_path = vec![EntityCore::from(&created.catalog)];

        let mut handles = Vec::new();
        for target in ["b", "c"] {
            let manager = h.manager.clone();
            let ctx = h.ctx.clone();
            let path = catalog_path.clone();
            let source = EntityCore::from(&a);
            let mut renamed = a.clone();
            renamed.name = target.to_string();
            handles.push(tokio::spawn(async move {
                manager
                    .rename_entity(&ctx, &path, &source, None, renamed)
                    .await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(MetastoreError::TargetEntityConcurrentlyModified(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(wins, 1, "{:?}", h.strategy);
        assert_eq!(conflicts, 1, "{:?}", h.strategy);
    }
}

/// Two executors race for the same tasks: no task is leased twice within
/// one timeout window.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_task_leases_do_not_overlap() {
    for h in harnesses() {
        bootstrap(&h).await;
        create_task(&h, "cleanup-1").await;
        create_task(&h, "cleanup-2").await;

        let mut handles = Vec::new();
        for executor in ["E1", "E2"] {
            let manager = h.manager.clone();
            let ctx = h.ctx.clone();
            handles.push(tokio::spawn(async move {
                manager.load_tasks(&ctx, executor, 10).await
            }));
        }

        let mut leased_ids = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(tasks) => leased_ids.extend(tasks.iter().map(|t| t.id)),
                // Losing every candidate to the other executor surfaces as
                // a retriable conflict; that is a legal outcome.
                Err(MetastoreError::TargetEntityConcurrentlyModified(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let distinct: HashSet<i64> = leased_ids.iter().copied().collect();
        assert_eq!(
            distinct.len(),
            leased_ids.len(),
            "a task was leased twice ({:?})",
            h.strategy
        );
        assert!(leased_ids.len() <= 2);

        // Whatever the interleaving, both tasks carry exactly one attempt.
        for record in h
            .manager
            .list_entities(&h.ctx, &[], EntityType::Task, EntitySubType::Any)
            .await
            .unwrap()
        {
            let task = h
                .manager
                .load_entity(&h.ctx, record.catalog_id, record.id, EntityType::Task)
                .await
                .unwrap();
            assert_eq!(parse_task_state(&task).attempt_count, 1, "{:?}", h.strategy);
        }
    }
}
