//! Shared harness for exercising both manager strategies over the
//! in-memory backend.

#![allow(dead_code)]

use std::sync::Arc;

use strata_core::{CallContext, Clock, ConfigurationStore, RealmId, SimulatedClock};
use strata_metastore::entity::{Entity, EntityCore, EntitySubType, EntityType, NULL_ID, ROOT_ENTITY_ID};
use strata_metastore::manager::{CreatedCatalog, CreatedPrincipal, MetastoreManager};
use strata_metastore::persistence::memory::InMemoryStore;
use strata_metastore::task::TASK_TIMEOUT_MILLIS_CONFIG;
use strata_metastore::{AtomicMetastore, TransactionalMetastore};

/// Task lease timeout used by the harness, short enough to cross in tests.
pub const TEST_TASK_TIMEOUT_MILLIS: i64 = 5_000;

/// Which manager strategy a harness runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Atomic,
    Transactional,
}

/// One strategy wired to a fresh in-memory store with a simulated clock.
pub struct Harness {
    pub strategy: Strategy,
    pub store: Arc<InMemoryStore>,
    pub manager: Arc<dyn MetastoreManager>,
    pub ctx: CallContext,
    pub clock: Arc<SimulatedClock>,
}

/// Builds a manager of the given strategy over an existing store.
pub fn manager_over(strategy: Strategy, store: Arc<InMemoryStore>) -> Arc<dyn MetastoreManager> {
    match strategy {
        Strategy::Atomic => Arc::new(AtomicMetastore::new(store)),
        Strategy::Transactional => Arc::new(TransactionalMetastore::new(store)),
    }
}

/// Builds a fresh harness for one strategy.
pub fn harness(strategy: Strategy) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(SimulatedClock::starting_now());
    let clock_handle: Arc<dyn Clock> = clock.clone();
    let config = ConfigurationStore::new().with(TASK_TIMEOUT_MILLIS_CONFIG, TEST_TASK_TIMEOUT_MILLIS);
    let ctx = CallContext::new(RealmId::new_unchecked("test-realm"))
        .with_clock(clock_handle)
        .with_config(config);
    Harness {
        strategy,
        manager: manager_over(strategy, store.clone()),
        store,
        ctx,
        clock,
    }
}

/// Both strategies, for contract tests that must hold for each.
pub fn harnesses() -> Vec<Harness> {
    vec![harness(Strategy::Atomic), harness(Strategy::Transactional)]
}

pub async fn bootstrap(h: &Harness) {
    h.manager.bootstrap_service(&h.ctx).await.expect("bootstrap");
}

pub async fn create_catalog(h: &Harness, name: &str) -> CreatedCatalog {
    let id = h.manager.generate_new_entity_id(&h.ctx).await.expect("id");
    let catalog = Entity::new(
        NULL_ID,
        id,
        EntityType::Catalog,
        EntitySubType::Null,
        ROOT_ENTITY_ID,
        name,
    );
    h.manager
        .create_catalog(&h.ctx, catalog, &[])
        .await
        .expect("create catalog")
}

pub async fn create_namespace(
    h: &Harness,
    catalog: &Entity,
    parent: Option<&Entity>,
    name: &str,
) -> Entity {
    let id = h.manager.generate_new_entity_id(&h.ctx).await.expect("id");
    let parent_id = parent.map_or(catalog.id, |p| p.id);
    let namespace = Entity::new(
        catalog.id,
        id,
        EntityType::Namespace,
        EntitySubType::Null,
        parent_id,
        name,
    );
    let mut path = vec![EntityCore::from(catalog)];
    if let Some(parent) = parent {
        path.push(EntityCore::from(parent));
    }
    h.manager
        .create_entity_if_not_exists(&h.ctx, &path, namespace)
        .await
        .expect("create namespace")
}

pub async fn create_table(
    h: &Harness,
    catalog: &Entity,
    namespace: &Entity,
    name: &str,
) -> Entity {
    let id = h.manager.generate_new_entity_id(&h.ctx).await.expect("id");
    let table = Entity::new(
        catalog.id,
        id,
        EntityType::TableLike,
        EntitySubType::Table,
        namespace.id,
        name,
    );
    let path = vec![EntityCore::from(catalog), EntityCore::from(namespace)];
    h.manager
        .create_entity_if_not_exists(&h.ctx, &path, table)
        .await
        .expect("create table")
}

pub async fn create_principal(h: &Harness, name: &str) -> CreatedPrincipal {
    let id = h.manager.generate_new_entity_id(&h.ctx).await.expect("id");
    let principal = Entity::new(
        NULL_ID,
        id,
        EntityType::Principal,
        EntitySubType::Null,
        ROOT_ENTITY_ID,
        name,
    );
    h.manager
        .create_principal(&h.ctx, principal)
        .await
        .expect("create principal")
}

pub async fn create_task(h: &Harness, name: &str) -> Entity {
    let id = h.manager.generate_new_entity_id(&h.ctx).await.expect("id");
    let task = Entity::new(
        NULL_ID,
        id,
        EntityType::Task,
        EntitySubType::Null,
        ROOT_ENTITY_ID,
        name,
    );
    h.manager
        .create_entity_if_not_exists(&h.ctx, &[], task)
        .await
        .expect("create task")
}

pub async fn read_top_level(h: &Harness, entity_type: EntityType, name: &str) -> Entity {
    h.manager
        .read_entity_by_name(&h.ctx, &[], entity_type, EntitySubType::Any, name)
        .await
        .expect("read by name")
}
